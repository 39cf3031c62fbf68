//! Receive side: rebuild an object from its chunk frames, in order.

use crate::chunk::ChunkFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Waiting for the first frame of an object.
    ExpectingSize,
    Receiving,
    /// A frame was rejected; everything is ignored until [`Reassembler::reset`].
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    Progress {
        object_id: u32,
        received: usize,
        total: usize,
    },
    Complete { object_id: u32, bytes: Vec<u8> },
    /// Frame dropped: stale object or receiver in the failed state.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("total size changed mid-object: expected {expected}, got {found}")]
    InvalidSize { expected: usize, found: usize },
    #[error("frame offset {found} does not match position {expected}")]
    InvalidOffset { expected: usize, found: usize },
    #[error("frame of {len} bytes at {offset} overruns object of {total} bytes")]
    Overrun {
        offset: usize,
        len: usize,
        total: usize,
    },
}

impl ReassemblyError {
    /// Numeric code reported to the peer UI (3 = invalid size, 4 = invalid offset).
    pub fn code(&self) -> u8 {
        match self {
            ReassemblyError::InvalidSize { .. } => 3,
            ReassemblyError::InvalidOffset { .. } | ReassemblyError::Overrun { .. } => 4,
        }
    }
}

/// Single-object reassembler. Frames must arrive in offset order, which the sender's
/// one-frame-at-a-time delivery guarantees.
#[derive(Debug)]
pub struct Reassembler {
    state: ReceiverState,
    object_id: u32,
    total: usize,
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            state: ReceiverState::ExpectingSize,
            object_id: 0,
            total: 0,
            buffer: Vec::new(),
        }
    }

    /// Drop any partial object and wait for a new one.
    pub fn reset(&mut self) {
        self.state = ReceiverState::ExpectingSize;
        self.object_id = 0;
        self.total = 0;
        self.buffer = Vec::new();
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Object currently being received, if any.
    pub fn object_id(&self) -> Option<u32> {
        (self.state == ReceiverState::Receiving).then_some(self.object_id)
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn handle_frame(&mut self, frame: &ChunkFrame) -> Result<ReassemblyEvent, ReassemblyError> {
        match self.state {
            ReceiverState::Failed => return Ok(ReassemblyEvent::Ignored),
            ReceiverState::ExpectingSize => {
                if frame.offset != 0 {
                    return Err(self.fail(ReassemblyError::InvalidOffset {
                        expected: 0,
                        found: frame.offset as usize,
                    }));
                }
                self.begin(frame);
            }
            ReceiverState::Receiving if frame.object_id != self.object_id => {
                if frame.offset != 0 {
                    // Leftover of an older transfer.
                    return Ok(ReassemblyEvent::Ignored);
                }
                tracing::debug!(
                    old = self.object_id,
                    new = frame.object_id,
                    received = self.buffer.len(),
                    "new object supersedes partial one"
                );
                self.begin(frame);
            }
            ReceiverState::Receiving if frame.offset == 0 && !self.buffer.is_empty() => {
                // Sender restarted the same object, e.g. after an interrupted run.
                tracing::debug!(
                    object_id = frame.object_id,
                    received = self.buffer.len(),
                    "object restarted from offset 0"
                );
                self.begin(frame);
            }
            ReceiverState::Receiving => {
                if frame.total_size as usize != self.total {
                    return Err(self.fail(ReassemblyError::InvalidSize {
                        expected: self.total,
                        found: frame.total_size as usize,
                    }));
                }
                if frame.offset as usize != self.buffer.len() {
                    return Err(self.fail(ReassemblyError::InvalidOffset {
                        expected: self.buffer.len(),
                        found: frame.offset as usize,
                    }));
                }
            }
        }

        if self.buffer.len() + frame.bytes.len() > self.total {
            return Err(self.fail(ReassemblyError::Overrun {
                offset: frame.offset as usize,
                len: frame.bytes.len(),
                total: self.total,
            }));
        }
        self.buffer.extend_from_slice(&frame.bytes);

        if self.buffer.len() == self.total {
            let object_id = self.object_id;
            let bytes = std::mem::take(&mut self.buffer);
            self.reset();
            return Ok(ReassemblyEvent::Complete { object_id, bytes });
        }
        Ok(ReassemblyEvent::Progress {
            object_id: self.object_id,
            received: self.buffer.len(),
            total: self.total,
        })
    }

    fn begin(&mut self, frame: &ChunkFrame) {
        self.state = ReceiverState::Receiving;
        self.object_id = frame.object_id;
        self.total = frame.total_size as usize;
        self.buffer = Vec::with_capacity(self.total);
    }

    fn fail(&mut self, err: ReassemblyError) -> ReassemblyError {
        tracing::warn!(object_id = self.object_id, error = %err, "reassembly failed");
        self.reset();
        self.state = ReceiverState::Failed;
        err
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
