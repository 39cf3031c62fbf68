//! Chunked sender: split an object into bounded frames and send them one at a time,
//! each only after the previous one was acknowledged.

use std::collections::HashMap;

use bytes::Bytes;

use crate::delivery::{DeliveryController, Outcome, Resolution, SubmitOptions};
use crate::txid::TransactionId;
use crate::wire;

/// Default chunk payload per frame in bytes. Leaves room in a 124-byte message for the frame header.
pub const DEFAULT_FRAME_LIMIT: usize = 100;

/// Largest object the 16-bit size and offset fields can describe.
pub const MAX_OBJECT_SIZE: usize = u16::MAX as usize;

/// One chunk of an object, with the metadata the receiver needs to reassemble it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub object_id: u32,
    pub total_size: u16,
    pub offset: u16,
    pub bytes: Vec<u8>,
}

impl ChunkFrame {
    /// Frame covering `[offset, min(offset + frame_limit, len))` of `buffer`.
    /// `buffer` must be at most [`MAX_OBJECT_SIZE`] bytes.
    pub fn at(object_id: u32, buffer: &[u8], offset: usize, frame_limit: usize) -> Self {
        debug_assert!(buffer.len() <= MAX_OBJECT_SIZE);
        let start = offset.min(buffer.len());
        let end = (start + frame_limit).min(buffer.len());
        Self {
            object_id,
            total_size: buffer.len() as u16,
            offset: start as u16,
            bytes: buffer[start..end].to_vec(),
        }
    }

    /// Offset one past this frame's last byte.
    pub fn end(&self) -> usize {
        self.offset as usize + self.bytes.len()
    }
}

/// Byte range `[start, end)` of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRange {
    pub start: usize,
    pub end: usize,
}

/// Split an object into frame ranges. A zero-length object still gets one empty frame
/// so the receiver learns about it. `frame_limit` 0 falls back to [`DEFAULT_FRAME_LIMIT`].
pub fn split_into_frames(total_len: usize, frame_limit: usize) -> Vec<FrameRange> {
    let size = effective_frame_limit(frame_limit);
    if total_len == 0 {
        return vec![FrameRange { start: 0, end: 0 }];
    }
    let mut out = Vec::with_capacity(total_len.div_ceil(size));
    let mut start = 0;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(FrameRange { start, end });
        start = end;
    }
    out
}

fn effective_frame_limit(frame_limit: usize) -> usize {
    if frame_limit == 0 {
        DEFAULT_FRAME_LIMIT
    } else {
        frame_limit
    }
}

/// Progress of a chunked transfer, reported as each frame resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A frame was acknowledged and the next one was submitted.
    Progress {
        object_id: u32,
        sent: usize,
        total: usize,
    },
    /// The last frame was acknowledged.
    Complete { object_id: u32 },
    /// The frame at `offset` failed all retries; nothing after it is sent.
    Abandoned { object_id: u32, offset: usize },
    /// The outbox was cleared while the frame at `offset` was pending.
    Cancelled { object_id: u32, offset: usize },
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("object of {len} bytes exceeds the {MAX_OBJECT_SIZE}-byte limit")]
    ObjectTooLarge { len: usize },
}

struct Transfer {
    object_id: u32,
    buffer: Bytes,
    frames: Vec<FrameRange>,
    /// Index into `frames` of the frame in the outbox.
    current: usize,
}

impl Transfer {
    fn frame(&self) -> FrameRange {
        self.frames[self.current]
    }
}

/// Drives chunked transfers through a [`DeliveryController`]. Exactly one frame per transfer
/// is in the outbox at a time; the next is submitted when the host routes the previous
/// frame's [`Resolution`] to [`ChunkedSender::on_resolution`].
#[derive(Default)]
pub struct ChunkedSender {
    /// Transfers keyed by the transaction id of their pending frame.
    pending: HashMap<TransactionId, Transfer>,
}

impl ChunkedSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start sending `buffer` as object `object_id`. Returns the first frame's transaction id.
    pub fn send(
        &mut self,
        delivery: &mut DeliveryController,
        object_id: u32,
        buffer: impl Into<Bytes>,
        frame_limit: usize,
    ) -> Result<TransactionId, ChunkError> {
        let buffer = buffer.into();
        if buffer.len() > MAX_OBJECT_SIZE {
            return Err(ChunkError::ObjectTooLarge { len: buffer.len() });
        }
        let transfer = Transfer {
            object_id,
            frames: split_into_frames(buffer.len(), frame_limit),
            buffer,
            current: 0,
        };
        Ok(self.submit_frame(delivery, transfer))
    }

    /// Advance the transfer owning `resolution.id`, if any.
    pub fn on_resolution(
        &mut self,
        delivery: &mut DeliveryController,
        resolution: &Resolution,
    ) -> Option<TransferEvent> {
        let mut transfer = self.pending.remove(&resolution.id)?;
        let object_id = transfer.object_id;
        let offset = transfer.frame().start;
        match resolution.outcome {
            Outcome::Delivered => {
                let total = transfer.buffer.len();
                let sent = transfer.frame().end;
                if transfer.current + 1 >= transfer.frames.len() {
                    tracing::debug!(object_id, total, "transfer complete");
                    return Some(TransferEvent::Complete { object_id });
                }
                transfer.current += 1;
                self.submit_frame(delivery, transfer);
                Some(TransferEvent::Progress {
                    object_id,
                    sent,
                    total,
                })
            }
            Outcome::Failed => {
                tracing::warn!(object_id, offset, "chunk failed, abandoning transfer");
                Some(TransferEvent::Abandoned { object_id, offset })
            }
            Outcome::Cancelled => Some(TransferEvent::Cancelled { object_id, offset }),
        }
    }

    /// Object ids of transfers still in progress.
    pub fn active(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.pending.values().map(|t| t.object_id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn submit_frame(&mut self, delivery: &mut DeliveryController, transfer: Transfer) -> TransactionId {
        let range = transfer.frame();
        let frame = ChunkFrame::at(
            transfer.object_id,
            &transfer.buffer,
            range.start,
            range.end - range.start,
        );
        tracing::debug!(
            object_id = transfer.object_id,
            offset = range.start,
            end = range.end,
            total = transfer.buffer.len(),
            "sending chunk"
        );
        let id = delivery.submit(wire::encode_chunk_frame(&frame), SubmitOptions::default());
        self.pending.insert(id, transfer);
        id
    }
}
