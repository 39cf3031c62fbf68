//! Framing: length-prefix (4 bytes LE) + bincode link message, and the chunk frame payload layout.
//!
//! Chunk frame layout (all little-endian):
//!
//! ```text
//!  0        4            6        8
//!  +--------+------------+--------+------------------------+
//!  | obj id | total size | offset | bytes (rest of payload) |
//!  |  u32   |    u16     |  u16   |     <= frame limit      |
//!  +--------+------------+--------+------------------------+
//! ```

use crate::chunk::ChunkFrame;
use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 64 * 1024; // 64 KiB

/// Header bytes in front of the chunk bytes of an encoded [`ChunkFrame`].
pub const CHUNK_FRAME_OVERHEAD: usize = 8;

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Body length announced by the prefix at the front of `bytes`.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode a chunk frame as a data payload.
pub fn encode_chunk_frame(frame: &ChunkFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_FRAME_OVERHEAD + frame.bytes.len());
    out.extend_from_slice(&frame.object_id.to_le_bytes());
    out.extend_from_slice(&frame.total_size.to_le_bytes());
    out.extend_from_slice(&frame.offset.to_le_bytes());
    out.extend_from_slice(&frame.bytes);
    out
}

/// Decode a data payload produced by [`encode_chunk_frame`].
pub fn decode_chunk_frame(payload: &[u8]) -> Result<ChunkFrame, ChunkFrameError> {
    if payload.len() < CHUNK_FRAME_OVERHEAD {
        return Err(ChunkFrameError::Truncated(payload.len()));
    }
    Ok(ChunkFrame {
        object_id: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
        total_size: u16::from_le_bytes([payload[4], payload[5]]),
        offset: u16::from_le_bytes([payload[6], payload[7]]),
        bytes: payload[CHUNK_FRAME_OVERHEAD..].to_vec(),
    })
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChunkFrameError {
    #[error("chunk frame truncated: {0} bytes")]
    Truncated(usize),
}
