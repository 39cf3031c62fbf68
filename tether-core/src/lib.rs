//! Tether: reliable delivery channel and chunked transfer for a constrained peer link.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod config;
pub mod delivery;
pub mod outbox;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod txid;
pub mod wire;

pub use chunk::{ChunkError, ChunkFrame, ChunkedSender, TransferEvent};
pub use config::{DeliveryConfig, RetryPolicy};
pub use crate::core::{Action, TetherCore};
pub use delivery::{DeliveryController, Outcome, Resolution, SubmitOptions};
pub use outbox::Callbacks;
pub use protocol::{Message, PROTOCOL_VERSION};
pub use reassembly::{ReassemblyEvent, Reassembler};
pub use registry::{Route, ServiceRegistry};
pub use txid::TransactionId;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};

pub mod core;
pub mod ffi;
