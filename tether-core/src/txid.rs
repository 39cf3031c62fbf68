//! Transaction ids: small cyclic identifiers correlating a sent message with its Ack/Nack.

use serde::{Deserialize, Serialize};

/// Number of distinct transaction ids (the link's acknowledgment field carries 0..=254).
pub const TRANSACTION_ID_SPACE: u16 = 255;

/// Transaction id of one outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u8);

impl TransactionId {
    pub fn new(raw: u8) -> Self {
        TransactionId(raw)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for TransactionId {
    fn from(raw: u8) -> Self {
        TransactionId(raw)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out ids 1, 2, ..., 254, 0, 1, ... with no check against ids still pending.
/// Safe only while the outbox stays far shallower than [`TRANSACTION_ID_SPACE`].
#[derive(Debug, Clone)]
pub struct TransactionIdAllocator {
    counter: u16,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Allocator whose first id is `start` (mod the id space).
    fn starting_at(start: u16) -> Self {
        Self {
            counter: start % TRANSACTION_ID_SPACE,
        }
    }

    pub fn next(&mut self) -> TransactionId {
        let id = TransactionId(self.counter as u8);
        self.counter = (self.counter + 1) % TRANSACTION_ID_SPACE;
        id
    }
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
