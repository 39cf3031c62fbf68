//! Tether link protocol: message types and version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::txid::TransactionId;

/// Current protocol version. Exchanged in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All link message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake, sent by both ends on connect. A peer with a different app UUID is dropped.
    Hello { protocol_version: u8, app_uuid: Uuid },
    /// Payload to deliver reliably; the receiver answers with Ack or Nack for the same id.
    Data {
        transaction_id: TransactionId,
        payload: Vec<u8>,
    },
    Ack { transaction_id: TransactionId },
    Nack { transaction_id: TransactionId },
}
