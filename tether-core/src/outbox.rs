//! Outbox: ordered collection of outgoing messages that have not been resolved yet.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::txid::TransactionId;

/// Default number of Nacks a message may receive before it is failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery state of one outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Queued,
    Sent,
    Acked,
    Failed,
}

/// Completion callback. Runs on the thread that feeds events into the controller.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Optional per-message callbacks. At most one of them runs over the message's lifetime.
#[derive(Default)]
pub struct Callbacks {
    on_success: Option<Callback>,
    on_failure: Option<Callback>,
    on_cancel: Option<Callback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    /// Runs when the message is dropped by a clear instead of being resolved.
    pub fn on_cancel(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    pub(crate) fn succeed(&mut self) {
        let f = self.on_success.take();
        self.disarm();
        if let Some(f) = f {
            f();
        }
    }

    pub(crate) fn fail(&mut self) {
        let f = self.on_failure.take();
        self.disarm();
        if let Some(f) = f {
            f();
        }
    }

    pub(crate) fn cancel(&mut self) {
        let f = self.on_cancel.take();
        self.disarm();
        if let Some(f) = f {
            f();
        }
    }

    fn disarm(&mut self) {
        self.on_success = None;
        self.on_failure = None;
        self.on_cancel = None;
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

/// One queued message. Owned by the [`Outbox`] from submission until resolution.
#[derive(Debug)]
pub struct OutgoingMessage {
    pub(crate) id: TransactionId,
    pub(crate) payload: Bytes,
    pub(crate) state: MessageState,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    /// A Nack was received and the resend is waiting on a backoff delay.
    pub(crate) retry_pending: bool,
    pub(crate) callbacks: Callbacks,
}

impl OutgoingMessage {
    pub fn new(id: TransactionId, payload: Bytes, max_retries: u32, callbacks: Callbacks) -> Self {
        Self {
            id,
            payload,
            state: MessageState::Queued,
            retry_count: 0,
            max_retries,
            retry_pending: false,
            callbacks,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Count one Nack. Returns true if the message may be resent, false once the budget is spent.
    pub(crate) fn record_nack(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1).min(self.max_retries);
        self.retry_count < self.max_retries
    }
}

/// FIFO of unresolved messages. At most one entry is `Sent` at a time.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: VecDeque<OutgoingMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: OutgoingMessage) {
        self.messages.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// First message with the given id. Linear, but the queue is short and the match is near the front.
    pub fn find(&self, id: TransactionId) -> Option<&OutgoingMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn in_flight(&self) -> Option<&OutgoingMessage> {
        self.messages.iter().find(|m| m.state == MessageState::Sent)
    }

    pub fn in_flight_mut(&mut self) -> Option<&mut OutgoingMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.state == MessageState::Sent)
    }

    /// Oldest message that has not been transmitted yet.
    pub fn front_queued_mut(&mut self) -> Option<&mut OutgoingMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.state == MessageState::Queued)
    }

    /// Remove and return the in-flight message, if any.
    pub fn remove_in_flight(&mut self) -> Option<OutgoingMessage> {
        let pos = self
            .messages
            .iter()
            .position(|m| m.state == MessageState::Sent)?;
        self.messages.remove(pos)
    }

    /// Remove every message, oldest first.
    pub fn drain(&mut self) -> Vec<OutgoingMessage> {
        self.messages.drain(..).collect()
    }

    pub fn ids(&self) -> Vec<TransactionId> {
        self.messages.iter().map(|m| m.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutgoingMessage> {
        self.messages.iter()
    }
}
