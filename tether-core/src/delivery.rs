//! Delivery controller: reliable, single-in-flight delivery over an Ack/Nack link.
//!
//! The controller performs no I/O. The host feeds submissions and Ack/Nack events in and
//! drains [`DeliveryAction`]s out. Every call must come from one serialized context (the
//! host's event loop); other threads post work to that loop instead of calling in directly.

use std::time::Duration;

use bytes::Bytes;

use crate::config::{DeliveryConfig, RetryPolicy};
use crate::outbox::{Callbacks, MessageState, Outbox, OutgoingMessage};
use crate::txid::{TransactionId, TransactionIdAllocator};

/// Per-submission options.
#[derive(Debug, Default)]
pub struct SubmitOptions {
    /// Overrides the controller's default retry budget for this message.
    pub max_retries: Option<u32>,
    pub callbacks: Callbacks,
}

impl SubmitOptions {
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// How a message left the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Failed,
    /// Dropped by [`DeliveryController::clear`]. Not a delivery failure.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub id: TransactionId,
    pub outcome: Outcome,
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Hand `payload` to the link tagged with `id`. Completion arrives later as Ack/Nack.
    Transmit { id: TransactionId, payload: Bytes },
    /// Call [`DeliveryController::on_retry_due`] with `id` once `after` has elapsed.
    ScheduleRetry { id: TransactionId, after: Duration },
    Resolved(Resolution),
}

/// Owns the outbox and drives it through Queued -> Sent -> Acked/Failed.
pub struct DeliveryController {
    outbox: Outbox,
    ids: TransactionIdAllocator,
    max_retries: u32,
    retry: RetryPolicy,
    actions: Vec<DeliveryAction>,
}

impl DeliveryController {
    pub fn new() -> Self {
        Self::with_config(&DeliveryConfig::default())
    }

    pub fn with_config(config: &DeliveryConfig) -> Self {
        Self {
            outbox: Outbox::new(),
            ids: TransactionIdAllocator::new(),
            max_retries: config.max_retries,
            retry: config.retry,
            actions: Vec::new(),
        }
    }

    /// Set the retry budget for messages submitted without an override.
    pub fn set_max_retries(&mut self, n: u32) {
        self.max_retries = n;
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    /// Queue `payload` for delivery. Transmits at once if nothing else is in flight.
    pub fn submit(&mut self, payload: impl Into<Bytes>, options: SubmitOptions) -> TransactionId {
        let id = self.ids.next();
        let max_retries = options.max_retries.unwrap_or(self.max_retries);
        self.outbox.push(OutgoingMessage::new(
            id,
            payload.into(),
            max_retries,
            options.callbacks,
        ));
        self.advance();
        id
    }

    /// Peer acknowledged `id`. Unknown or not-in-flight ids are ignored.
    pub fn on_ack(&mut self, id: TransactionId) {
        if !self.is_in_flight(id) {
            tracing::debug!(%id, "ack for unknown transaction, ignoring");
            return;
        }
        let Some(mut message) = self.outbox.remove_in_flight() else {
            return;
        };
        message.state = MessageState::Acked;
        tracing::debug!(%id, retries = message.retry_count, "message delivered");
        message.callbacks.succeed();
        self.actions.push(DeliveryAction::Resolved(Resolution {
            id,
            outcome: Outcome::Delivered,
        }));
        self.advance();
    }

    /// Peer rejected `id`. Resends within the retry budget, fails the message after it.
    pub fn on_nack(&mut self, id: TransactionId) {
        let Some(message) = self.outbox.in_flight_mut().filter(|m| m.id == id) else {
            tracing::debug!(%id, "nack for unknown transaction, ignoring");
            return;
        };
        if message.retry_pending {
            tracing::debug!(%id, "nack while resend is pending, ignoring");
            return;
        }
        if message.record_nack() {
            match self.retry.delay(message.retry_count) {
                None => {
                    tracing::debug!(%id, attempt = message.retry_count, "resending message");
                    self.actions.push(DeliveryAction::Transmit {
                        id,
                        payload: message.payload.clone(),
                    });
                }
                Some(after) => {
                    tracing::debug!(%id, attempt = message.retry_count, ?after, "resend scheduled");
                    message.retry_pending = true;
                    self.actions
                        .push(DeliveryAction::ScheduleRetry { id, after });
                }
            }
            return;
        }

        let Some(mut message) = self.outbox.remove_in_flight() else {
            return;
        };
        message.state = MessageState::Failed;
        tracing::warn!(%id, retries = message.retry_count, "message failed, retries exhausted");
        message.callbacks.fail();
        self.actions.push(DeliveryAction::Resolved(Resolution {
            id,
            outcome: Outcome::Failed,
        }));
        self.advance();
    }

    /// Backoff delay for `id` expired. Resends only if that message is still waiting on it.
    pub fn on_retry_due(&mut self, id: TransactionId) {
        let Some(message) = self
            .outbox
            .in_flight_mut()
            .filter(|m| m.id == id && m.retry_pending)
        else {
            return;
        };
        message.retry_pending = false;
        tracing::debug!(%id, attempt = message.retry_count, "resending message");
        self.actions.push(DeliveryAction::Transmit {
            id,
            payload: message.payload.clone(),
        });
    }

    /// Drop every queued and in-flight message. Success/failure callbacks do not run;
    /// each message's cancel callback runs and a `Cancelled` resolution is emitted.
    pub fn clear(&mut self) {
        let cleared = self.outbox.drain();
        if cleared.is_empty() {
            return;
        }
        let ids: Vec<TransactionId> = cleared.iter().map(|m| m.id).collect();
        // Nothing cleared may reach the link, even if the host has not drained it yet.
        self.actions.retain(|action| match action {
            DeliveryAction::Transmit { id, .. } | DeliveryAction::ScheduleRetry { id, .. } => {
                !ids.contains(id)
            }
            DeliveryAction::Resolved(_) => true,
        });
        tracing::debug!(count = cleared.len(), "outbox cleared");
        for mut message in cleared {
            message.callbacks.cancel();
            self.actions.push(DeliveryAction::Resolved(Resolution {
                id: message.id,
                outcome: Outcome::Cancelled,
            }));
        }
    }

    /// Drain pending actions in the order they were produced.
    pub fn take_actions(&mut self) -> Vec<DeliveryAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn len(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    pub fn in_flight(&self) -> Option<TransactionId> {
        self.outbox.in_flight().map(|m| m.id)
    }

    /// Ids still in the outbox, oldest first.
    pub fn pending_ids(&self) -> Vec<TransactionId> {
        self.outbox.ids()
    }

    pub fn state_of(&self, id: TransactionId) -> Option<MessageState> {
        if self.is_in_flight(id) {
            return Some(MessageState::Sent);
        }
        self.outbox.find(id).map(|m| m.state)
    }

    pub fn retry_count_of(&self, id: TransactionId) -> Option<u32> {
        self.outbox.find(id).map(|m| m.retry_count)
    }

    fn is_in_flight(&self, id: TransactionId) -> bool {
        self.outbox.in_flight().is_some_and(|m| m.id == id)
    }

    /// Window size 1: transmit the oldest queued message only when nothing is in flight.
    fn advance(&mut self) {
        if self.outbox.in_flight().is_some() {
            return;
        }
        if let Some(next) = self.outbox.front_queued_mut() {
            next.state = MessageState::Sent;
            tracing::debug!(id = %next.id, "sending message");
            self.actions.push(DeliveryAction::Transmit {
                id: next.id,
                payload: next.payload.clone(),
            });
        }
    }
}

impl Default for DeliveryController {
    fn default() -> Self {
        Self::new()
    }
}
