//! Host-driven API: TetherCore receives events from host, returns actions.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::chunk::{ChunkError, ChunkedSender, TransferEvent};
use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryAction, DeliveryController, Resolution, SubmitOptions};
use crate::txid::TransactionId;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send `payload` to the peer as data with transaction id `id`.
    Transmit { id: TransactionId, payload: Bytes },
    /// Call [`TetherCore::on_retry_due`] with `id` after `after`.
    ScheduleRetry { id: TransactionId, after: Duration },
    Resolved(Resolution),
    Transfer(TransferEvent),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct TetherCore {
    config: DeliveryConfig,
    delivery: DeliveryController,
    chunks: ChunkedSender,
    actions: VecDeque<Action>,
}

impl TetherCore {
    pub fn new() -> Self {
        Self::with_config(DeliveryConfig::default())
    }

    pub fn with_config(config: DeliveryConfig) -> Self {
        Self {
            delivery: DeliveryController::with_config(&config),
            chunks: ChunkedSender::new(),
            actions: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Queue one message for reliable delivery.
    pub fn send_message(&mut self, payload: impl Into<Bytes>, options: SubmitOptions) -> TransactionId {
        let id = self.delivery.submit(payload, options);
        self.collect();
        id
    }

    /// Start a chunked transfer of `buffer` using the configured frame limit.
    pub fn send_object(
        &mut self,
        object_id: u32,
        buffer: impl Into<Bytes>,
    ) -> Result<TransactionId, ChunkError> {
        let id = self.chunks.send(
            &mut self.delivery,
            object_id,
            buffer,
            self.config.frame_limit,
        )?;
        self.collect();
        Ok(id)
    }

    pub fn on_ack(&mut self, id: TransactionId) {
        self.delivery.on_ack(id);
        self.collect();
    }

    pub fn on_nack(&mut self, id: TransactionId) {
        self.delivery.on_nack(id);
        self.collect();
    }

    pub fn on_retry_due(&mut self, id: TransactionId) {
        self.delivery.on_retry_due(id);
        self.collect();
    }

    /// Cancel everything queued or in flight, including transfers. Transmits the host has
    /// not taken yet are withdrawn.
    pub fn clear(&mut self) {
        let cleared = self.delivery.pending_ids();
        self.actions.retain(|action| match action {
            Action::Transmit { id, .. } | Action::ScheduleRetry { id, .. } => !cleared.contains(id),
            _ => true,
        });
        self.delivery.clear();
        self.collect();
    }

    /// Drain all pending actions, oldest first.
    pub fn take_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    pub fn pop_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Put back an action the host could not consume yet.
    pub(crate) fn unpop_action(&mut self, action: Action) {
        self.actions.push_front(action);
    }

    pub fn delivery(&self) -> &DeliveryController {
        &self.delivery
    }

    /// Object ids of transfers still in progress.
    pub fn active_transfers(&self) -> Vec<u32> {
        self.chunks.active()
    }

    /// Pull actions out of the controller, feeding resolutions to the chunked sender.
    /// A resolution can submit the next frame, so repeat until the controller is quiet.
    fn collect(&mut self) {
        loop {
            let batch = self.delivery.take_actions();
            if batch.is_empty() {
                break;
            }
            for action in batch {
                match action {
                    DeliveryAction::Transmit { id, payload } => {
                        self.actions.push_back(Action::Transmit { id, payload });
                    }
                    DeliveryAction::ScheduleRetry { id, after } => {
                        self.actions.push_back(Action::ScheduleRetry { id, after });
                    }
                    DeliveryAction::Resolved(resolution) => {
                        self.actions.push_back(Action::Resolved(resolution));
                        if let Some(event) =
                            self.chunks.on_resolution(&mut self.delivery, &resolution)
                        {
                            self.actions.push_back(Action::Transfer(event));
                        }
                    }
                }
            }
        }
    }
}

impl Default for TetherCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::delivery::Outcome;
    use crate::reassembly::{ReassemblyEvent, Reassembler};
    use crate::wire::decode_chunk_frame;

    #[test]
    fn integration_send_object_over_lossy_link() {
        let buf: Vec<u8> = (0..1234u32).map(|i| (i * 7) as u8).collect();
        let mut core = TetherCore::new();
        let mut receiver = Reassembler::new();
        core.send_object(77, buf.clone()).unwrap();

        let mut transmissions = 0;
        let mut received = None;
        let mut done = false;
        while !done {
            let actions = core.take_actions();
            assert!(!actions.is_empty(), "transfer stalled");
            for action in actions {
                match action {
                    Action::Transmit { id, payload } => {
                        transmissions += 1;
                        // Every third transmission is lost; the peer answers with a nack.
                        if transmissions % 3 == 0 {
                            core.on_nack(id);
                            continue;
                        }
                        let frame = decode_chunk_frame(&payload).unwrap();
                        if let ReassemblyEvent::Complete { object_id, bytes } =
                            receiver.handle_frame(&frame).unwrap()
                        {
                            received = Some((object_id, bytes));
                        }
                        core.on_ack(id);
                    }
                    Action::Transfer(TransferEvent::Complete { object_id }) => {
                        assert_eq!(object_id, 77);
                        done = true;
                    }
                    Action::Transfer(TransferEvent::Abandoned { .. }) => {
                        panic!("transfer abandoned")
                    }
                    _ => {}
                }
            }
        }
        assert_eq!(received, Some((77, buf)));
        assert!(core.delivery().is_empty());
        assert!(core.active_transfers().is_empty());
    }

    #[test]
    fn message_resolution_reported() {
        let mut core = TetherCore::new();
        let id = core.send_message(&b"hi"[..], SubmitOptions::default());
        assert_eq!(
            core.pop_action(),
            Some(Action::Transmit {
                id,
                payload: Bytes::from_static(b"hi")
            })
        );
        core.on_ack(id);
        assert_eq!(
            core.take_actions(),
            vec![Action::Resolved(Resolution {
                id,
                outcome: Outcome::Delivered
            })]
        );
    }

    #[test]
    fn clear_withdraws_untaken_transmits() {
        let mut core = TetherCore::new();
        core.send_object(1, vec![0u8; 500]).unwrap();
        core.send_message(&b"queued"[..], SubmitOptions::default());
        // Host never took the first transmit.
        core.clear();
        let actions = core.take_actions();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Transmit { .. })));
        assert!(actions.contains(&Action::Transfer(TransferEvent::Cancelled {
            object_id: 1,
            offset: 0
        })));
        let cancelled = actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    Action::Resolved(Resolution {
                        outcome: Outcome::Cancelled,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(cancelled, 2);
        assert!(core.active_transfers().is_empty());
    }

    #[test]
    fn backoff_surfaces_schedule_retry() {
        let config = DeliveryConfig {
            retry: RetryPolicy::Backoff {
                base_ms: 250,
                max_ms: 2000,
                jitter: false,
            },
            ..DeliveryConfig::default()
        };
        let mut core = TetherCore::with_config(config);
        let id = core.send_message(&b"x"[..], SubmitOptions::default());
        core.take_actions();
        core.on_nack(id);
        assert_eq!(
            core.take_actions(),
            vec![Action::ScheduleRetry {
                id,
                after: Duration::from_millis(250)
            }]
        );
        core.on_retry_due(id);
        assert!(matches!(
            core.take_actions().as_slice(),
            [Action::Transmit { .. }]
        ));
    }

    #[test]
    fn oversized_object_rejected_without_side_effects() {
        let mut core = TetherCore::new();
        assert!(core.send_object(1, vec![0u8; 70_000]).is_err());
        assert!(core.take_actions().is_empty());
    }
}
