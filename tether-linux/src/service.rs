//! Delivery service: one task owns the [`TetherCore`] and serializes every event into it.
//! Callers post commands through a [`ServiceHandle`] and await the outcome.

use std::collections::HashMap;

use tether_core::{Action, Message, Outcome, SubmitOptions, TetherCore, TransactionId, TransferEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How an object transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete,
    /// Frame at `offset` ran out of retries.
    Abandoned { offset: usize },
    Cancelled { offset: usize },
    /// Not started.
    Rejected(String),
}

enum Command {
    SendMessage {
        payload: Vec<u8>,
        reply: oneshot::Sender<Outcome>,
    },
    SendObject {
        object_id: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<TransferOutcome>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ServiceHandle {
    /// Deliver one message; resolves once the peer acks it or retries run out.
    pub async fn send_message(&self, payload: Vec<u8>) -> anyhow::Result<Outcome> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::SendMessage { payload, reply })?;
        Ok(rx.await?)
    }

    /// Send `data` as a chunked object; resolves when the transfer ends.
    pub async fn send_object(&self, object_id: u32, data: Vec<u8>) -> anyhow::Result<TransferOutcome> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::SendObject {
            object_id,
            data,
            reply,
        })?;
        Ok(rx.await?)
    }

    /// Cancel everything pending (waiters resolve as cancelled) and stop the service task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn post(&self, cmd: Command) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("delivery service stopped"))
    }
}

struct Service {
    core: TetherCore,
    link: mpsc::UnboundedSender<Message>,
    retry_tx: mpsc::UnboundedSender<TransactionId>,
    messages: HashMap<TransactionId, oneshot::Sender<Outcome>>,
    transfers: HashMap<u32, oneshot::Sender<TransferOutcome>>,
}

/// Start the service over an established link. The task ends when the link closes or every
/// handle is dropped; anything still pending is cancelled.
pub fn spawn(
    core: TetherCore,
    link: mpsc::UnboundedSender<Message>,
    mut inbound: mpsc::UnboundedReceiver<Message>,
) -> (ServiceHandle, JoinHandle<()>) {
    let (tx, mut commands) = mpsc::unbounded_channel();
    let (retry_tx, mut retries) = mpsc::unbounded_channel();
    let mut service = Service {
        core,
        link,
        retry_tx,
        messages: HashMap::new(),
        transfers: HashMap::new(),
    };
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => service.on_command(cmd),
                },
                msg = inbound.recv() => match msg {
                    Some(msg) => service.on_link_message(msg),
                    None => {
                        tracing::info!("link closed");
                        break;
                    }
                },
                Some(id) = retries.recv() => service.core.on_retry_due(id),
            }
            service.flush();
        }
        service.core.clear();
        service.flush();
    });
    (ServiceHandle { tx }, task)
}

impl Service {
    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendMessage { payload, reply } => {
                let id = self.core.send_message(payload, SubmitOptions::default());
                self.messages.insert(id, reply);
            }
            Command::SendObject {
                object_id,
                data,
                reply,
            } => {
                if self.transfers.contains_key(&object_id) {
                    let _ = reply.send(TransferOutcome::Rejected(format!(
                        "object {object_id} is already being sent"
                    )));
                    return;
                }
                match self.core.send_object(object_id, data) {
                    Ok(_) => {
                        self.transfers.insert(object_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(TransferOutcome::Rejected(e.to_string()));
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn on_link_message(&mut self, msg: Message) {
        match msg {
            Message::Ack { transaction_id } => self.core.on_ack(transaction_id),
            Message::Nack { transaction_id } => self.core.on_nack(transaction_id),
            Message::Data { transaction_id, .. } => {
                // Sending side only; refuse inbound data so the peer does not wait on it.
                tracing::debug!(id = %transaction_id, "unexpected data, rejecting");
                let _ = self.link.send(Message::Nack { transaction_id });
            }
            Message::Hello { .. } => tracing::debug!("hello after handshake, ignoring"),
        }
    }

    /// Carry out every action the core produced.
    fn flush(&mut self) {
        for action in self.core.take_actions() {
            match action {
                Action::Transmit { id, payload } => {
                    let msg = Message::Data {
                        transaction_id: id,
                        payload: payload.to_vec(),
                    };
                    if self.link.send(msg).is_err() {
                        tracing::debug!(%id, "link writer gone, dropping transmit");
                    }
                }
                Action::ScheduleRetry { id, after } => {
                    let retry_tx = self.retry_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = retry_tx.send(id);
                    });
                }
                Action::Resolved(resolution) => {
                    if let Some(reply) = self.messages.remove(&resolution.id) {
                        let _ = reply.send(resolution.outcome);
                    }
                }
                Action::Transfer(event) => self.on_transfer_event(event),
            }
        }
    }

    fn on_transfer_event(&mut self, event: TransferEvent) {
        let (object_id, outcome) = match event {
            TransferEvent::Progress {
                object_id,
                sent,
                total,
            } => {
                tracing::debug!(object_id, sent, total, "transfer progress");
                return;
            }
            TransferEvent::Complete { object_id } => (object_id, TransferOutcome::Complete),
            TransferEvent::Abandoned { object_id, offset } => {
                (object_id, TransferOutcome::Abandoned { offset })
            }
            TransferEvent::Cancelled { object_id, offset } => {
                (object_id, TransferOutcome::Cancelled { offset })
            }
        };
        if let Some(reply) = self.transfers.remove(&object_id) {
            let _ = reply.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::wire::decode_chunk_frame;
    use tether_core::{DeliveryConfig, RetryPolicy};

    struct FakePeer {
        to_service: mpsc::UnboundedSender<Message>,
        from_service: mpsc::UnboundedReceiver<Message>,
    }

    fn start(config: DeliveryConfig) -> (ServiceHandle, JoinHandle<()>, FakePeer) {
        let (link_tx, from_service) = mpsc::unbounded_channel();
        let (to_service, inbound) = mpsc::unbounded_channel();
        let (handle, task) = spawn(TetherCore::with_config(config), link_tx, inbound);
        (
            handle,
            task,
            FakePeer {
                to_service,
                from_service,
            },
        )
    }

    impl FakePeer {
        async fn next_data(&mut self) -> (TransactionId, Vec<u8>) {
            match self.from_service.recv().await {
                Some(Message::Data {
                    transaction_id,
                    payload,
                }) => (transaction_id, payload),
                other => panic!("expected data, got {other:?}"),
            }
        }

        fn ack(&self, transaction_id: TransactionId) {
            self.to_service.send(Message::Ack { transaction_id }).unwrap();
        }

        fn nack(&self, transaction_id: TransactionId) {
            self.to_service.send(Message::Nack { transaction_id }).unwrap();
        }
    }

    #[tokio::test]
    async fn message_delivered_after_ack() {
        let (handle, _task, mut peer) = start(DeliveryConfig::default());
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send_message(b"ping".to_vec()).await }
        });
        let (id, payload) = peer.next_data().await;
        assert_eq!(payload, b"ping");
        peer.ack(id);
        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Delivered);
    }

    #[tokio::test]
    async fn message_fails_after_retries() {
        let config = DeliveryConfig {
            max_retries: 2,
            ..DeliveryConfig::default()
        };
        let (handle, _task, mut peer) = start(config);
        let pending = tokio::spawn(async move { handle.send_message(vec![1]).await });
        let (id, _) = peer.next_data().await;
        peer.nack(id);
        let (resent, _) = peer.next_data().await;
        assert_eq!(resent, id);
        peer.nack(id);
        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resend_waits_for_timer() {
        let config = DeliveryConfig {
            retry: RetryPolicy::Backoff {
                base_ms: 500,
                max_ms: 500,
                jitter: false,
            },
            ..DeliveryConfig::default()
        };
        let (handle, _task, mut peer) = start(config);
        let pending = tokio::spawn(async move { handle.send_message(vec![2]).await });
        let (id, _) = peer.next_data().await;
        peer.nack(id);
        let (resent, _) = peer.next_data().await;
        assert_eq!(resent, id);
        peer.ack(id);
        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Delivered);
    }

    #[tokio::test]
    async fn object_sent_frame_by_frame() {
        let (handle, _task, mut peer) = start(DeliveryConfig::default());
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let pending = tokio::spawn({
            let handle = handle.clone();
            let data = data.clone();
            async move { handle.send_object(3, data).await }
        });
        let mut rebuilt = Vec::new();
        for expected_offset in [0u16, 100, 200] {
            let (id, payload) = peer.next_data().await;
            let frame = decode_chunk_frame(&payload).unwrap();
            assert_eq!(frame.object_id, 3);
            assert_eq!(frame.offset, expected_offset);
            // Nothing else is sent until this frame is acked.
            assert!(peer.from_service.try_recv().is_err());
            rebuilt.extend_from_slice(&frame.bytes);
            peer.ack(id);
        }
        assert_eq!(pending.await.unwrap().unwrap(), TransferOutcome::Complete);
        assert_eq!(rebuilt, data);
    }

    #[tokio::test]
    async fn oversized_object_rejected() {
        let (handle, _task, _peer) = start(DeliveryConfig::default());
        let outcome = handle.send_object(1, vec![0; 70_000]).await.unwrap();
        assert!(matches!(outcome, TransferOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn link_close_cancels_pending() {
        let (handle, task, mut peer) = start(DeliveryConfig::default());
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send_message(vec![1]).await }
        });
        peer.next_data().await;
        drop(peer);
        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Cancelled);
        task.await.unwrap();
        assert!(handle.send_message(vec![2]).await.is_err());
    }

    #[tokio::test]
    async fn inbound_data_is_nacked() {
        let (_handle, _task, mut peer) = start(DeliveryConfig::default());
        let id = TransactionId::new(42);
        peer.to_service
            .send(Message::Data {
                transaction_id: id,
                payload: vec![],
            })
            .unwrap();
        assert_eq!(
            peer.from_service.recv().await,
            Some(Message::Nack { transaction_id: id })
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_and_stops() {
        let (handle, task, mut peer) = start(DeliveryConfig::default());
        let object = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send_object(4, vec![1; 250]).await }
        });
        peer.next_data().await;
        let message = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send_message(vec![1]).await }
        });
        // Let the message command land before shutting down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();
        task.await.unwrap();
        assert_eq!(
            object.await.unwrap().unwrap(),
            TransferOutcome::Cancelled { offset: 0 }
        );
        assert_eq!(message.await.unwrap().unwrap(), Outcome::Cancelled);
        assert!(handle.send_message(vec![1]).await.is_err());
    }
}
