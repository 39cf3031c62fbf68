//! Receive mode: accept peer links, rebuild chunked objects and write them to disk.

use std::io;
use std::path::{Path, PathBuf};

use tether_core::reassembly::ReassemblyEvent;
use tether_core::wire::decode_chunk_frame;
use tether_core::{Message, Reassembler, Route, ServiceRegistry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::link::{handshake, read_message, write_message};

/// Accept connections on `listener`. One session per app at a time; a second link for an
/// app that already has a live session is refused.
pub async fn run_receiver(listener: TcpListener, app_uuid: Uuid, output_dir: PathBuf) -> io::Result<()> {
    let mut registry = ServiceRegistry::new();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<Uuid>();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                match registry.route(app_uuid) {
                    Route::Deliver => {
                        tracing::warn!(%addr, "session already running, refusing link");
                        continue;
                    }
                    Route::Start => {
                        if let Err(e) = registry.start(app_uuid) {
                            tracing::warn!(error = %e, "cannot start session");
                            continue;
                        }
                    }
                }
                tracing::info!(%addr, "peer connected");
                let ended = ended_tx.clone();
                let dir = output_dir.clone();
                tokio::spawn(async move {
                    match run_session(stream, app_uuid, &dir).await {
                        Ok(objects) => tracing::info!(%addr, objects, "peer disconnected"),
                        Err(e) => tracing::warn!(%addr, error = %e, "session ended"),
                    }
                    let _ = ended.send(app_uuid);
                });
            }
            Some(app) = ended_rx.recv() => registry.stop(app),
        }
    }
}

/// Serve one link until the peer hangs up. Returns the number of objects stored.
pub async fn run_session<S>(mut stream: S, app_uuid: Uuid, output_dir: &Path) -> io::Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake(&mut stream, app_uuid).await?;
    let mut reassembler = Reassembler::new();
    let mut stored = 0;
    loop {
        let msg = match read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let (transaction_id, payload) = match msg {
            Message::Data {
                transaction_id,
                payload,
            } => (transaction_id, payload),
            other => {
                tracing::debug!(msg = ?other, "ignoring non-data message");
                continue;
            }
        };
        let accepted = match decode_chunk_frame(&payload) {
            Err(e) => {
                tracing::debug!(id = %transaction_id, error = %e, "undecodable frame");
                false
            }
            Ok(frame) => match reassembler.handle_frame(&frame) {
                Ok(ReassemblyEvent::Complete { object_id, bytes }) => {
                    store_object(output_dir, object_id, &bytes).await?;
                    stored += 1;
                    true
                }
                Ok(ReassemblyEvent::Progress {
                    object_id,
                    received,
                    total,
                }) => {
                    tracing::debug!(object_id, received, total, "frame received");
                    true
                }
                Ok(ReassemblyEvent::Ignored) => true,
                Err(e) => {
                    tracing::warn!(code = e.code(), error = %e, "dropping partial object");
                    reassembler.reset();
                    false
                }
            },
        };
        let reply = if accepted {
            Message::Ack { transaction_id }
        } else {
            Message::Nack { transaction_id }
        };
        write_message(&mut stream, &reply).await?;
    }
    Ok(stored)
}

async fn store_object(dir: &Path, object_id: u32, bytes: &[u8]) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{object_id}.bin"));
    tokio::fs::write(&path, bytes).await?;
    tracing::info!(object_id, len = bytes.len(), path = %path.display(), "object stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::wire::encode_chunk_frame;
    use tether_core::{ChunkFrame, TransactionId};
    use tokio::io::DuplexStream;
    use tokio::net::TcpStream;

    async fn connect(app: Uuid, dir: PathBuf) -> (DuplexStream, tokio::task::JoinHandle<io::Result<usize>>) {
        let (mut client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move { run_session(server, app, &dir).await });
        handshake(&mut client, app).await.unwrap();
        (client, session)
    }

    async fn send_frame(client: &mut DuplexStream, id: u8, frame: &ChunkFrame) -> Message {
        write_message(
            client,
            &Message::Data {
                transaction_id: TransactionId::new(id),
                payload: encode_chunk_frame(frame),
            },
        )
        .await
        .unwrap();
        read_message(client).await.unwrap()
    }

    #[tokio::test]
    async fn stores_completed_object() {
        let dir = tempfile::tempdir().unwrap();
        let app = Uuid::new_v4();
        let (mut client, session) = connect(app, dir.path().to_path_buf()).await;
        let data: Vec<u8> = (0..180u32).map(|i| i as u8).collect();
        for (i, offset) in [0usize, 100].into_iter().enumerate() {
            let frame = ChunkFrame::at(21, &data, offset, 100);
            let reply = send_frame(&mut client, i as u8 + 1, &frame).await;
            assert_eq!(
                reply,
                Message::Ack {
                    transaction_id: TransactionId::new(i as u8 + 1)
                }
            );
        }
        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), 1);
        let stored = std::fs::read(dir.path().join("21.bin")).unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn bad_frames_are_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let app = Uuid::new_v4();
        let (mut client, session) = connect(app, dir.path().to_path_buf()).await;

        write_message(
            &mut client,
            &Message::Data {
                transaction_id: TransactionId::new(1),
                payload: vec![1, 2, 3],
            },
        )
        .await
        .unwrap();
        assert_eq!(
            read_message(&mut client).await.unwrap(),
            Message::Nack {
                transaction_id: TransactionId::new(1)
            }
        );

        // Object must start at offset 0.
        let data = vec![0u8; 200];
        let reply = send_frame(&mut client, 2, &ChunkFrame::at(5, &data, 100, 100)).await;
        assert_eq!(
            reply,
            Message::Nack {
                transaction_id: TransactionId::new(2)
            }
        );

        // The receiver recovers for the next object.
        let reply = send_frame(&mut client, 3, &ChunkFrame::at(6, &[9u8; 10], 0, 100)).await;
        assert_eq!(
            reply,
            Message::Ack {
                transaction_id: TransactionId::new(3)
            }
        );
        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), 1);
        assert!(dir.path().join("6.bin").exists());
    }

    #[tokio::test]
    async fn wrong_app_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        let path = dir.path().to_path_buf();
        let session = tokio::spawn(async move { run_session(server, Uuid::new_v4(), &path).await });
        assert!(handshake(&mut client, Uuid::new_v4()).await.is_err());
        assert!(session.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn second_link_refused_until_first_ends() {
        let dir = tempfile::tempdir().unwrap();
        let app = Uuid::new_v4();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_receiver(listener, app, dir.path().to_path_buf()));

        let mut first = TcpStream::connect(addr).await.unwrap();
        handshake(&mut first, app).await.unwrap();

        // Same app already has a session: the link is closed before any hello.
        let mut second = TcpStream::connect(addr).await.unwrap();
        assert!(handshake(&mut second, app).await.is_err());

        drop(first);
        // The registry frees the app once the session task reports back.
        let mut accepted = false;
        for _ in 0..50 {
            let mut third = TcpStream::connect(addr).await.unwrap();
            if handshake(&mut third, app).await.is_ok() {
                accepted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(accepted);
    }
}
