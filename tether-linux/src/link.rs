//! Peer link: handshake and length-prefixed message framing over any async byte stream.

use std::io;

use tether_core::wire::{frame_len, LEN_SIZE};
use tether_core::{decode_frame, encode_frame, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Exchange Hello with the peer. Fails on a version or app mismatch.
pub async fn handshake<S>(stream: &mut S, app_uuid: Uuid) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(
        stream,
        &Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            app_uuid,
        },
    )
    .await?;
    match read_message(stream).await? {
        Message::Hello {
            protocol_version,
            app_uuid: peer_app,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(invalid_data("unsupported protocol version"));
            }
            if peer_app != app_uuid {
                return Err(invalid_data("peer runs a different app"));
            }
            Ok(())
        }
        _ => Err(invalid_data("expected hello")),
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg).map_err(|e| invalid_data(e.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one framed message. A closed stream surfaces as `UnexpectedEof`.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; LEN_SIZE];
    reader.read_exact(&mut buf).await?;
    let len = frame_len(&buf).map_err(|e| invalid_data(e.to_string()))?;
    buf.resize(LEN_SIZE + len, 0);
    reader.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (msg, _) = decode_frame(&buf).map_err(|e| invalid_data(e.to_string()))?;
    Ok(msg)
}

/// Writer task: frames every queued message onto `writer`. Stops on the first write error
/// or when all senders are dropped.
pub fn spawn_writer<W>(mut writer: W) -> mpsc::UnboundedSender<Message>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                tracing::debug!(error = %e, "link write failed");
                break;
            }
        }
    });
    tx
}

/// Reader task: yields decoded messages until the stream ends or a frame is malformed.
pub fn spawn_reader<R>(mut reader: R) -> mpsc::UnboundedReceiver<Message>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::debug!(error = %e, "link read failed");
                    break;
                }
            }
        }
    });
    rx
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::TransactionId;

    #[tokio::test]
    async fn handshake_matching_apps() {
        let app = Uuid::new_v4();
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (ra, rb) = tokio::join!(handshake(&mut a, app), handshake(&mut b, app));
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_other_app() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (ra, rb) = tokio::join!(
            handshake(&mut a, Uuid::new_v4()),
            handshake(&mut b, Uuid::new_v4())
        );
        assert_eq!(ra.unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert_eq!(rb.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn messages_cross_split_streams() {
        let (a, b) = tokio::io::duplex(256);
        let (_ar, aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);
        let tx = spawn_writer(aw);
        let mut rx = spawn_reader(br);

        let data = Message::Data {
            transaction_id: TransactionId::new(7),
            payload: vec![1; 200],
        };
        tx.send(data.clone()).unwrap();
        tx.send(Message::Ack {
            transaction_id: TransactionId::new(8),
        })
        .unwrap();
        assert_eq!(rx.recv().await, Some(data));
        assert_eq!(
            rx.recv().await,
            Some(Message::Ack {
                transaction_id: TransactionId::new(8)
            })
        );
    }

    #[tokio::test]
    async fn reader_ends_on_close() {
        let (a, b) = tokio::io::duplex(64);
        let mut rx = spawn_reader(b);
        drop(a);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn oversized_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
