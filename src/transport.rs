//! Length-prefixed message framing over a TCP stream.
//!
//! Frame layout: 4-byte big-endian length `L`, followed by `L` bytes of
//! UTF-8 payload. `L` must not exceed [`MAX_FRAME_LEN`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};
use crate::queue::BoundedQueue;

pub const MAX_FRAME_LEN: usize = 65_535;

/// Shared flag a connection's tasks set when either side of the socket
/// fails; the owning layer observes it and decides whether to reconnect
/// or tear the session down.
#[derive(Clone, Default)]
pub struct BrokenFlag(Arc<AtomicBool>);

impl BrokenFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_broken(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_broken(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<String>> {
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(NodeError::Io(e));
    }
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Ok(Some(String::new()));
    }
    if len > MAX_FRAME_LEN {
        return Err(NodeError::Protocol(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body).map(Some).map_err(|e| {
        NodeError::Protocol(format!("frame payload is not valid UTF-8: {e}"))
    })
}

pub async fn write_frame(writer: &mut OwnedWriteHalf, payload: &str) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(NodeError::Protocol(format!(
            "frame length {} exceeds maximum {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload.as_bytes()).await?;
    Ok(())
}

/// Drains `outbound` and writes frames to the socket until the queue
/// closes or a write fails.
pub fn spawn_send_task(
    mut writer: OwnedWriteHalf,
    outbound: BoundedQueue<String>,
    broken: BrokenFlag,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = outbound.dequeue().await {
            if let Err(e) = write_frame(&mut writer, &msg).await {
                warn!("send task error: {e}");
                broken.mark_broken();
                return;
            }
        }
        debug!("send task stopped: outbound queue closed");
    })
}

/// Reads frames from the socket and pushes payloads onto `inbound`
/// until the peer closes the connection or a read fails. Empty
/// payloads are dropped rather than queued. Returns without closing
/// `inbound` — it's a queue shared across reconnect attempts in some
/// callers (the master session), and `BoundedQueue::close` is one-way,
/// so closing it here would wedge a reconnected session's fresh recv
/// task into always reporting "closed". Callers that never reconnect
/// close their own queue once this loop returns; see [`spawn_recv_task`].
pub async fn recv_loop(mut reader: OwnedReadHalf, inbound: BoundedQueue<String>, broken: BrokenFlag) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) if !payload.is_empty() => inbound.enqueue(payload).await,
            Ok(Some(_)) => continue,
            Ok(None) => {
                debug!("recv task stopped: peer closed connection");
                broken.mark_broken();
                return;
            }
            Err(e) => {
                warn!("recv task error: {e}");
                broken.mark_broken();
                return;
            }
        }
    }
}

pub fn spawn_recv_task(
    reader: OwnedReadHalf,
    inbound: BoundedQueue<String>,
    broken: BrokenFlag,
) -> JoinHandle<()> {
    tokio::spawn(recv_loop(reader, inbound, broken))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = async { listener.accept().await.unwrap().0 };
        let (client, server) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn frame_round_trips() {
        let (client, server) = loopback_pair().await;
        let (_cr, mut cw) = client.into_split();
        let (mut sr, _sw) = server.into_split();

        write_frame(&mut cw, "hello").await.unwrap();
        let got = read_frame(&mut sr).await.unwrap();
        assert_eq!(got, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn empty_payload_is_not_sent() {
        let (client, server) = loopback_pair().await;
        let (_cr, mut cw) = client.into_split();
        let (mut sr, _sw) = server.into_split();

        write_frame(&mut cw, "").await.unwrap();
        write_frame(&mut cw, "next").await.unwrap();
        let got = read_frame(&mut sr).await.unwrap();
        assert_eq!(got, Some("next".to_string()));
    }

    #[tokio::test]
    async fn peer_close_yields_none() {
        let (client, server) = loopback_pair().await;
        drop(client);
        let (mut sr, _sw) = server.into_split();
        assert_eq!(read_frame(&mut sr).await.unwrap(), None);
    }
}
