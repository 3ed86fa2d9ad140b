//! The control-plane session: connect, authenticate, keep alive,
//! reconnect, and expose `recv_msg`/`async_send_msg` to the scheduler.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::codec::Message;
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::queue::BoundedQueue;
use crate::transport::{self, BrokenFlag};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// A connected, authenticated session with the master. Holds the
/// inbound/outbound queues the rest of the node talks to; the
/// connection itself is owned by a background supervisor task that
/// reconnects transparently on failure.
pub struct MasterSession {
    inbound: BoundedQueue<Message>,
    outbound: BoundedQueue<String>,
    _supervisor: JoinHandle<()>,
}

impl MasterSession {
    /// Connects, authenticates (fatal on `auth_failed`), then spawns
    /// the supervisor that runs send/recv/keepalive/watchdog for the
    /// life of the process.
    pub async fn connect(config: Config) -> Result<Self> {
        let outbound = BoundedQueue::new(4096);
        let raw_inbound: BoundedQueue<String> = BoundedQueue::new(4096);

        let stream = connect_and_authenticate(&config).await?;
        let inbound = BoundedQueue::new(4096);

        let supervisor = tokio::spawn(supervisor_task(
            config,
            stream,
            outbound.clone(),
            raw_inbound,
            inbound.clone(),
        ));

        Ok(Self {
            inbound,
            outbound,
            _supervisor: supervisor,
        })
    }

    /// Enqueues without blocking the caller beyond bounded-queue
    /// back-pressure.
    pub async fn async_send_msg(&self, msg: Message) {
        self.outbound.enqueue(msg.assemble()).await;
    }

    /// Blocks until the next application-level message is available,
    /// or `None` once the session is permanently closed.
    pub async fn recv_msg(&self) -> Option<Message> {
        self.inbound.dequeue().await
    }
}

/// Retries forever with a 5-second backoff until TCP connect succeeds,
/// then performs the `hello_from_client` handshake on a throwaway
/// framed pair. Returns the raw stream so the caller can split it and
/// start the long-lived worker tasks.
async fn connect_and_authenticate(config: &Config) -> Result<TcpStream> {
    loop {
        match TcpStream::connect((config.master_ip.as_str(), config.master_port)).await {
            Ok(stream) => match authenticate(stream, config).await {
                Ok(stream) => return Ok(stream),
                Err(NodeError::AuthFailed { client_uid }) => {
                    return Err(NodeError::AuthFailed { client_uid })
                }
                Err(e) => {
                    warn!("authentication attempt failed: {e}, retrying in 5s");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            },
            Err(e) => {
                warn!("connect to master {}:{} failed: {e}, retrying in 5s", config.master_ip, config.master_port);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

async fn authenticate(stream: TcpStream, config: &Config) -> Result<TcpStream> {
    let (mut read_half, mut write_half) = stream.into_split();

    let hello = Message::new(
        "hello_from_client",
        [
            ("client_uid".to_string(), config.client_uid.clone()),
            ("token".to_string(), config.token.clone()),
        ]
        .into_iter()
        .collect(),
    );
    transport::write_frame(&mut write_half, &hello.assemble()).await?;

    let reply = transport::read_frame(&mut read_half)
        .await?
        .ok_or_else(|| NodeError::Protocol("master closed connection during handshake".into()))?;
    let reply = Message::parse(&reply)?;

    match reply.event.as_str() {
        "auth_success" => {
            info!("authenticated with master as {}", config.client_uid);
            Ok(read_half.reunite(write_half).expect("halves came from the same stream"))
        }
        "auth_failed" => Err(NodeError::AuthFailed {
            client_uid: config.client_uid.clone(),
        }),
        other => Err(NodeError::Protocol(format!(
            "expected auth_success or auth_failed, got '{other}'"
        ))),
    }
}

/// Owns the socket for the life of the session; on any break,
/// reconnects and re-authenticates, preserving both queues.
async fn supervisor_task(
    config: Config,
    mut stream: TcpStream,
    outbound: BoundedQueue<String>,
    raw_inbound: BoundedQueue<String>,
    inbound: BoundedQueue<Message>,
) {
    loop {
        let broken = BrokenFlag::new();
        let (read_half, write_half) = stream.into_split();

        let mut send = transport::spawn_send_task(write_half, outbound.clone(), broken.clone());
        let mut recv = transport::spawn_recv_task(read_half, raw_inbound.clone(), broken.clone());
        let mut keepalive = tokio::spawn(keepalive_task(
            config.client_uid.clone(),
            config.keepalive_interval,
            outbound.clone(),
            broken.clone(),
        ));
        let mut decode = tokio::spawn(decode_task(raw_inbound.clone(), inbound.clone(), broken.clone()));

        // Structured cancellation: the first worker to stop (always
        // because the socket broke) signals the rest via the shared
        // broken flag; abort whichever are still running so a new
        // connection attempt doesn't race the stale ones.
        tokio::select! {
            _ = &mut send => {}
            _ = &mut recv => {}
            _ = &mut keepalive => {}
            _ = &mut decode => {}
        }
        broken.mark_broken();
        send.abort();
        recv.abort();
        keepalive.abort();
        decode.abort();

        warn!("master session connection broken, reconnecting");
        stream = match connect_and_authenticate(&config).await {
            Ok(s) => s,
            Err(e) => {
                warn!("fatal error while reconnecting to master: {e}");
                inbound.close();
                return;
            }
        };
    }
}

async fn keepalive_task(client_uid: String, interval_secs: u64, outbound: BoundedQueue<String>, broken: BrokenFlag) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if broken.is_broken() {
            return;
        }
        let msg = Message::new(
            "keepalive",
            [("client_uid".to_string(), client_uid.clone())].into_iter().collect(),
        );
        outbound.enqueue(msg.assemble()).await;
    }
}

/// Decodes raw frame payloads into [`Message`]s; malformed frames are
/// logged and dropped, the connection stays up.
async fn decode_task(raw_inbound: BoundedQueue<String>, inbound: BoundedQueue<Message>, broken: BrokenFlag) {
    loop {
        let Some(raw) = raw_inbound.dequeue().await else {
            return;
        };
        match Message::parse(&raw) {
            Ok(msg) => inbound.enqueue(msg).await,
            Err(e) => warn!("dropping malformed master message: {e}"),
        }
        if broken.is_broken() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config(master_port: u16) -> Config {
        Config {
            master_ip: "127.0.0.1".to_string(),
            master_port,
            client_uid: "node-1".to_string(),
            token: "secret".to_string(),
            keepalive_interval: 30,
            server_ip: "127.0.0.1".to_string(),
            server_port: 7000,
            node_status_report_interval: 60,
            log_file_path: std::path::PathBuf::from("/tmp/jwt-blacklist-test"),
        }
    }

    #[tokio::test]
    async fn auth_success_yields_connected_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = test_config(addr.port());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.into_split();
            let hello = transport::read_frame(&mut r).await.unwrap().unwrap();
            let msg = Message::parse(&hello).unwrap();
            assert_eq!(msg.event, "hello_from_client");
            assert_eq!(msg.get("client_uid").unwrap(), "node-1");

            let reply = Message::new("auth_success", Default::default());
            transport::write_frame(&mut w, &reply.assemble()).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let result = authenticate(stream, &config).await;
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn auth_failed_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = test_config(addr.port());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.into_split();
            let _ = transport::read_frame(&mut r).await.unwrap().unwrap();
            let reply = Message::new("auth_failed", Default::default());
            transport::write_frame(&mut w, &reply.assemble()).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let result = authenticate(stream, &config).await;
        assert!(matches!(result, Err(NodeError::AuthFailed { .. })));
        server.await.unwrap();
    }
}
