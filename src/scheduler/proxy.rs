//! The outbound channel a `slave_node` uses to forward inserts and
//! queries to its designated proxy node.
//!
//! Grounded on `NodeMessageSender.hpp`'s `sendLogToProxyNode` /
//! `sendMsgToProxyNode` pair: one framed connection, reused for both
//! fire-and-forget revocations and request/response queries.

use std::path::Path;

use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::codec::Message;
use crate::error::{NodeError, Result};
use crate::queue::BoundedQueue;
use crate::transport::{self, BrokenFlag};

pub struct ProxyClient {
    outbound: BoundedQueue<String>,
    inbound: BoundedQueue<Message>,
    broken: BrokenFlag,
    query_lock: AsyncMutex<()>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
    decode_task: JoinHandle<()>,
}

impl ProxyClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();

        let outbound = BoundedQueue::new(1024);
        let raw_inbound: BoundedQueue<String> = BoundedQueue::new(1024);
        let inbound = BoundedQueue::new(1024);
        let broken = BrokenFlag::new();

        let send_task = transport::spawn_send_task(write_half, outbound.clone(), broken.clone());
        let recv_task = {
            let raw_inbound = raw_inbound.clone();
            let broken = broken.clone();
            tokio::spawn(async move {
                transport::recv_loop(read_half, raw_inbound.clone(), broken).await;
                // The proxy client never reconnects, so closing here is
                // safe and is what lets a blocked query_is_revoked
                // observe the break instead of hanging forever.
                raw_inbound.close();
            })
        };
        let decode_task = tokio::spawn(decode_loop(raw_inbound, inbound.clone()));

        Ok(Self {
            outbound,
            inbound,
            broken,
            query_lock: AsyncMutex::new(()),
            send_task,
            recv_task,
            decode_task,
        })
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_broken()
    }

    /// Fire-and-forget; used both for live inserts and for log
    /// backfill during a role transition.
    pub async fn forward_revoke(&self, token: &str, exp_time: i64) {
        let msg = Message::new(
            "revoke_jwt",
            [
                ("token".to_string(), token.to_string()),
                ("exp_time".to_string(), exp_time.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        self.outbound.enqueue(msg.assemble()).await;
    }

    /// Sends `is_jwt_revoked` and awaits the matching response.
    /// Queries are serialized through an internal lock so that the
    /// next inbound frame after sending is unambiguously the answer.
    pub async fn query_is_revoked(&self, token: &str, exp_time: i64) -> Result<bool> {
        let _guard = self.query_lock.lock().await;

        let msg = Message::new(
            "is_jwt_revoked",
            [
                ("token".to_string(), token.to_string()),
                ("exp_time".to_string(), exp_time.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        self.outbound.enqueue(msg.assemble()).await;

        let reply = self
            .inbound
            .dequeue()
            .await
            .ok_or_else(|| NodeError::Protocol("proxy connection closed awaiting query reply".into()))?;
        if reply.event != "is_jwt_revoked_response" {
            return Err(NodeError::Protocol(format!(
                "expected is_jwt_revoked_response, got '{}'",
                reply.event
            )));
        }
        Ok(reply.get("status")? == "revoked")
    }

    /// Streams every still-live line of `log_dir` to the proxy as
    /// `revoke_jwt` messages, skipping naturally-expired records.
    /// Used once, on entering `slave_node`.
    pub async fn send_log_backfill(&self, log_dir: &Path) {
        let entries = match std::fs::read_dir(log_dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("log backfill: failed to read {}: {e}", log_dir.display());
                return;
            }
        };

        let now = chrono::Utc::now().timestamp();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in contents.lines() {
                let Some((token, exp_str)) = line.split_once(',') else {
                    continue;
                };
                let Ok(exp_time) = exp_str.trim().parse::<i64>() else {
                    continue;
                };
                if exp_time <= now {
                    continue;
                }
                self.forward_revoke(token, exp_time).await;
            }
        }
    }

    /// Closes the outbound queue and aborts the socket tasks. Takes
    /// `&self` rather than `self` so it runs through a shared `Arc`
    /// even while another clone is held across an in-flight query
    /// (`handle_is_jwt_revoked`'s `.await` over `proxy_client()`).
    /// Idempotent: aborting an already-aborted `JoinHandle` is a no-op.
    pub fn disconnect(&self) {
        self.outbound.close();
        self.send_task.abort();
        self.recv_task.abort();
        self.decode_task.abort();
    }
}

async fn decode_loop(raw_inbound: BoundedQueue<String>, inbound: BoundedQueue<Message>) {
    while let Some(raw) = raw_inbound.dequeue().await {
        match Message::parse(&raw) {
            Ok(msg) => inbound.enqueue(msg).await,
            Err(e) => warn!("dropping malformed proxy message: {e}"),
        }
    }
    inbound.close();
}
