//! The client-facing query server: `is_jwt_revoked`, `revoke_jwt`
//! (proxy-node gated), and `get_revoke_log` streaming.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::codec::Message;
use crate::config::Config;
use crate::queue::BoundedQueue;
use crate::scheduler::{NodeRole, Scheduler};
use crate::transport::{self, BrokenFlag};

pub struct QueryServer {
    scheduler: Arc<Scheduler>,
    bind_addr: (String, u16),
}

impl QueryServer {
    pub fn new(config: &Config, scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            bind_addr: (config.server_ip.clone(), config.server_port),
        }
    }

    /// Binds and accepts forever, spawning a connection handler per
    /// accepted socket. Returns only on bind failure.
    pub async fn run(self) -> crate::error::Result<()> {
        let listener = TcpListener::bind((self.bind_addr.0.as_str(), self.bind_addr.1)).await?;
        info!("query server listening on {}:{}", self.bind_addr.0, self.bind_addr.1);

        loop {
            let (stream, peer) = listener.accept().await?;
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                handle_connection(stream, scheduler).await;
                info!("connection from {peer} closed");
            });
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, scheduler: Arc<Scheduler>) {
    let (read_half, write_half) = stream.into_split();
    let broken = BrokenFlag::new();

    let raw_inbound: BoundedQueue<String> = BoundedQueue::new(256);
    let outbound: BoundedQueue<String> = BoundedQueue::new(256);

    let recv = transport::spawn_recv_task(read_half, raw_inbound.clone(), broken.clone());
    let send = transport::spawn_send_task(write_half, outbound.clone(), broken.clone());
    let process = tokio::spawn(process_task(raw_inbound.clone(), outbound.clone(), scheduler));

    // Structured cancellation: whichever finishes first signals the
    // others to stop by closing the queues they block on.
    tokio::select! {
        _ = recv => {}
        _ = send => {}
        _ = process => {}
    }
    raw_inbound.close();
    outbound.close();
}

async fn process_task(inbound: BoundedQueue<String>, outbound: BoundedQueue<String>, scheduler: Arc<Scheduler>) {
    while let Some(raw) = inbound.dequeue().await {
        let msg = match Message::parse(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping malformed client message: {e}");
                continue;
            }
        };

        match msg.event.as_str() {
            "is_jwt_revoked" => handle_is_jwt_revoked(&msg, &scheduler, &outbound).await,
            "revoke_jwt" => handle_revoke_jwt(&msg, &scheduler).await,
            "get_revoke_log" => handle_get_revoke_log(&msg, &scheduler, &outbound).await,
            other => warn!("query server ignoring unknown event '{other}'"),
        }
    }
}

fn token_and_exp(msg: &Message) -> crate::error::Result<(String, i64)> {
    let token = msg.get("token")?.to_string();
    let exp_time = msg
        .get("exp_time")?
        .parse::<i64>()
        .map_err(|_| crate::error::NodeError::Protocol("field 'exp_time' is not a number".into()))?;
    Ok((token, exp_time))
}

async fn handle_is_jwt_revoked(msg: &Message, scheduler: &Arc<Scheduler>, outbound: &BoundedQueue<String>) {
    let (token, exp_time) = match token_and_exp(msg) {
        Ok(v) => v,
        Err(e) => {
            warn!("dropping malformed is_jwt_revoked: {e}");
            return;
        }
    };

    let revoked = match scheduler.role() {
        NodeRole::SingleNode | NodeRole::ProxyNode => scheduler.engine().is_revoked(&token, exp_time),
        NodeRole::SlaveNode { .. } => match scheduler.proxy_client() {
            Some(proxy) => match proxy.query_is_revoked(&token, exp_time).await {
                Ok(revoked) => revoked,
                Err(e) => {
                    warn!("proxy query failed: {e}");
                    false
                }
            },
            None => false,
        },
    };

    let status = if revoked { "revoked" } else { "active" };
    let reply = Message::new(
        "is_jwt_revoked_response",
        [
            ("token".to_string(), token),
            ("expTime".to_string(), exp_time.to_string()),
            ("status".to_string(), status.to_string()),
        ]
        .into_iter()
        .collect(),
    );
    outbound.enqueue(reply.assemble()).await;
}

/// Accepted only when the node is `proxy_node`; silently dropped in
/// every other role, including `slave_node`.
async fn handle_revoke_jwt(msg: &Message, scheduler: &Arc<Scheduler>) {
    if scheduler.role() != NodeRole::ProxyNode {
        return;
    }
    let (token, exp_time) = match token_and_exp(msg) {
        Ok(v) => v,
        Err(e) => {
            warn!("dropping malformed revoke_jwt: {e}");
            return;
        }
    };
    scheduler.engine().revoke_jwt(&token, exp_time);
    scheduler.engine().log_revoke(&token, exp_time).await;
}

async fn handle_get_revoke_log(msg: &Message, scheduler: &Arc<Scheduler>, outbound: &BoundedQueue<String>) {
    let Ok(hourly_timestamp) = msg.get("hourly_timestamp") else {
        warn!("dropping malformed get_revoke_log: missing hourly_timestamp");
        return;
    };
    let hourly_timestamp = hourly_timestamp.to_string();

    let log_dir = scheduler.engine().log_dir();
    let path = log_dir.join(format!("{hourly_timestamp}.txt"));
    let now = chrono::Utc::now().timestamp();

    if let Ok(contents) = tokio::fs::read_to_string(&path).await {
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
            let reply = Message::new(
                "get_revoke_log_response",
                [
                    ("token".to_string(), token.to_string()),
                    ("expTime".to_string(), exp_time.to_string()),
                ]
                .into_iter()
                .collect(),
            );
            outbound.enqueue(reply.assemble()).await;
        }
    }

    let done = Message::new(
        "get_revoke_log_done",
        [("hourly_timestamp".to_string(), hourly_timestamp)].into_iter().collect(),
    );
    outbound.enqueue(done.assemble()).await;
}
