//! Turns control-plane events into engine operations and runs the
//! three node-role state machine.

pub mod proxy;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::codec::Message;
use crate::config::Config;
use crate::engine::{Engine, EngineConfig};
use crate::error::{NodeError, Result};
use crate::master::MasterSession;
use crate::queue::BoundedQueue;

use proxy::ProxyClient;

/// The three roles a node can hold. Starts `SingleNode`; transitions
/// happen only in response to a master `adjust_bloom_filter` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    SingleNode,
    ProxyNode,
    SlaveNode { proxy_host: String, proxy_port: u16 },
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::SingleNode => "single_node",
            NodeRole::ProxyNode => "proxy_node",
            NodeRole::SlaveNode { .. } => "slave_node",
        }
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    master: Arc<MasterSession>,
    role: RwLock<NodeRole>,
    proxy: Mutex<Option<Arc<ProxyClient>>>,
    client_uid: String,
    node_port: u16,
    keepalive_interval: u64,
    status_interval: u64,
    log_dir: std::path::PathBuf,
}

impl Scheduler {
    /// Performs the initial `get_bloom_filter_default_config`
    /// handshake, builds the engine, and spawns the message
    /// processor, keepalive, and status reporter tasks.
    pub async fn start(config: Config, master: Arc<MasterSession>) -> Result<(Arc<Scheduler>, Arc<Engine>)> {
        master
            .async_send_msg(Message::new("get_bloom_filter_default_config", BTreeMap::new()))
            .await;

        // Large enough that a burst of pre-handshake events can't block
        // this enqueue and starve the wait for bloom_filter_default_config;
        // matches the capacity the rest of the node uses for its queues.
        let deferred: BoundedQueue<Message> = BoundedQueue::new(4096);
        let (config_tx, config_rx) = oneshot::channel::<Message>();

        let handshake_master = master.clone();
        let handshake_deferred = deferred.clone();
        tokio::spawn(async move {
            let mut config_tx = Some(config_tx);
            loop {
                let Some(msg) = handshake_master.recv_msg().await else {
                    return;
                };
                if msg.event == "bloom_filter_default_config" {
                    if let Some(tx) = config_tx.take() {
                        let _ = tx.send(msg);
                    }
                    return;
                }
                handshake_deferred.enqueue(msg).await;
            }
        });

        let config_msg = config_rx
            .await
            .map_err(|_| NodeError::Protocol("master closed before sending bloom_filter_default_config".into()))?;
        let engine_config = parse_engine_config(&config_msg)?;

        let engine = Engine::new(engine_config, config.log_file_path.clone())?;
        engine.start_background_tasks();

        let scheduler = Arc::new(Scheduler {
            engine: engine.clone(),
            master: master.clone(),
            role: RwLock::new(NodeRole::SingleNode),
            proxy: Mutex::new(None),
            client_uid: config.client_uid.clone(),
            node_port: config.server_port,
            keepalive_interval: config.keepalive_interval,
            status_interval: config.node_status_report_interval,
            log_dir: config.log_file_path.clone(),
        });

        deferred.close();
        tokio::spawn(message_processor_task(scheduler.clone(), deferred));
        tokio::spawn(keepalive_task(scheduler.clone()));
        tokio::spawn(status_reporter_task(scheduler.clone()));

        Ok((scheduler, engine))
    }

    pub fn role(&self) -> NodeRole {
        self.role.read().clone()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn proxy_client(&self) -> Option<Arc<ProxyClient>> {
        self.proxy.lock().clone()
    }

    async fn handle_event(&self, msg: Message) {
        match msg.event.as_str() {
            "revoke_jwt" => self.handle_revoke_jwt(&msg).await,
            "adjust_bloom_filter" => self.handle_adjust_bloom_filter(&msg).await,
            other => warn!("scheduler ignoring unknown event '{other}'"),
        }
    }

    async fn handle_revoke_jwt(&self, msg: &Message) {
        let (token, exp_time) = match parse_revoke_fields(msg) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping malformed revoke_jwt: {e}");
                return;
            }
        };

        match self.role() {
            NodeRole::SingleNode | NodeRole::ProxyNode => self.engine.revoke_jwt(&token, exp_time),
            NodeRole::SlaveNode { .. } => {
                if let Some(proxy) = self.proxy_client() {
                    proxy.forward_revoke(&token, exp_time).await;
                }
            }
        }
        // Every node persists every revocation it sees, so a later
        // role change can replay full history.
        self.engine.log_revoke(&token, exp_time).await;
    }

    async fn handle_adjust_bloom_filter(&self, msg: &Message) {
        let uuid = msg.get("uuid").unwrap_or_default().to_string();
        let node_role = match msg.get("node_role") {
            Ok(r) => r.to_string(),
            Err(e) => {
                warn!("dropping malformed adjust_bloom_filter: {e}");
                return;
            }
        };

        let result = match node_role.as_str() {
            "single_node" => self.transition_to_single_or_proxy(NodeRole::SingleNode, msg).await,
            "proxy_node" => self.transition_to_single_or_proxy(NodeRole::ProxyNode, msg).await,
            "slave_node" => self.transition_to_slave(msg).await,
            other => Err(NodeError::Protocol(format!("unknown node_role '{other}'"))),
        };

        if let Err(e) = result {
            warn!("role transition to '{node_role}' failed: {e}");
            return;
        }

        let reply = Message::new(
            "adjust_bloom_filter_done",
            [
                ("node_uid".to_string(), self.client_uid.clone()),
                ("uuid".to_string(), uuid),
                ("node_role".to_string(), self.role().as_str().to_string()),
            ]
            .into_iter()
            .collect(),
        );
        self.master.async_send_msg(reply).await;
    }

    fn disconnect_proxy_client(&self) {
        if let Some(client) = self.proxy.lock().take() {
            // `disconnect` takes `&self`, so teardown runs even if
            // another clone (e.g. a query held across an `.await` in
            // `handle_is_jwt_revoked`) is still outstanding.
            client.disconnect();
        }
    }

    async fn transition_to_single_or_proxy(&self, role: NodeRole, msg: &Message) -> Result<()> {
        self.disconnect_proxy_client();
        let new_config = parse_engine_config(msg)?;
        self.engine.adjust_parameters(new_config).await?;
        *self.role.write() = role;
        info!("node role is now {}", self.role().as_str());
        Ok(())
    }

    async fn transition_to_slave(&self, msg: &Message) -> Result<()> {
        let proxy_host = msg.get("proxy_node_host")?.to_string();
        let proxy_port: u16 = msg
            .get("proxy_node_port")?
            .parse()
            .map_err(|_| NodeError::Protocol("proxy_node_port is not a valid port".into()))?;

        self.disconnect_proxy_client();

        let client = ProxyClient::connect(&proxy_host, proxy_port).await?;
        client.send_log_backfill(&self.log_dir).await;
        *self.proxy.lock() = Some(Arc::new(client));

        // Effectively disables local storage: one giant slice that
        // never rotates away, sized to a placeholder.
        let current = self.engine.config();
        let minimal = EngineConfig {
            max_jwt_life_time: current.max_jwt_life_time.max(1),
            rotation_interval: current.max_jwt_life_time.max(1),
            bloom_filter_size: 8,
            hash_function_num: 1,
        };
        self.engine.adjust_parameters(minimal).await?;

        *self.role.write() = NodeRole::SlaveNode { proxy_host, proxy_port };
        info!("node role is now slave_node");
        Ok(())
    }
}

async fn message_processor_task(scheduler: Arc<Scheduler>, deferred: BoundedQueue<Message>) {
    while let Some(msg) = deferred.dequeue().await {
        scheduler.handle_event(msg).await;
    }
    while let Some(msg) = scheduler.master.recv_msg().await {
        scheduler.handle_event(msg).await;
    }
    warn!("scheduler message processor stopped: master session closed");
}

async fn keepalive_task(scheduler: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(scheduler.keepalive_interval.max(1)));
    loop {
        ticker.tick().await;
        let msg = Message::new(
            "keepalive",
            [
                ("client_uid".to_string(), scheduler.client_uid.clone()),
                ("node_port".to_string(), scheduler.node_port.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        scheduler.master.async_send_msg(msg).await;
    }
}

async fn status_reporter_task(scheduler: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(scheduler.status_interval.max(1)));
    loop {
        ticker.tick().await;
        let config = scheduler.engine.config();
        let filling_rate = scheduler
            .engine
            .filling_rate()
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let msg = Message::new(
            "bloom_filter_status",
            [
                ("client_uid".to_string(), scheduler.client_uid.clone()),
                ("max_jwt_life_time".to_string(), config.max_jwt_life_time.to_string()),
                ("rotation_interval".to_string(), config.rotation_interval.to_string()),
                ("bloom_filter_size".to_string(), config.bloom_filter_size.to_string()),
                ("hash_function_num".to_string(), config.hash_function_num.to_string()),
                ("bloom_filter_filling_rate".to_string(), filling_rate),
                ("bloom_filter_num".to_string(), scheduler.engine.slice_count().to_string()),
            ]
            .into_iter()
            .collect(),
        );
        scheduler.master.async_send_msg(msg).await;
    }
}

fn parse_engine_config(msg: &Message) -> Result<EngineConfig> {
    let field = |key: &str| -> Result<u64> {
        msg.get(key)?
            .parse::<u64>()
            .map_err(|_| NodeError::Protocol(format!("event '{}' field '{key}' is not a number", msg.event)))
    };
    Ok(EngineConfig {
        max_jwt_life_time: field("max_jwt_life_time")?,
        rotation_interval: field("rotation_interval")?,
        bloom_filter_size: field("bloom_filter_size")? as usize,
        hash_function_num: field("hash_function_num")? as u32,
    })
}

fn parse_revoke_fields(msg: &Message) -> Result<(String, i64)> {
    let token = msg.get("token")?.to_string();
    let exp_time = msg
        .get("exp_time")?
        .parse::<i64>()
        .map_err(|_| NodeError::Protocol("revoke_jwt field 'exp_time' is not a number".into()))?;
    Ok((token, exp_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_role_names_match_wire_protocol() {
        assert_eq!(NodeRole::SingleNode.as_str(), "single_node");
        assert_eq!(NodeRole::ProxyNode.as_str(), "proxy_node");
        assert_eq!(
            NodeRole::SlaveNode {
                proxy_host: "h".into(),
                proxy_port: 1
            }
            .as_str(),
            "slave_node"
        );
    }

    #[test]
    fn parse_engine_config_rejects_non_numeric_fields() {
        let msg = Message::new(
            "bloom_filter_default_config",
            [("max_jwt_life_time".to_string(), "not-a-number".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(parse_engine_config(&msg).is_err());
    }
}
