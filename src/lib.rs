//! A distributed JWT revocation blacklist node.
//!
//! Each node holds a time-sliced bloom-filter structure that records
//! revoked JWTs with expiry, answers `is_jwt_revoked` queries for
//! client applications, and cooperates with a central master to form a
//! small cluster of nodes. Revocations are persisted to hourly
//! append-only log files so a restarted or re-parameterized node can
//! rebuild its in-memory state exactly.
//!
//! # Architecture
//!
//! - `filter`: a single fixed-width bloom filter with SHA-256 index derivation
//! - `queue`: a bounded async FIFO used by every producer/consumer pair in the node
//! - `transport`: length-prefixed message framing over TCP
//! - `codec`: the `{event, data}` JSON message format
//! - `engine`: the sliced bloom-filter revocation engine (insert, query, rotate, rebuild, recover)
//! - `master`: the control-plane session (connect, authenticate, keepalive, reconnect)
//! - `scheduler`: drives engine config, handles master events, runs the node-role state machine
//! - `server`: the client-facing query server
//! - `config`: configuration file parsing

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod master;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use codec::Message;
pub use config::Config;
pub use engine::{Engine, EngineConfig};
pub use error::{NodeError, Result};
pub use master::MasterSession;
pub use scheduler::{NodeRole, Scheduler};
pub use server::QueryServer;
