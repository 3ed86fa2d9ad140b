//! The sliced bloom-filter revocation engine: insert, query, time-driven
//! rotation, parameter rebuild, and log-backed recovery.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone, Timelike};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};
use crate::filter::BaseFilter;
use crate::queue::BoundedQueue;

const RECOVERY_RETENTION_HOURS: i64 = 24;

/// The mutable tuple of engine parameters. Changes only take effect
/// atomically through [`Engine::adjust_parameters`], which replaces the
/// slice ring wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_jwt_life_time: u64,
    pub rotation_interval: u64,
    pub bloom_filter_size: usize,
    pub hash_function_num: u32,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_jwt_life_time == 0 {
            return Err(NodeError::InvalidArgument("max_jwt_life_time cannot be 0".into()));
        }
        if self.rotation_interval == 0 {
            return Err(NodeError::InvalidArgument("rotation_interval cannot be 0".into()));
        }
        if self.bloom_filter_size == 0 {
            return Err(NodeError::InvalidArgument("bloom_filter_size cannot be 0".into()));
        }
        Ok(())
    }

    fn slice_count(&self) -> usize {
        div_ceil_u64(self.max_jwt_life_time, self.rotation_interval) as usize
    }
}

/// The current ordered slice ring: slice 0 is current, slice `i` covers
/// tokens expiring within `(i+1) * rotation_interval` seconds.
struct SliceRing {
    slices: VecDeque<BaseFilter>,
    config: EngineConfig,
}

impl SliceRing {
    fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let n = config.slice_count();
        let mut slices = VecDeque::with_capacity(n);
        for _ in 0..n {
            slices.push_back(BaseFilter::new(config.bloom_filter_size, config.hash_function_num)?);
        }
        Ok(Self { slices, config })
    }

    fn rotate(&mut self) {
        self.slices.pop_front();
        self.slices.push_back(
            BaseFilter::new(self.config.bloom_filter_size, self.config.hash_function_num)
                .expect("ring parameters were already validated"),
        );
    }

    /// Number of leading slices a record with `remaining` seconds of
    /// life must be written to / checked against, or `None` if the
    /// record is outside the retention window.
    fn slices_for_remaining(&self, remaining: i64) -> Option<usize> {
        if remaining <= 0 || remaining as u64 > self.config.max_jwt_life_time {
            return None;
        }
        let n = div_ceil_i64(remaining, self.config.rotation_interval as i64) as usize;
        if n > self.slices.len() {
            return None;
        }
        Some(n)
    }
}

fn div_ceil_u64(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

fn div_ceil_i64(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The hourly bucket timestamp (truncated to the hour, in local time)
/// that `unix_time` falls into.
fn hourly_timestamp(unix_time: i64) -> i64 {
    let local = Local
        .timestamp_opt(unix_time, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(unix_time, 0).earliest().unwrap());
    local
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local)
        .timestamp()
}

/// The sliced bloom-filter revocation engine.
pub struct Engine {
    ring: RwLock<SliceRing>,
    log_dir: PathBuf,
    log_queue: BoundedQueue<String>,
    rotation_notify: Notify,
    running: std::sync::atomic::AtomicBool,
}

/// Handles to the engine's background tasks, returned so the caller can
/// join them on shutdown.
pub struct EngineTasks {
    pub rotation: JoinHandle<()>,
    pub log_writer: JoinHandle<()>,
}

impl Engine {
    /// Builds the initial slice ring, replays the log directory into
    /// it, and returns the engine ready to have its background tasks
    /// started. Runs before any task exists, so no locking is needed
    /// for the recovery pass itself.
    pub fn new(config: EngineConfig, log_dir: PathBuf) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&log_dir)?;
        let ring = recover_from_log(config, &log_dir)?;
        Ok(Arc::new(Self {
            ring: RwLock::new(ring),
            log_dir,
            log_queue: BoundedQueue::new(4096),
            rotation_notify: Notify::new(),
            running: std::sync::atomic::AtomicBool::new(true),
        }))
    }

    pub fn config(&self) -> EngineConfig {
        self.ring.read().config
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// `token` is written to every slice within its remaining-life
    /// window; out-of-window records are silently discarded.
    pub fn revoke_jwt(&self, token: &str, exp_time: i64) {
        let remaining = exp_time - now_secs();
        let mut ring = self.ring.write();
        let Some(n) = ring.slices_for_remaining(remaining) else {
            return;
        };
        for slice in ring.slices.iter_mut().take(n) {
            slice.add(token);
        }
    }

    /// True iff every slice covering `token`'s remaining life reports
    /// it present; always false outside the retention window.
    pub fn is_revoked(&self, token: &str, exp_time: i64) -> bool {
        let remaining = exp_time - now_secs();
        let ring = self.ring.read();
        let Some(n) = ring.slices_for_remaining(remaining) else {
            return false;
        };
        ring.slices.iter().take(n).all(|slice| slice.contains(token))
    }

    /// Enqueues the revocation for best-effort persistence; I/O errors
    /// on the log writer do not fail this call.
    pub async fn log_revoke(&self, token: &str, exp_time: i64) {
        self.log_queue.enqueue(format!("{token},{exp_time}\n")).await;
    }

    /// `[slice.msg_num for slice in ring]`, oldest-covering-slice last.
    pub fn filling_rate(&self) -> Vec<u64> {
        self.ring.read().slices.iter().map(BaseFilter::msg_num).collect()
    }

    pub fn slice_count(&self) -> usize {
        self.ring.read().slices.len()
    }

    /// Builds a fresh ring under the new parameters, replays log
    /// records into it, and only then swaps it in — an allocation or
    /// validation failure leaves the running engine untouched.
    pub async fn adjust_parameters(&self, new_config: EngineConfig) -> Result<()> {
        let new_ring = tokio::task::spawn_blocking({
            let log_dir = self.log_dir.clone();
            move || recover_from_log(new_config, &log_dir)
        })
        .await
        .map_err(|e| NodeError::Protocol(format!("parameter rebuild task panicked: {e}")))??;

        *self.ring.write() = new_ring;
        self.rotation_notify.notify_waiters();
        info!(
            "engine parameters adjusted: max_jwt_life_time={}, rotation_interval={}, bloom_filter_size={}, hash_function_num={}",
            new_config.max_jwt_life_time,
            new_config.rotation_interval,
            new_config.bloom_filter_size,
            new_config.hash_function_num,
        );
        Ok(())
    }

    /// Spawns the rotation and log-writer tasks. Call once, after
    /// construction.
    pub fn start_background_tasks(self: &Arc<Self>) -> EngineTasks {
        EngineTasks {
            rotation: tokio::spawn(rotation_task(self.clone())),
            log_writer: tokio::spawn(log_writer_task(self.clone())),
        }
    }

    /// Idempotent. Wakes the rotation task so it can observe shutdown
    /// and closes the log queue so the writer task drains and exits.
    pub fn stop(&self) {
        self.running.store(false, std::sync::atomic::Ordering::Release);
        self.rotation_notify.notify_waiters();
        self.log_queue.close();
    }
}

async fn rotation_task(engine: Arc<Engine>) {
    loop {
        let interval = engine.ring.read().config.rotation_interval;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                let mut ring = engine.ring.write();
                ring.rotate();
                let mem_bytes = ring.slices.len() * ring.config.bloom_filter_size / 8;
                drop(ring);
                info!("rotated bloom filter slices, approx {mem_bytes} bytes resident");
            }
            _ = engine.rotation_notify.notified() => {
                if !engine.running.load(std::sync::atomic::Ordering::Acquire) {
                    debug!("rotation task stopping");
                    return;
                }
                debug!("rotation interval reset, no rotation performed");
            }
        }
    }
}

async fn log_writer_task(engine: Arc<Engine>) {
    while let Some(line) = engine.log_queue.dequeue().await {
        let path = engine.log_dir.join(format!("{}.txt", hourly_timestamp(now_secs())));
        if let Err(e) = append_line(&path, &line).await {
            warn!("failed to persist revocation to {}: {e}", path.display());
        }
    }
    debug!("log writer task stopped");
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await
}

/// Computes the 24 candidate hourly filenames ending at the current
/// hour, keeps the ones that exist, deletes every other file in the
/// directory, then replays the surviving files oldest-first, skipping
/// dead or malformed records.
fn recover_from_log(config: EngineConfig, log_dir: &Path) -> Result<SliceRing> {
    let mut ring = SliceRing::new(config)?;

    let current_hour = hourly_timestamp(now_secs());
    let mut candidates: Vec<i64> = (0..RECOVERY_RETENTION_HOURS)
        .map(|i| current_hour - i * 3600)
        .collect();
    candidates.reverse();

    let mut found = Vec::new();
    for ts in &candidates {
        let path = log_dir.join(format!("{ts}.txt"));
        if path.is_file() {
            found.push(path);
        }
    }

    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && !found.contains(&path) {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to remove stale log file {}: {e}", path.display());
                } else {
                    debug!("removed stale log file {}", path.display());
                }
            }
        }
    }

    let mut replayed = 0u64;
    for path in &found {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to read log file {}: {e}", path.display());
                continue;
            }
        };
        for line in contents.lines() {
            let Some((token, exp_time_str)) = line.split_once(',') else {
                warn!("skipping malformed log line in {}: {line:?}", path.display());
                continue;
            };
            let Ok(exp_time) = exp_time_str.trim().parse::<i64>() else {
                warn!("skipping malformed expiry in {}: {exp_time_str:?}", path.display());
                continue;
            };
            let remaining = exp_time - now_secs();
            if let Some(n) = ring.slices_for_remaining(remaining) {
                for slice in ring.slices.iter_mut().take(n) {
                    slice.add(token);
                }
            }
            replayed += 1;
            if replayed % 10_000 == 0 {
                debug!("recovery: replayed {replayed} records so far");
            }
        }
    }
    info!("recovery complete: replayed {replayed} records from {} files", found.len());

    Ok(ring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(max: u64, rot: u64) -> EngineConfig {
        EngineConfig {
            max_jwt_life_time: max,
            rotation_interval: rot,
            bloom_filter_size: 1024,
            hash_function_num: 5,
        }
    }

    #[tokio::test]
    async fn ring_has_exact_slice_count() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config(3600, 600), dir.path().to_path_buf()).unwrap();
        assert_eq!(engine.slice_count(), 6);
    }

    #[tokio::test]
    async fn revoke_then_query_within_window_is_true() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config(3600, 600), dir.path().to_path_buf()).unwrap();
        let exp = now_secs() + 1800;
        engine.revoke_jwt("abc", exp);
        assert!(engine.is_revoked("abc", exp));
        assert!(!engine.is_revoked("xyz", exp));
    }

    #[tokio::test]
    async fn naturally_expired_record_is_a_no_op() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config(3600, 600), dir.path().to_path_buf()).unwrap();
        let exp = now_secs() - 5;
        engine.revoke_jwt("abc", exp);
        assert!(!engine.is_revoked("abc", exp));
        assert_eq!(engine.filling_rate().iter().sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn record_outside_retention_window_is_a_no_op() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config(3600, 600), dir.path().to_path_buf()).unwrap();
        let exp = now_secs() + 7200;
        engine.revoke_jwt("abc", exp);
        assert!(!engine.is_revoked("abc", exp));
    }

    #[tokio::test]
    async fn rotation_preserves_still_live_tokens() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config(10, 1), dir.path().to_path_buf()).unwrap();
        let exp = now_secs() + 7;
        engine.revoke_jwt("t", exp);

        for _ in 0..3 {
            engine.ring.write().rotate();
        }
        assert!(engine.is_revoked("t", exp));
    }

    #[tokio::test]
    async fn adjust_parameters_rebuilds_ring_dimensions() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config(3600, 600), dir.path().to_path_buf()).unwrap();
        engine
            .adjust_parameters(config(7200, 900))
            .await
            .unwrap();
        assert_eq!(engine.slice_count(), 8);
        assert_eq!(engine.config().max_jwt_life_time, 7200);
    }

    #[tokio::test]
    async fn log_round_trip_survives_restart() {
        let dir = tempdir().unwrap();
        let cfg = config(3600, 600);
        let engine = Engine::new(cfg, dir.path().to_path_buf()).unwrap();
        let tasks = engine.start_background_tasks();

        let exp = now_secs() + 1800;
        engine.revoke_jwt("restart-me", exp);
        engine.log_revoke("restart-me", exp).await;

        // give the writer task a chance to flush
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop();
        let _ = tasks.rotation.await;
        let _ = tasks.log_writer.await;

        let restarted = Engine::new(cfg, dir.path().to_path_buf()).unwrap();
        assert!(restarted.is_revoked("restart-me", exp));
    }
}
