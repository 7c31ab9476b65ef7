//! Background persistence of finalized sessions plus retention and quota
//! pruning.
//!
//! Writes go through a bounded queue that never blocks the producer: a full
//! queue rejects the submission and hands the session back. A fixed set of
//! writer tasks drains the queue, doing the file I/O on the blocking pool.
//! One prune task runs on an interval. Neither ever touches live capture
//! state.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock as SyncRwLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::{Session, SessionError, SessionMetadata, dir_size, session_dir};

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub write_workers: usize,
    pub queue_capacity: usize,
    pub retention: Duration,
    /// Quota pruning only starts once total usage passes this
    pub max_total_bytes: u64,
    pub max_player_bytes: u64,
    pub prune_interval: Duration,
    /// How long `stop` waits for queued writes before abandoning them
    pub shutdown_grace: Duration,
}

impl StorageConfig {
    /// Whether moving to `other` changes something only read at start.
    pub fn needs_restart(&self, other: &StorageConfig) -> bool {
        self.root != other.root
            || self.write_workers != other.write_workers
            || self.queue_capacity != other.queue_capacity
    }
}

/// Options shared with the prune task, which re-reads them every cycle.
type SharedConfig = Arc<SyncRwLock<StorageConfig>>;

fn current_config(config: &SharedConfig) -> StorageConfig {
    config.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage worker is already running")]
    AlreadyRunning,

    #[error("storage worker is not running")]
    NotRunning,

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A write that was not accepted. The session is handed back so the caller
/// can decide whether to retry or drop it.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("write queue is full")]
    QueueFull(Box<Session>),

    #[error("storage worker is stopped")]
    Stopped(Box<Session>),
}

impl SubmitError {
    pub fn into_session(self) -> Session {
        match self {
            SubmitError::QueueFull(session) | SubmitError::Stopped(session) => *session,
        }
    }
}

struct WriteJob {
    session: Session,
    finalize: bool,
}

#[derive(Default)]
struct StorageStats {
    queued: AtomicU64,
    sessions_written: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    rejected_full: AtomicU64,
    rejected_stopped: AtomicU64,
    prune_cycles: AtomicU64,
    directories_pruned: AtomicU64,
    bytes_pruned: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageStatsSnapshot {
    pub queued: u64,
    pub sessions_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub rejected_full: u64,
    pub rejected_stopped: u64,
    pub prune_cycles: u64,
    pub directories_pruned: u64,
    pub bytes_pruned: u64,
}

/// Per-player bytes on disk. Derived from the filesystem at start and kept
/// current by writes, prunes and purges.
#[derive(Default)]
pub struct StorageUsage {
    per_player: RwLock<HashMap<Uuid, u64>>,
}

impl StorageUsage {
    pub async fn player(&self, player_id: Uuid) -> u64 {
        self.per_player.read().await.get(&player_id).copied().unwrap_or(0)
    }

    pub async fn total(&self) -> u64 {
        self.per_player.read().await.values().sum()
    }

    pub async fn snapshot(&self) -> HashMap<Uuid, u64> {
        self.per_player.read().await.clone()
    }

    async fn replace(&self, usage: HashMap<Uuid, u64>) {
        *self.per_player.write().await = usage;
    }

    /// A directory of this player went from `before` to `after` bytes.
    async fn record_change(&self, player_id: Uuid, before: u64, after: u64) {
        let mut usage = self.per_player.write().await;
        let entry = usage.entry(player_id).or_insert(0);
        *entry = entry.saturating_sub(before).saturating_add(after);
        if *entry == 0 {
            usage.remove(&player_id);
        }
    }

    async fn remove(&self, player_id: Uuid) {
        self.per_player.write().await.remove(&player_id);
    }
}

/// What one prune cycle deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub expired: Vec<PathBuf>,
    pub over_quota: Vec<PathBuf>,
    pub freed_by_player: HashMap<Uuid, u64>,
    pub failures: usize,
}

impl PruneReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.over_quota.len()
    }

    pub fn bytes_freed(&self) -> u64 {
        self.freed_by_player.values().sum()
    }
}

/// A saved session as seen from the directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionListing {
    pub dir: PathBuf,
    pub session_id: Option<Uuid>,
    /// `None` when the metadata file is missing or unreadable
    pub metadata: Option<SessionMetadata>,
    pub bytes: u64,
}

struct Running {
    sender: mpsc::Sender<WriteJob>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct StorageWorker {
    config: SharedConfig,
    usage: Arc<StorageUsage>,
    stats: Arc<StorageStats>,
    running: Mutex<Option<Running>>,
}

impl StorageWorker {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config: Arc::new(SyncRwLock::new(config)),
            usage: Arc::new(StorageUsage::default()),
            stats: Arc::new(StorageStats::default()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> StorageConfig {
        current_config(&self.config)
    }

    /// Swap in new options. Retention, quotas, the prune interval and the
    /// shutdown grace are picked up by the next prune cycle or stop. The
    /// root, worker count and queue capacity wait for the next start; the
    /// return value says whether the change touched any of those.
    pub fn update_config(&self, config: StorageConfig) -> bool {
        let mut current = self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let restart = current.needs_restart(&config);
        *current = config;
        restart
    }

    /// Drain and stop, then start again with the current options.
    pub async fn restart(&self) -> Result<(), StorageError> {
        self.stop().await?;
        self.start().await
    }

    pub fn usage(&self) -> &StorageUsage {
        &self.usage
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Create the storage root, rebuild usage accounting from disk, and
    /// launch the writer and prune tasks.
    pub async fn start(&self) -> Result<(), StorageError> {
        if self.is_running() {
            return Err(StorageError::AlreadyRunning);
        }

        let config = self.config();
        let root = config.root.clone();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::Io {
                path: root.clone(),
                source,
            })?;

        let scan_root = root.clone();
        let usage = tokio::task::spawn_blocking(move || scan_usage(&scan_root))
            .await?
            .map_err(|source| StorageError::Io {
                path: root.clone(),
                source,
            })?;
        let total: u64 = usage.values().sum();
        info!(root = ?root, players = usage.len(), bytes = total, "Rebuilt storage accounting");
        self.usage.replace(usage).await;

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(config.write_workers + 1);

        for worker_id in 0..config.write_workers.max(1) {
            handles.push(tokio::spawn(run_write_worker(
                worker_id,
                root.clone(),
                receiver.clone(),
                self.usage.clone(),
                self.stats.clone(),
            )));
        }
        handles.push(tokio::spawn(run_prune_loop(
            Arc::clone(&self.config),
            self.usage.clone(),
            self.stats.clone(),
            token.clone(),
        )));

        let mut running = self.running();
        if running.is_some() {
            token.cancel();
            for handle in &handles {
                handle.abort();
            }
            return Err(StorageError::AlreadyRunning);
        }
        *running = Some(Running {
            sender,
            token,
            handles,
        });

        info!(
            workers = config.write_workers.max(1),
            queue = config.queue_capacity,
            "Storage worker started"
        );
        Ok(())
    }

    /// Close the queue, let the writers drain it for at most the grace period,
    /// then abandon whatever is still in flight.
    pub async fn stop(&self) -> Result<(), StorageError> {
        let Running {
            sender,
            token,
            mut handles,
        } = self.running().take().ok_or(StorageError::NotRunning)?;

        let pending = sender.max_capacity() - sender.capacity();
        drop(sender);
        token.cancel();
        info!(pending, "Stopping storage worker");

        let grace = self.config().shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Storage worker did not drain in time, abandoning in-flight writes"
            );
            for handle in &handles {
                handle.abort();
            }
        }

        info!("Storage worker stopped");
        Ok(())
    }

    /// Queue a session for writing without waiting. With `finalize` set the
    /// session is finalized by the writer before it is persisted.
    pub fn submit_write(&self, session: Session, finalize: bool) -> Result<(), SubmitError> {
        let running = self.running();
        let Some(running) = running.as_ref() else {
            self.stats.rejected_stopped.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::Stopped(Box::new(session)));
        };

        match running.sender.try_send(WriteJob { session, finalize }) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.stats.rejected_full.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %job.session.id(),
                    player_id = %job.session.player_id(),
                    "Write queue full, rejecting session"
                );
                Err(SubmitError::QueueFull(Box::new(job.session)))
            }
            Err(TrySendError::Closed(job)) => {
                self.stats.rejected_stopped.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Stopped(Box::new(job.session)))
            }
        }
    }

    /// Run one prune cycle right away.
    pub async fn prune_now(&self) -> Result<PruneReport, StorageError> {
        prune_and_account(&self.config(), &self.usage, &self.stats).await
    }

    /// Delete every saved session of a player. Returns the bytes freed.
    pub async fn purge_player(&self, player_id: Uuid) -> Result<u64, StorageError> {
        let dir = self.config().root.join(player_id.to_string());
        let path = dir.clone();
        let freed = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            if !dir.exists() {
                return Ok(0);
            }
            let bytes = player_usage(&dir)?;
            fs::remove_dir_all(&dir)?;
            Ok(bytes)
        })
        .await?
        .map_err(|source| StorageError::Io { path, source })?;

        self.usage.remove(player_id).await;
        info!(player_id = %player_id, bytes = freed, "Purged player recordings");
        Ok(freed)
    }

    /// Saved sessions of one player, oldest first.
    pub async fn list_sessions(
        &self,
        player_id: Uuid,
    ) -> Result<Vec<SessionListing>, StorageError> {
        let dir = self.config().root.join(player_id.to_string());
        let path = dir.clone();
        let listings = tokio::task::spawn_blocking(move || list_player_sessions(&dir))
            .await?
            .map_err(|source| StorageError::Io { path, source })?;
        Ok(listings)
    }

    pub async fn load_session(
        &self,
        player_id: Uuid,
        session_id: Uuid,
    ) -> Result<Session, StorageError> {
        let dir = session_dir(&self.config().root, player_id, session_id);
        let session = tokio::task::spawn_blocking(move || Session::load(&dir)).await??;
        Ok(session)
    }

    pub fn stats(&self) -> StorageStatsSnapshot {
        let s = &self.stats;
        StorageStatsSnapshot {
            queued: s.queued.load(Ordering::Relaxed),
            sessions_written: s.sessions_written.load(Ordering::Relaxed),
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            write_failures: s.write_failures.load(Ordering::Relaxed),
            rejected_full: s.rejected_full.load(Ordering::Relaxed),
            rejected_stopped: s.rejected_stopped.load(Ordering::Relaxed),
            prune_cycles: s.prune_cycles.load(Ordering::Relaxed),
            directories_pruned: s.directories_pruned.load(Ordering::Relaxed),
            bytes_pruned: s.bytes_pruned.load(Ordering::Relaxed),
        }
    }
}

async fn run_write_worker(
    worker_id: usize,
    root: PathBuf,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteJob>>>,
    usage: Arc<StorageUsage>,
    stats: Arc<StorageStats>,
) {
    debug!(worker_id, "Write worker started");
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            break;
        };
        write_session(worker_id, &root, job, &usage, &stats).await;
    }
    debug!(worker_id, "Write worker exiting");
}

async fn write_session(
    worker_id: usize,
    root: &Path,
    job: WriteJob,
    usage: &StorageUsage,
    stats: &StorageStats,
) {
    let WriteJob {
        mut session,
        finalize,
    } = job;
    if finalize {
        session.finalize();
    }
    let session_id = session.id();
    let player_id = session.player_id();

    let root = root.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let dir = session.directory(&root);
        let before = if dir.exists() { dir_size(&dir).unwrap_or(0) } else { 0 };
        let persisted = session.persist(&root)?;
        let after = dir_size(&persisted.dir).unwrap_or(persisted.bytes_written);
        Ok::<_, SessionError>((persisted, before, after))
    })
    .await;

    match result {
        Ok(Ok((persisted, before, after))) => {
            usage.record_change(player_id, before, after).await;
            stats.sessions_written.fetch_add(1, Ordering::Relaxed);
            stats.bytes_written.fetch_add(persisted.bytes_written, Ordering::Relaxed);
            info!(
                worker_id,
                session_id = %session_id,
                player_id = %player_id,
                bytes = persisted.bytes_written,
                dir = ?persisted.dir,
                "Session written"
            );
        }
        Ok(Err(e)) => {
            stats.write_failures.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, session_id = %session_id, error = %e, "Failed to write session");
        }
        Err(e) => {
            stats.write_failures.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, session_id = %session_id, error = %e, "Session write task failed");
        }
    }
}

/// First tick one full period from now.
fn prune_timer(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

async fn run_prune_loop(
    config: SharedConfig,
    usage: Arc<StorageUsage>,
    stats: Arc<StorageStats>,
    cancellation_token: CancellationToken,
) {
    let mut period = current_config(&config).prune_interval.max(Duration::from_millis(1));
    info!(interval_secs = period.as_secs(), "Starting prune service");
    let mut interval = prune_timer(period);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                info!("Prune service shutting down");
                break;
            }
            _ = interval.tick() => {
                let current = current_config(&config);
                if let Err(e) = prune_and_account(&current, &usage, &stats).await {
                    error!("Failed to run prune cycle: {}", e);
                }

                let next = current.prune_interval.max(Duration::from_millis(1));
                if next != period {
                    info!(interval_secs = next.as_secs(), "Prune interval changed");
                    period = next;
                    interval = prune_timer(period);
                }
            }
        }
    }
}

async fn prune_and_account(
    config: &StorageConfig,
    usage: &StorageUsage,
    stats: &StorageStats,
) -> Result<PruneReport, StorageError> {
    let prune_config = config.clone();
    let report =
        tokio::task::spawn_blocking(move || prune_storage(&prune_config, Utc::now())).await?;

    for (player_id, freed) in &report.freed_by_player {
        usage.record_change(*player_id, *freed, 0).await;
    }
    stats.prune_cycles.fetch_add(1, Ordering::Relaxed);
    stats
        .directories_pruned
        .fetch_add(report.removed() as u64, Ordering::Relaxed);
    stats.bytes_pruned.fetch_add(report.bytes_freed(), Ordering::Relaxed);

    if report.removed() > 0 || report.failures > 0 {
        info!(
            expired = report.expired.len(),
            over_quota = report.over_quota.len(),
            bytes = report.bytes_freed(),
            failures = report.failures,
            "Prune cycle finished"
        );
    }
    Ok(report)
}

/// Player directories under the root whose names are player ids.
fn player_dirs(root: &Path) -> io::Result<Vec<(Uuid, PathBuf)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().to_string_lossy().parse::<Uuid>() {
            Ok(player_id) => out.push((player_id, entry.path())),
            Err(_) => debug!(path = ?entry.path(), "Ignoring non-player directory"),
        }
    }
    Ok(out)
}

fn session_dirs(player_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(player_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn player_usage(player_dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for dir in session_dirs(player_dir)? {
        total += dir_size(&dir)?;
    }
    Ok(total)
}

/// Bytes on disk per player, straight from the directory tree.
pub fn scan_usage(root: &Path) -> io::Result<HashMap<Uuid, u64>> {
    let mut usage = HashMap::new();
    for (player_id, dir) in player_dirs(root)? {
        let bytes = player_usage(&dir)?;
        if bytes > 0 {
            usage.insert(player_id, bytes);
        }
    }
    Ok(usage)
}

fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// The time a session counts as recorded at: its metadata end (or start)
/// time, or the directory's mtime when the metadata can't be read.
fn session_time(dir: &Path) -> DateTime<Utc> {
    match SessionMetadata::read(dir) {
        Ok(metadata) => metadata.timestamp(),
        Err(_) => DateTime::<Utc>::from(modified_time(dir)),
    }
}

fn list_player_sessions(player_dir: &Path) -> io::Result<Vec<SessionListing>> {
    if !player_dir.exists() {
        return Ok(Vec::new());
    }
    let mut listings = Vec::new();
    for dir in session_dirs(player_dir)? {
        let metadata = SessionMetadata::read(&dir).ok();
        let session_id = dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse().ok());
        listings.push(SessionListing {
            bytes: dir_size(&dir).unwrap_or(0),
            session_id,
            metadata,
            dir,
        });
    }
    listings.sort_by_key(|listing| {
        listing
            .metadata
            .as_ref()
            .map(|m| m.start_time)
            .unwrap_or_else(|| DateTime::<Utc>::from(modified_time(&listing.dir)))
    });
    Ok(listings)
}

fn remove_session_dir(dir: &Path) -> io::Result<u64> {
    let bytes = dir_size(dir).unwrap_or(0);
    fs::remove_dir_all(dir)?;
    Ok(bytes)
}

/// One prune cycle over the whole tree. Retention runs first; the quota pass
/// only runs when total usage is over the global cap and only touches
/// players that are individually over theirs. Failures are logged and the
/// pass moves on.
pub fn prune_storage(config: &StorageConfig, now: DateTime<Utc>) -> PruneReport {
    let mut report = PruneReport::default();
    let players = match player_dirs(&config.root) {
        Ok(players) => players,
        Err(e) => {
            error!(root = ?config.root, error = %e, "Failed to list storage root");
            report.failures += 1;
            return report;
        }
    };

    for (player_id, player_dir) in &players {
        let dirs = match session_dirs(player_dir) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(dir = ?player_dir, error = %e, "Failed to list player sessions");
                report.failures += 1;
                continue;
            }
        };
        for dir in dirs {
            let age = now.signed_duration_since(session_time(&dir)).to_std();
            if !matches!(age, Ok(age) if age > config.retention) {
                continue;
            }
            match remove_session_dir(&dir) {
                Ok(bytes) => {
                    debug!(dir = ?dir, "Removed expired session");
                    *report.freed_by_player.entry(*player_id).or_insert(0) += bytes;
                    report.expired.push(dir);
                }
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Failed to remove expired session");
                    report.failures += 1;
                }
            }
        }
    }

    let mut usage: Vec<(Uuid, PathBuf, u64)> = Vec::with_capacity(players.len());
    for (player_id, player_dir) in players {
        match player_usage(&player_dir) {
            Ok(bytes) => usage.push((player_id, player_dir, bytes)),
            Err(e) => {
                warn!(dir = ?player_dir, error = %e, "Failed to measure player usage");
                report.failures += 1;
            }
        }
    }
    let total: u64 = usage.iter().map(|(_, _, bytes)| bytes).sum();
    if total <= config.max_total_bytes {
        return report;
    }

    for (player_id, player_dir, mut bytes) in usage {
        if bytes <= config.max_player_bytes {
            continue;
        }
        type Candidate = (SystemTime, DateTime<Utc>, PathBuf);
        let mut sessions: Vec<Candidate> = match session_dirs(&player_dir) {
            Ok(dirs) => dirs
                .into_iter()
                .map(|dir| (modified_time(&dir), session_time(&dir), dir))
                .collect(),
            Err(e) => {
                warn!(dir = ?player_dir, error = %e, "Failed to list player sessions");
                report.failures += 1;
                continue;
            }
        };
        sessions.sort();

        for (_, _, dir) in sessions {
            if bytes <= config.max_player_bytes {
                break;
            }
            match remove_session_dir(&dir) {
                Ok(freed) => {
                    debug!(dir = ?dir, "Removed session over player quota");
                    bytes = bytes.saturating_sub(freed);
                    *report.freed_by_player.entry(player_id).or_insert(0) += freed;
                    report.over_quota.push(dir);
                }
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Failed to remove session over quota");
                    report.failures += 1;
                }
            }
        }
    }

    report
}
