//! Management facade over capture and storage.
//!
//! Every management call answers with a human-readable string, ready to be
//! relayed to whatever command surface sits in front of the service.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ReplayConfig;
use crate::orchestrator::{CaptureOrchestrator, LivePlayerState};
use crate::session::TriggerType;
use crate::storage::StorageWorker;

pub type SharedPlayerState = Arc<dyn LivePlayerState + Send + Sync>;

struct CaptureLoop {
    state: SharedPlayerState,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ReplayService {
    config: RwLock<ReplayConfig>,
    orchestrator: Arc<Mutex<CaptureOrchestrator>>,
    storage: Arc<StorageWorker>,
    /// Parent of every capture loop's token
    cancellation_token: CancellationToken,
    capture: Mutex<Option<CaptureLoop>>,
}

impl ReplayService {
    pub fn new(config: ReplayConfig) -> Self {
        let storage = Arc::new(StorageWorker::new(config.storage_config()));
        let orchestrator = CaptureOrchestrator::new(config.clone(), storage.clone());
        Self {
            config: RwLock::new(config),
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            storage,
            cancellation_token: CancellationToken::new(),
            capture: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> Arc<Mutex<CaptureOrchestrator>> {
        self.orchestrator.clone()
    }

    pub fn storage(&self) -> &Arc<StorageWorker> {
        &self.storage
    }

    pub async fn config(&self) -> ReplayConfig {
        self.config.read().await.clone()
    }

    /// Start the storage worker and the capture loop.
    pub async fn start(&self, state: SharedPlayerState) -> Result<()> {
        self.storage
            .start()
            .await
            .context("Failed to start storage worker")?;

        let tick_rate = self.config.read().await.server_tick_rate;
        let mut capture = self.capture.lock().await;
        if let Some(previous) = capture.take() {
            join_capture(previous).await;
        }
        *capture = Some(self.spawn_capture(state, tick_rate));
        info!(tick_rate, "Replay service started");
        Ok(())
    }

    fn spawn_capture(&self, state: SharedPlayerState, tick_rate: u32) -> CaptureLoop {
        let token = self.cancellation_token.child_token();
        let handle = tokio::spawn(run_capture_loop(
            self.orchestrator.clone(),
            state.clone(),
            tick_rate,
            token.clone(),
        ));
        CaptureLoop {
            state,
            token,
            handle,
        }
    }

    /// Replace a running capture loop with one at `tick_rate`. Returns false
    /// when no loop is running.
    async fn restart_capture(&self, tick_rate: u32) -> bool {
        let mut capture = self.capture.lock().await;
        let Some(running) = capture.take() else {
            return false;
        };
        let state = running.state.clone();
        join_capture(running).await;
        *capture = Some(self.spawn_capture(state, tick_rate));
        true
    }

    pub async fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.handle.is_finished())
    }

    /// Stop capturing, submit every open recording, then drain storage.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down replay service");
        self.cancellation_token.cancel();
        if let Some(capture) = self.capture.lock().await.take() {
            join_capture(capture).await;
        }

        let stopped = self.orchestrator.lock().await.stop_all();
        if stopped > 0 {
            info!("Submitted {} open recordings", stopped);
        }

        self.storage
            .stop()
            .await
            .context("Failed to stop storage worker")?;
        info!("Replay service shut down");
        Ok(())
    }

    pub async fn list_active(&self) -> String {
        let active = self.orchestrator.lock().await.active_recordings();
        if active.is_empty() {
            return "No active recordings".to_string();
        }

        let mut out = format!("{} active recording(s):", active.len());
        for recording in active {
            let _ = write!(
                out,
                "\n  {} {} ({}) trigger={} segments={} frames={} buffered={} since {}",
                recording.session_id,
                recording.player_name,
                recording.player_id,
                recording.trigger,
                recording.segments,
                recording.frames,
                recording.buffered_frames,
                recording.start_time.format("%Y-%m-%d %H:%M:%S"),
            );
        }
        out
    }

    pub async fn list_sessions(&self, player_id: Uuid) -> String {
        let listings = match self.storage.list_sessions(player_id).await {
            Ok(listings) => listings,
            Err(e) => return format!("Failed to list sessions for {}: {}", player_id, e),
        };
        if listings.is_empty() {
            return format!("No saved sessions for {}", player_id);
        }

        let mut out = format!("{} saved session(s) for {}:", listings.len(), player_id);
        for listing in listings {
            match listing.metadata {
                Some(metadata) => {
                    let _ = write!(
                        out,
                        "\n  {} trigger={} frames={} segments={} bytes={} started {}",
                        metadata.session_id,
                        metadata.trigger,
                        metadata.total_frames,
                        metadata.segment_count,
                        listing.bytes,
                        metadata.start_time.format("%Y-%m-%d %H:%M:%S"),
                    );
                }
                None => {
                    let _ = write!(
                        out,
                        "\n  {:?} incomplete, bytes={}",
                        listing.dir, listing.bytes
                    );
                }
            }
        }
        out
    }

    /// Status of a session, whether it is still recording or already saved.
    pub async fn session_status(&self, player_id: Uuid, session_id: Uuid) -> String {
        if let Some(active) = self.orchestrator.lock().await.active_recording(session_id) {
            return format!(
                "Session {} is recording: player={} trigger={} reason={:?} \
                 segments={} frames={} buffered={}",
                session_id,
                active.player_name,
                active.trigger,
                active.reason,
                active.segments,
                active.frames,
                active.buffered_frames,
            );
        }

        let listings = match self.storage.list_sessions(player_id).await {
            Ok(listings) => listings,
            Err(e) => return format!("Failed to read sessions for {}: {}", player_id, e),
        };
        match listings.into_iter().find(|l| l.session_id == Some(session_id)) {
            Some(listing) => match listing.metadata {
                Some(metadata) => format!(
                    "Session {} is saved: player={} trigger={} reason={:?} \
                     frames={} segments={} bytes={} start={} end={}",
                    session_id,
                    metadata.player_name,
                    metadata.trigger,
                    metadata.reason,
                    metadata.total_frames,
                    metadata.segment_count,
                    metadata.total_bytes,
                    metadata.start_time.to_rfc3339(),
                    metadata.end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                ),
                None => format!("Session {} is incomplete on disk", session_id),
            },
            None => format!("Session {} not found", session_id),
        }
    }

    pub async fn purge_player(&self, player_id: Uuid) -> String {
        match self.storage.purge_player(player_id).await {
            Ok(0) => format!("No saved data for {}", player_id),
            Ok(bytes) => format!("Purged {} bytes of recordings for {}", bytes, player_id),
            Err(e) => format!("Failed to purge {}: {}", player_id, e),
        }
    }

    pub async fn show_config(&self) -> String {
        let config = self.config.read().await;
        let mut out = String::from("Replay configuration:");
        for (name, value) in config.entries() {
            let _ = write!(out, "\n  {} = {}", name, value);
        }
        out
    }

    pub async fn set_config(&self, key: &str, value: &str) -> String {
        let mut config = self.config.write().await;
        let mut updated = config.clone();
        if let Err(e) = updated.set(key, value) {
            return format!("Cannot set {}: {}", key, e);
        }

        self.orchestrator.lock().await.update_config(updated.clone());
        let storage_restart = self.storage.update_config(updated.storage_config());
        let tick_rate_changed = updated.server_tick_rate != config.server_tick_rate;
        *config = updated;
        let current = config.get(key).unwrap_or_default();
        info!(key, value = %current, "Configuration updated");

        let mut restarted = Vec::new();
        if storage_restart && self.storage.is_running() {
            if let Err(e) = self.storage.restart().await {
                error!("Failed to restart storage worker: {}", e);
                return format!("Set {} = {} but storage failed to restart: {}", key, current, e);
            }
            restarted.push("storage restarted");
        }
        if tick_rate_changed && self.restart_capture(config.server_tick_rate).await {
            restarted.push("capture loop restarted");
        }

        if restarted.is_empty() {
            format!("Set {} = {}", key, current)
        } else {
            format!("Set {} = {} ({})", key, current, restarted.join(", "))
        }
    }

    pub async fn start_recording(
        &self,
        player_id: Uuid,
        name: &str,
        trigger: &str,
        reason: &str,
    ) -> String {
        let trigger = match trigger.parse::<TriggerType>() {
            Ok(trigger) => trigger,
            Err(e) => return e,
        };
        match self
            .orchestrator
            .lock()
            .await
            .start_recording(player_id, name, trigger, reason)
        {
            Ok(session_id) => format!("Recording {} as session {}", player_id, session_id),
            Err(e) => format!("Cannot start recording: {}", e),
        }
    }

    pub async fn stop_recording(&self, player_id: Uuid) -> String {
        match self.orchestrator.lock().await.stop_recording(player_id) {
            Ok(session_id) => format!("Stopped session {} for {}", session_id, player_id),
            Err(e) => format!("Cannot stop recording: {}", e),
        }
    }

    pub async fn metrics(&self) -> String {
        let capture = self.orchestrator.lock().await.metrics();
        let pool = self.orchestrator.lock().await.pool().stats();
        let report = json!({
            "capture": capture,
            "pool": pool,
            "storage": self.storage.stats(),
            "usageBytes": self.storage.usage().total().await,
        });
        serde_json::to_string_pretty(&report)
            .unwrap_or_else(|e| format!("Failed to render metrics: {}", e))
    }
}

async fn join_capture(capture: CaptureLoop) {
    capture.token.cancel();
    match tokio::time::timeout(Duration::from_secs(5), capture.handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Capture loop panicked: {:?}", e),
        Err(_) => error!("Capture loop shutdown timed out"),
    }
}

/// Drive the orchestrator at the server tick rate until cancelled.
pub async fn run_capture_loop(
    orchestrator: Arc<Mutex<CaptureOrchestrator>>,
    state: SharedPlayerState,
    tick_rate: u32,
    cancellation_token: CancellationToken,
) {
    info!("Starting capture loop at {} ticks/s", tick_rate);

    let period = Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancellation_token.cancelled() => {
                info!("Capture loop shutting down");
                break;
            }

            _ = interval.tick() => {
                let now_ms = Utc::now().timestamp_millis();
                orchestrator.lock().await.tick(now_ms, state.as_ref());
            }
        }
    }

    debug!("Capture loop finished");
}
