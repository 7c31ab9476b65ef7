//! Per-tick capture driver.
//!
//! The orchestrator is owned by a single driver and never blocks: sampling
//! reads the live-state accessor, segments are cut in memory, and finished
//! sessions are handed to a [`SessionSink`] that only enqueues.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{BlockAction, Frame, FramePool, Movement, RingBuffer, SegmentBuilder, Stance};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReplayConfig;
use crate::session::{Session, TriggerType};
use crate::storage::{StorageWorker, SubmitError};

/// Observable state of one online player at the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerSnapshot {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub stance: Stance,
    pub animation: u8,
    pub held_item_slot: u8,
    pub held_item_id: u32,
    pub health: f32,
    pub armor: f32,
    pub status_effects: u32,
    pub action_code: u16,
    pub block_action: Option<BlockAction>,
    pub movement: Movement,
}

impl PlayerSnapshot {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            health: 20.0,
            ..Self::default()
        }
    }

    fn fill(&self, frame: &mut Frame) {
        frame.x = self.x;
        frame.y = self.y;
        frame.z = self.z;
        frame.yaw = self.yaw;
        frame.pitch = self.pitch;
        frame.vx = self.vx;
        frame.vy = self.vy;
        frame.vz = self.vz;
        frame.stance = self.stance;
        frame.animation = self.animation;
        frame.held_item_slot = self.held_item_slot;
        frame.held_item_id = self.held_item_id;
        frame.health = self.health;
        frame.armor = self.armor;
        frame.status_effects = self.status_effects;
        frame.action_code = self.action_code;
        frame.block_action = self.block_action;
        frame.movement = self.movement;
    }
}

/// Read-only access to the live game. Called on the tick path, so
/// implementations must not block.
pub trait LivePlayerState {
    /// `None` when the player cannot be sampled this tick.
    fn snapshot(&self, player_id: Uuid) -> Option<PlayerSnapshot>;

    fn server_tps(&self) -> f64;
}

/// Where finished sessions go. Implementations must not block.
pub trait SessionSink: Send + Sync {
    fn submit(&self, session: Session) -> Result<(), SubmitError>;
}

impl SessionSink for StorageWorker {
    fn submit(&self, session: Session) -> Result<(), SubmitError> {
        self.submit_write(session, true)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordingError {
    #[error("recording on {0} is disabled")]
    TriggerDisabled(TriggerType),

    #[error("player {player_id} is already recording session {session_id}")]
    AlreadyRecording { player_id: Uuid, session_id: Uuid },

    #[error("player {0} is not being recorded")]
    NotRecording(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetrics {
    pub ticks: u64,
    pub sampled_ticks: u64,
    pub frames_captured: u64,
    pub dropped_frames: u64,
    pub segments_cut: u64,
    pub segment_failures: u64,
    pub sessions_started: u64,
    pub sessions_submitted: u64,
    pub sessions_rejected: u64,
    pub sessions_discarded: u64,
    pub active_sessions: usize,
    pub tracked_players: usize,
    pub buffered_frames: usize,
    pub pool_hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    ticks: u64,
    sampled_ticks: u64,
    frames_captured: u64,
    dropped_frames: u64,
    segments_cut: u64,
    segment_failures: u64,
    sessions_started: u64,
    sessions_submitted: u64,
    sessions_rejected: u64,
    sessions_discarded: u64,
}

/// An open recording as seen from the management surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRecording {
    pub session_id: Uuid,
    pub player_id: Uuid,
    pub player_name: String,
    pub trigger: TriggerType,
    pub reason: String,
    pub start_time: DateTime<Utc>,
    pub segments: usize,
    pub frames: usize,
    pub buffered_frames: usize,
}

struct OpenSession {
    session: Session,
    last_cut_ms: i64,
}

struct TrackedPlayer {
    name: String,
    buffer: RingBuffer,
    open: Option<OpenSession>,
}

pub struct CaptureOrchestrator {
    config: ReplayConfig,
    pool: FramePool,
    sink: Arc<dyn SessionSink>,
    players: HashMap<Uuid, TrackedPlayer>,
    counters: Counters,
    last_tick_ms: Option<i64>,
}

fn wall_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

impl CaptureOrchestrator {
    pub fn new(config: ReplayConfig, sink: Arc<dyn SessionSink>) -> Self {
        let pool = FramePool::new(config.pool_capacity.max(1));
        Self {
            config,
            pool,
            sink,
            players: HashMap::new(),
            counters: Counters::default(),
            last_tick_ms: None,
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.last_tick_ms.unwrap_or_else(|| Utc::now().timestamp_millis())
    }

    fn builder(&self, player_id: Uuid) -> SegmentBuilder {
        SegmentBuilder::new(player_id)
            .tick_rate(self.config.effective_sample_rate())
            .capture_radius(self.config.capture_radius)
    }

    /// Swap in new options. Buffers are resized, the frame pool is rebuilt
    /// when its capacity changes, and continuous recording follows the new
    /// mode.
    pub fn update_config(&mut self, config: ReplayConfig) {
        let was_continuous = self.config.continuous_mode;
        self.config = config;

        let pool_capacity = self.config.pool_capacity.max(1);
        if pool_capacity != self.pool.capacity() {
            // Frames still out return to the old pool and are freed with it.
            self.pool = FramePool::new(pool_capacity);
            debug!(capacity = pool_capacity, "Rebuilt frame pool");
        }

        let capacity = self.config.buffer_capacity_frames();
        for player in self.players.values_mut() {
            player.buffer.resize(capacity);
        }

        match (was_continuous, self.config.continuous_mode) {
            (false, true) => {
                let ids: Vec<Uuid> = self.players.keys().copied().collect();
                for player_id in ids {
                    self.open_continuous(player_id);
                }
            }
            (true, false) => {
                let continuous: Vec<Uuid> = self
                    .players
                    .iter()
                    .filter(|(_, p)| {
                        p.open
                            .as_ref()
                            .is_some_and(|o| o.session.trigger() == TriggerType::Continuous)
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for player_id in continuous {
                    let _ = self.end_session(player_id);
                }
            }
            _ => {}
        }
    }

    pub fn on_player_join(&mut self, player_id: Uuid, name: &str) {
        self.track(player_id, name);
        if self.config.continuous_mode {
            self.open_continuous(player_id);
        }
    }

    fn track(&mut self, player_id: Uuid, name: &str) {
        if self.players.contains_key(&player_id) {
            return;
        }
        self.players.insert(
            player_id,
            TrackedPlayer {
                name: name.to_string(),
                buffer: RingBuffer::new(self.config.buffer_capacity_frames()),
                open: None,
            },
        );
        debug!(player_id = %player_id, name, "Tracking player");
    }

    /// Stop any open recording and release the player's buffered frames.
    pub fn on_player_leave(&mut self, player_id: Uuid) {
        if self.is_recording(player_id) {
            let _ = self.end_session(player_id);
        }
        if let Some(mut player) = self.players.remove(&player_id) {
            player.buffer.clear();
            debug!(player_id = %player_id, "Stopped tracking player");
        }
    }

    fn open_continuous(&mut self, player_id: Uuid) {
        let Some(player) = self.players.get(&player_id) else {
            return;
        };
        if player.open.is_some() {
            return;
        }
        let name = player.name.clone();
        let started =
            self.start_recording(player_id, &name, TriggerType::Continuous, "continuous mode");
        if let Err(e) = started {
            warn!(player_id = %player_id, error = %e, "Failed to open continuous session");
        }
    }

    fn trigger_enabled(&self, trigger: TriggerType) -> bool {
        match trigger {
            TriggerType::Suspicion => self.config.record_on_suspicion,
            TriggerType::Combat => self.config.record_on_combat,
            TriggerType::Report => self.config.record_on_report,
            TriggerType::Manual | TriggerType::Continuous => true,
        }
    }

    /// Open a session seeded with the player's buffered pre-roll.
    ///
    /// A player with an open continuous session has it closed and submitted
    /// first; any other open session is an error. Unknown players are
    /// tracked from here on.
    pub fn start_recording(
        &mut self,
        player_id: Uuid,
        name: &str,
        trigger: TriggerType,
        reason: &str,
    ) -> Result<Uuid, RecordingError> {
        if !self.trigger_enabled(trigger) {
            debug!(player_id = %player_id, trigger = %trigger, "Ignoring disabled trigger");
            return Err(RecordingError::TriggerDisabled(trigger));
        }

        self.track(player_id, name);
        let now_ms = self.now_ms();

        let current = self
            .players
            .get(&player_id)
            .and_then(|p| p.open.as_ref())
            .map(|o| (o.session.trigger(), o.session.id()));
        if let Some((open_trigger, session_id)) = current {
            if open_trigger != TriggerType::Continuous || trigger == TriggerType::Continuous {
                return Err(RecordingError::AlreadyRecording {
                    player_id,
                    session_id,
                });
            }
            // The continuous session ends without the buffered frames, which
            // become the new session's pre-roll.
            if let Some(open) = self.players.get_mut(&player_id).and_then(|p| p.open.take()) {
                info!(
                    player_id = %player_id,
                    session_id = %session_id,
                    "Closing continuous session for trigger"
                );
                self.close(open.session, now_ms);
            }
        }

        let builder = self.builder(player_id);
        let Some(player) = self.players.get_mut(&player_id) else {
            return Err(RecordingError::NotRecording(player_id));
        };

        let display_name = if name.is_empty() {
            player.name.clone()
        } else {
            name.to_string()
        };
        let started_at = wall_time(now_ms);
        let mut session = Session::new_at(player_id, &display_name, trigger, reason, started_at);
        let session_id = session.id();

        let preroll = player.buffer.len();
        if preroll > 0 {
            match builder.build(player.buffer.iter()) {
                Ok(segment) => {
                    // A fresh session is never finalized.
                    let _ = session.add_segment(segment);
                    self.counters.segments_cut += 1;
                }
                Err(e) => {
                    warn!(player_id = %player_id, error = %e, "Failed to encode pre-roll");
                    self.counters.segment_failures += 1;
                }
            }
            player.buffer.clear();
        }

        player.open = Some(OpenSession {
            session,
            last_cut_ms: now_ms,
        });
        self.counters.sessions_started += 1;
        info!(
            player_id = %player_id,
            session_id = %session_id,
            trigger = %trigger,
            preroll,
            "Started recording"
        );
        Ok(session_id)
    }

    /// Flush the buffer into a final segment, finalize, and hand the session
    /// to storage. A rejected submission is logged and counted; the session
    /// still counts as stopped.
    ///
    /// In continuous mode a player whose triggered session ends goes back to
    /// continuous recording.
    pub fn stop_recording(&mut self, player_id: Uuid) -> Result<Uuid, RecordingError> {
        let (session_id, trigger) = self.end_session(player_id)?;
        if self.config.continuous_mode && trigger != TriggerType::Continuous {
            self.open_continuous(player_id);
        }
        Ok(session_id)
    }

    fn end_session(&mut self, player_id: Uuid) -> Result<(Uuid, TriggerType), RecordingError> {
        let now_ms = self.now_ms();
        let builder = self.builder(player_id);
        let player = self
            .players
            .get_mut(&player_id)
            .ok_or(RecordingError::NotRecording(player_id))?;
        let mut open = player.open.take().ok_or(RecordingError::NotRecording(player_id))?;

        if !player.buffer.is_empty() {
            match builder.build(player.buffer.iter()) {
                Ok(segment) => {
                    let _ = open.session.add_segment(segment);
                    self.counters.segments_cut += 1;
                }
                Err(e) => {
                    warn!(player_id = %player_id, error = %e, "Failed to encode final segment");
                    self.counters.segment_failures += 1;
                }
            }
            player.buffer.clear();
        }

        let session_id = open.session.id();
        let trigger = open.session.trigger();
        info!(
            player_id = %player_id,
            session_id = %session_id,
            frames = open.session.frame_count(),
            segments = open.session.segments().len(),
            "Stopped recording"
        );
        self.close(open.session, now_ms);
        Ok((session_id, trigger))
    }

    /// Finalize and submit. Sessions that never captured a frame are dropped.
    fn close(&mut self, mut session: Session, now_ms: i64) {
        session.finalize_at(wall_time(now_ms));
        let session_id = session.id();
        if session.segments().is_empty() {
            self.counters.sessions_discarded += 1;
            debug!(
                session_id = %session_id,
                trigger = %session.trigger(),
                "Discarding empty session"
            );
            return;
        }
        match self.sink.submit(session) {
            Ok(()) => self.counters.sessions_submitted += 1,
            Err(e) => {
                self.counters.sessions_rejected += 1;
                warn!(session_id = %session_id, error = %e, "Session submission rejected");
            }
        }
    }

    /// Advance one server tick. Samples every tracked player when this tick
    /// is due and the server is keeping up.
    pub fn tick(&mut self, now_ms: i64, state: &dyn LivePlayerState) {
        self.counters.ticks += 1;
        self.last_tick_ms = Some(now_ms);

        if (self.counters.ticks - 1) % self.config.sample_interval_ticks() != 0 {
            return;
        }

        let tps = state.server_tps();
        if tps < self.config.min_tps_threshold {
            self.counters.dropped_frames += 1;
            debug!(
                tps,
                threshold = self.config.min_tps_threshold,
                "Skipping capture under low TPS"
            );
            return;
        }
        self.counters.sampled_ticks += 1;

        let segment_ms = self.config.segment_duration.as_millis() as i64;
        let tick_rate = self.config.effective_sample_rate();
        let radius = self.config.capture_radius;

        for (player_id, player) in self.players.iter_mut() {
            let Some(snapshot) = state.snapshot(*player_id) else {
                continue;
            };

            let mut frame = self.pool.acquire();
            frame.player_id = *player_id;
            frame.timestamp = now_ms;
            snapshot.fill(&mut frame);
            player.buffer.push(frame);
            self.counters.frames_captured += 1;

            let Some(open) = player.open.as_mut() else {
                continue;
            };
            if now_ms - open.last_cut_ms < segment_ms && !player.buffer.is_full() {
                continue;
            }

            let builder = SegmentBuilder::new(*player_id)
                .tick_rate(tick_rate)
                .capture_radius(radius);
            match builder.build(player.buffer.iter()) {
                Ok(segment) => {
                    debug!(
                        player_id = %player_id,
                        frames = segment.frame_count(),
                        bytes = segment.encoded_len(),
                        "Cut segment"
                    );
                    let _ = open.session.add_segment(segment);
                    self.counters.segments_cut += 1;
                }
                Err(e) => {
                    warn!(player_id = %player_id, error = %e, "Failed to cut segment");
                    self.counters.segment_failures += 1;
                }
            }
            player.buffer.clear();
            open.last_cut_ms = now_ms;
        }
    }

    /// Stop every open recording. Used on shutdown.
    pub fn stop_all(&mut self) -> usize {
        let recording: Vec<Uuid> = self
            .players
            .iter()
            .filter(|(_, p)| p.open.is_some())
            .map(|(id, _)| *id)
            .collect();
        for player_id in &recording {
            let _ = self.end_session(*player_id);
        }
        recording.len()
    }

    pub fn is_recording(&self, player_id: Uuid) -> bool {
        self.players.get(&player_id).is_some_and(|p| p.open.is_some())
    }

    pub fn is_tracked(&self, player_id: Uuid) -> bool {
        self.players.contains_key(&player_id)
    }

    pub fn buffered_frames(&self, player_id: Uuid) -> usize {
        self.players.get(&player_id).map_or(0, |p| p.buffer.len())
    }

    pub fn active_recordings(&self) -> Vec<ActiveRecording> {
        let mut active: Vec<ActiveRecording> = self
            .players
            .iter()
            .filter_map(|(player_id, player)| {
                let open = player.open.as_ref()?;
                Some(ActiveRecording {
                    session_id: open.session.id(),
                    player_id: *player_id,
                    player_name: open.session.player_name().to_string(),
                    trigger: open.session.trigger(),
                    reason: open.session.reason().to_string(),
                    start_time: open.session.start_time(),
                    segments: open.session.segments().len(),
                    frames: open.session.frame_count(),
                    buffered_frames: player.buffer.len(),
                })
            })
            .collect();
        active.sort_by_key(|a| a.start_time);
        active
    }

    pub fn active_recording(&self, session_id: Uuid) -> Option<ActiveRecording> {
        self.active_recordings()
            .into_iter()
            .find(|a| a.session_id == session_id)
    }

    pub fn metrics(&self) -> CaptureMetrics {
        let c = &self.counters;
        CaptureMetrics {
            ticks: c.ticks,
            sampled_ticks: c.sampled_ticks,
            frames_captured: c.frames_captured,
            dropped_frames: c.dropped_frames,
            segments_cut: c.segments_cut,
            segment_failures: c.segment_failures,
            sessions_started: c.sessions_started,
            sessions_submitted: c.sessions_submitted,
            sessions_rejected: c.sessions_rejected,
            sessions_discarded: c.sessions_discarded,
            active_sessions: self.players.values().filter(|p| p.open.is_some()).count(),
            tracked_players: self.players.len(),
            buffered_frames: self.players.values().map(|p| p.buffer.len()).sum(),
            pool_hit_rate: self.pool.stats().hit_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingSink {
        sessions: Mutex<Vec<Session>>,
        reject: AtomicBool,
    }

    impl CollectingSink {
        fn taken(&self) -> Vec<Session> {
            std::mem::take(&mut *self.sessions.lock().unwrap())
        }
    }

    impl SessionSink for CollectingSink {
        fn submit(&self, session: Session) -> Result<(), SubmitError> {
            if self.reject.load(Ordering::Relaxed) {
                return Err(SubmitError::QueueFull(Box::new(session)));
            }
            self.sessions.lock().unwrap().push(session);
            Ok(())
        }
    }

    struct World {
        players: HashMap<Uuid, PlayerSnapshot>,
        tps: f64,
    }

    impl World {
        fn with(players: &[Uuid]) -> Self {
            Self {
                players: players
                    .iter()
                    .map(|id| (*id, PlayerSnapshot::at(0.0, 64.0, 0.0)))
                    .collect(),
                tps: 20.0,
            }
        }

        fn walk(&mut self) {
            for snapshot in self.players.values_mut() {
                snapshot.x += 0.5;
            }
        }
    }

    impl LivePlayerState for World {
        fn snapshot(&self, player_id: Uuid) -> Option<PlayerSnapshot> {
            self.players.get(&player_id).copied()
        }

        fn server_tps(&self) -> f64 {
            self.tps
        }
    }

    fn setup(config: ReplayConfig) -> (CaptureOrchestrator, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (CaptureOrchestrator::new(config, sink.clone()), sink)
    }

    fn run(orchestrator: &mut CaptureOrchestrator, world: &mut World, from_ms: i64, ticks: i64) {
        for i in 0..ticks {
            world.walk();
            orchestrator.tick(from_ms + i * 50, world);
        }
    }

    #[test]
    fn test_sampling_follows_target_rate() {
        let mut config = ReplayConfig::default();
        config.target_fps = 10;
        let (mut orchestrator, _) = setup(config);
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");

        run(&mut orchestrator, &mut world, 0, 10);

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.ticks, 10);
        assert_eq!(metrics.sampled_ticks, 5);
        assert_eq!(metrics.frames_captured, 5);
        assert_eq!(orchestrator.buffered_frames(player), 5);
    }

    #[test]
    fn test_low_tps_skips_capture() {
        let (mut orchestrator, _) = setup(ReplayConfig::default());
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        world.tps = 12.0;
        orchestrator.on_player_join(player, "Alex");

        run(&mut orchestrator, &mut world, 0, 4);
        assert_eq!(orchestrator.metrics().dropped_frames, 4);
        assert_eq!(orchestrator.buffered_frames(player), 0);

        world.tps = 19.5;
        run(&mut orchestrator, &mut world, 200, 2);
        assert_eq!(orchestrator.metrics().dropped_frames, 4);
        assert_eq!(orchestrator.buffered_frames(player), 2);
    }

    #[test]
    fn test_unsampleable_player_is_skipped() {
        let (mut orchestrator, _) = setup(ReplayConfig::default());
        let online = Uuid::new_v4();
        let missing = Uuid::new_v4();
        let mut world = World::with(&[online]);
        orchestrator.on_player_join(online, "Alex");
        orchestrator.on_player_join(missing, "Sam");

        run(&mut orchestrator, &mut world, 0, 3);
        assert_eq!(orchestrator.buffered_frames(online), 3);
        assert_eq!(orchestrator.buffered_frames(missing), 0);
    }

    #[test]
    fn test_trigger_seeds_preroll_and_stop_submits() {
        let (mut orchestrator, sink) = setup(ReplayConfig::default());
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");
        run(&mut orchestrator, &mut world, 0, 5);

        let session_id = orchestrator
            .start_recording(player, "Alex", TriggerType::Manual, "watch")
            .unwrap();
        assert!(orchestrator.is_recording(player));
        assert_eq!(orchestrator.buffered_frames(player), 0);
        let active = orchestrator.active_recording(session_id).unwrap();
        assert_eq!(active.frames, 5);
        assert_eq!(active.segments, 1);

        run(&mut orchestrator, &mut world, 250, 3);
        assert_eq!(orchestrator.stop_recording(player), Ok(session_id));
        assert!(!orchestrator.is_recording(player));

        let sessions = sink.taken();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert!(session.is_finalized());
        assert_eq!(session.frame_count(), 8);
        assert_eq!(session.segments().len(), 2);
        assert_eq!(session.frames().next().map(|f| f.timestamp), Some(0));
        assert_eq!(session.frames().last().map(|f| f.timestamp), Some(350));
        assert_eq!(session.end_time().map(|t| t.timestamp_millis()), Some(350));

        assert_eq!(
            orchestrator.stop_recording(player),
            Err(RecordingError::NotRecording(player))
        );
    }

    #[test]
    fn test_disabled_trigger_is_ignored() {
        let mut config = ReplayConfig::default();
        config.record_on_combat = false;
        let (mut orchestrator, _) = setup(config);
        let player = Uuid::new_v4();

        assert_eq!(
            orchestrator.start_recording(player, "Alex", TriggerType::Combat, "hit"),
            Err(RecordingError::TriggerDisabled(TriggerType::Combat))
        );
        assert!(!orchestrator.is_recording(player));
        assert!(
            orchestrator
                .start_recording(player, "Alex", TriggerType::Report, "report")
                .is_ok()
        );
    }

    #[test]
    fn test_second_trigger_is_state_error() {
        let (mut orchestrator, _) = setup(ReplayConfig::default());
        let player = Uuid::new_v4();
        let first = orchestrator
            .start_recording(player, "Alex", TriggerType::Suspicion, "reach")
            .unwrap();

        assert_eq!(
            orchestrator.start_recording(player, "Alex", TriggerType::Combat, "hit"),
            Err(RecordingError::AlreadyRecording {
                player_id: player,
                session_id: first
            })
        );
    }

    #[test]
    fn test_trigger_replaces_continuous_session() {
        let mut config = ReplayConfig::default();
        config.continuous_mode = true;
        let (mut orchestrator, sink) = setup(config);
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");
        assert!(orchestrator.is_recording(player));

        run(&mut orchestrator, &mut world, 0, 4);
        let triggered = orchestrator
            .start_recording(player, "Alex", TriggerType::Suspicion, "fly")
            .unwrap();

        // Every frame moved into the pre-roll, so nothing is left to store.
        assert!(sink.taken().is_empty());
        assert_eq!(orchestrator.metrics().sessions_discarded, 1);

        let active = orchestrator.active_recording(triggered).unwrap();
        assert_eq!(active.trigger, TriggerType::Suspicion);
        assert_eq!(active.frames, 4);
    }

    #[test]
    fn test_continuous_resumes_after_triggered_session() {
        let mut config = ReplayConfig::default();
        config.continuous_mode = true;
        let (mut orchestrator, sink) = setup(config);
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");

        run(&mut orchestrator, &mut world, 0, 4);
        let triggered = orchestrator
            .start_recording(player, "Alex", TriggerType::Combat, "hit")
            .unwrap();
        run(&mut orchestrator, &mut world, 200, 2);
        assert_eq!(orchestrator.stop_recording(player), Ok(triggered));

        let submitted = sink.taken();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].trigger(), TriggerType::Combat);
        let resumed = orchestrator.active_recordings();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].trigger, TriggerType::Continuous);
        assert_ne!(resumed[0].session_id, triggered);

        let continuous = resumed[0].session_id;
        assert_eq!(orchestrator.stop_recording(player), Ok(continuous));
        assert!(!orchestrator.is_recording(player));
    }

    #[test]
    fn test_leave_during_trigger_does_not_resume() {
        let mut config = ReplayConfig::default();
        config.continuous_mode = true;
        let (mut orchestrator, sink) = setup(config);
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");
        orchestrator
            .start_recording(player, "Alex", TriggerType::Report, "spam")
            .unwrap();
        run(&mut orchestrator, &mut world, 0, 3);

        orchestrator.on_player_leave(player);
        assert!(!orchestrator.is_tracked(player));
        assert_eq!(orchestrator.metrics().active_sessions, 0);
        assert_eq!(sink.taken().len(), 1);
    }

    #[test]
    fn test_stop_all_does_not_resume() {
        let mut config = ReplayConfig::default();
        config.continuous_mode = true;
        let (mut orchestrator, _) = setup(config);
        let player = Uuid::new_v4();
        orchestrator.on_player_join(player, "Alex");
        orchestrator
            .start_recording(player, "Alex", TriggerType::Manual, "")
            .unwrap();

        assert_eq!(orchestrator.stop_all(), 1);
        assert!(!orchestrator.is_recording(player));
    }

    #[test]
    fn test_segment_cut_after_duration() {
        let mut config = ReplayConfig::default();
        config.segment_duration = Duration::from_secs(1);
        let (mut orchestrator, _) = setup(config);
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");

        run(&mut orchestrator, &mut world, 0, 1);
        let session_id = orchestrator
            .start_recording(player, "Alex", TriggerType::Manual, "")
            .unwrap();
        run(&mut orchestrator, &mut world, 50, 19);
        assert_eq!(orchestrator.active_recording(session_id).unwrap().segments, 1);

        run(&mut orchestrator, &mut world, 1_000, 1);
        let active = orchestrator.active_recording(session_id).unwrap();
        assert_eq!(active.segments, 2);
        assert_eq!(active.frames, 21);
        assert_eq!(active.buffered_frames, 0);
    }

    #[test]
    fn test_empty_session_is_not_submitted() {
        let (mut orchestrator, sink) = setup(ReplayConfig::default());
        let player = Uuid::new_v4();
        let session_id = orchestrator
            .start_recording(player, "Alex", TriggerType::Manual, "")
            .unwrap();

        assert_eq!(orchestrator.stop_recording(player), Ok(session_id));
        assert!(sink.taken().is_empty());
        let metrics = orchestrator.metrics();
        assert_eq!(metrics.sessions_discarded, 1);
        assert_eq!(metrics.sessions_submitted, 0);
    }

    #[test]
    fn test_leave_stops_and_releases_frames() {
        let (mut orchestrator, sink) = setup(ReplayConfig::default());
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");
        orchestrator.start_recording(player, "Alex", TriggerType::Manual, "").unwrap();
        run(&mut orchestrator, &mut world, 0, 6);

        let available = orchestrator.pool().available();
        orchestrator.on_player_leave(player);

        assert!(!orchestrator.is_tracked(player));
        assert_eq!(orchestrator.pool().available(), available + 6);
        assert_eq!(sink.taken().len(), 1);
        assert_eq!(orchestrator.metrics().tracked_players, 0);
    }

    #[test]
    fn test_rejected_submission_is_counted() {
        let (mut orchestrator, sink) = setup(ReplayConfig::default());
        sink.reject.store(true, Ordering::Relaxed);
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.start_recording(player, "Alex", TriggerType::Manual, "").unwrap();
        run(&mut orchestrator, &mut world, 0, 2);

        assert!(orchestrator.stop_recording(player).is_ok());
        let metrics = orchestrator.metrics();
        assert_eq!(metrics.sessions_rejected, 1);
        assert_eq!(metrics.sessions_submitted, 0);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[test]
    fn test_pool_capacity_change_takes_effect() {
        let (mut orchestrator, _) = setup(ReplayConfig::default());
        let player = Uuid::new_v4();
        let mut world = World::with(&[player]);
        orchestrator.on_player_join(player, "Alex");
        run(&mut orchestrator, &mut world, 0, 3);

        let mut config = orchestrator.config().clone();
        config.pool_capacity = 7;
        orchestrator.update_config(config);
        assert_eq!(orchestrator.pool().capacity(), 7);
        assert_eq!(orchestrator.buffered_frames(player), 3);

        run(&mut orchestrator, &mut world, 150, 2);
        assert_eq!(orchestrator.pool().stats().acquisitions, 2);
    }

    #[test]
    fn test_toggling_continuous_mode() {
        let (mut orchestrator, sink) = setup(ReplayConfig::default());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        orchestrator.on_player_join(a, "Alex");
        orchestrator.on_player_join(b, "Sam");
        orchestrator.start_recording(b, "Sam", TriggerType::Report, "spam").unwrap();

        let mut config = orchestrator.config().clone();
        config.continuous_mode = true;
        orchestrator.update_config(config.clone());
        assert_eq!(orchestrator.metrics().active_sessions, 2);
        let mut world = World::with(&[a, b]);
        run(&mut orchestrator, &mut world, 0, 2);

        config.continuous_mode = false;
        orchestrator.update_config(config);
        let submitted = sink.taken();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].player_id(), a);
        assert!(orchestrator.is_recording(b));
    }
}
