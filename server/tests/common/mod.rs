#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use ::common::{Frame, SegmentBuilder};
use chrono::{DateTime, Utc};
use server::config::ReplayConfig;
use server::orchestrator::{LivePlayerState, PlayerSnapshot};
use server::session::{Session, TriggerType};
use server::storage::StorageConfig;
use uuid::Uuid;

/// Configuration pointed at a scratch directory, with quotas and retention
/// out of the way unless a test sets them.
pub fn test_config(root: &Path) -> ReplayConfig {
    let mut config = ReplayConfig::default();
    config.storage_dir = root.to_path_buf();
    config.max_storage_bytes = u64::MAX;
    config.max_storage_per_player_bytes = u64::MAX;
    config.retention_period = Duration::from_secs(365 * 24 * 3600);
    config.prune_interval = Duration::from_secs(3600);
    config.compression_workers = 1;
    config.write_queue_capacity = 8;
    config
}

pub fn storage_config(root: &Path) -> StorageConfig {
    test_config(root).storage_config()
}

/// A finalized session holding one segment of `frames` frames walking
/// along x.
pub fn finished_session(player_id: Uuid, start: DateTime<Utc>, frames: usize) -> Session {
    let frames: Vec<Frame> = (0..frames)
        .map(|i| {
            let mut frame = Frame::new(player_id, start.timestamp_millis() + i as i64 * 50);
            frame.x = i as f64 * 0.25;
            frame.y = 64.0;
            frame.health = 20.0;
            frame
        })
        .collect();
    let mut session =
        Session::new_at(player_id, "tester", TriggerType::Manual, "integration", start);
    session
        .add_segment(SegmentBuilder::new(player_id).build(&frames).unwrap())
        .unwrap();
    session.finalize_at(start + chrono::Duration::milliseconds(frames.len() as i64 * 50));
    session
}

/// Live state driven by the test: positions are set explicitly.
pub struct ScriptedState {
    players: Mutex<HashMap<Uuid, PlayerSnapshot>>,
    tps: Mutex<f64>,
}

impl ScriptedState {
    pub fn new() -> Self {
        Self {
            players: Mutex::new(HashMap::new()),
            tps: Mutex::new(20.0),
        }
    }

    pub fn place(&self, player_id: Uuid, x: f64, y: f64, z: f64) {
        self.players
            .lock()
            .unwrap()
            .insert(player_id, PlayerSnapshot::at(x, y, z));
    }

    pub fn set_tps(&self, tps: f64) {
        *self.tps.lock().unwrap() = tps;
    }
}

impl LivePlayerState for ScriptedState {
    fn snapshot(&self, player_id: Uuid) -> Option<PlayerSnapshot> {
        self.players.lock().unwrap().get(&player_id).copied()
    }

    fn server_tps(&self) -> f64 {
        *self.tps.lock().unwrap()
    }
}
