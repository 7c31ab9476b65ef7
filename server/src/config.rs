use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Runtime options of the capture and storage engine.
///
/// Every option has a public camelCase name used by the management commands
/// and a `REPLAY_*` environment variable (`targetFps` -> `REPLAY_TARGET_FPS`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayConfig {
    /// Fixed tick rate of the game server
    pub server_tick_rate: u32,
    /// Samples per second to record
    pub target_fps: u32,
    pub capture_radius: f32,
    /// Pre-roll history kept for every online player
    pub buffer_duration: Duration,
    /// Open sessions are cut into a segment this often
    pub segment_duration: Duration,
    pub continuous_mode: bool,
    pub record_on_suspicion: bool,
    pub record_on_combat: bool,
    pub record_on_report: bool,
    pub storage_dir: PathBuf,
    pub max_storage_bytes: u64,
    pub max_storage_per_player_bytes: u64,
    pub retention_period: Duration,
    /// Number of storage write workers
    pub compression_workers: usize,
    /// Capture is skipped while server TPS is below this
    pub min_tps_threshold: f64,
    pub write_queue_capacity: usize,
    pub prune_interval: Duration,
    pub shutdown_grace: Duration,
    pub pool_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            server_tick_rate: 20,
            target_fps: 20,
            capture_radius: 64.0,
            buffer_duration: Duration::from_secs(30),
            segment_duration: Duration::from_secs(60),
            continuous_mode: false,
            record_on_suspicion: true,
            record_on_combat: true,
            record_on_report: true,
            storage_dir: PathBuf::from("replays"),
            max_storage_bytes: 10 * 1024 * 1024 * 1024,
            max_storage_per_player_bytes: 512 * 1024 * 1024,
            retention_period: Duration::from_secs(7 * 24 * 60 * 60),
            compression_workers: 2,
            min_tps_threshold: 15.0,
            write_queue_capacity: 64,
            prune_interval: Duration::from_secs(10 * 60),
            shutdown_grace: Duration::from_secs(5),
            pool_capacity: common::DEFAULT_POOL_CAPACITY,
        }
    }
}

pub const OPTION_NAMES: &[&str] = &[
    "serverTickRate",
    "targetFps",
    "captureRadius",
    "bufferDuration",
    "segmentDuration",
    "continuousMode",
    "recordOnSuspicion",
    "recordOnCombat",
    "recordOnReport",
    "storageDir",
    "maxStorageBytes",
    "maxStoragePerPlayerBytes",
    "retentionPeriod",
    "compressionWorkers",
    "minTpsThreshold",
    "writeQueueCapacity",
    "pruneInterval",
    "shutdownGrace",
    "poolCapacity",
];

impl ReplayConfig {
    /// Defaults overridden by any `REPLAY_*` variables present in the
    /// environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        for name in OPTION_NAMES {
            let var = env_var_name(name);
            if let Ok(value) = std::env::var(&var) {
                config
                    .set(name, &value)
                    .with_context(|| format!("Failed to apply {}", var))?;
            }
        }
        Ok(config)
    }

    /// Server ticks between two samples; always at least one.
    pub fn sample_interval_ticks(&self) -> u64 {
        if self.target_fps == 0 {
            return 1;
        }
        let ratio = self.server_tick_rate as f64 / self.target_fps as f64;
        (ratio.round() as u64).max(1)
    }

    /// Effective samples per second after rounding the interval
    pub fn effective_sample_rate(&self) -> u32 {
        ((self.server_tick_rate as u64 / self.sample_interval_ticks()).max(1)) as u32
    }

    /// Ring buffer size in frames. Large enough to hold both the pre-roll and
    /// one whole segment.
    pub fn buffer_capacity_frames(&self) -> usize {
        let window = self.buffer_duration.max(self.segment_duration);
        let frames = window.as_secs_f64() * self.effective_sample_rate() as f64;
        (frames.ceil() as usize).max(1)
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            root: self.storage_dir.clone(),
            write_workers: self.compression_workers.max(1),
            queue_capacity: self.write_queue_capacity.max(1),
            retention: self.retention_period,
            max_total_bytes: self.max_storage_bytes,
            max_player_bytes: self.max_storage_per_player_bytes,
            prune_interval: self.prune_interval,
            shutdown_grace: self.shutdown_grace,
        }
    }

    /// Update one option by its public name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let value = value.trim();

        match key {
            "serverTickRate" => {
                self.server_tick_rate = parse_positive(value).map_err(|r| invalid(r))?
            }
            "targetFps" => self.target_fps = parse_positive(value).map_err(|r| invalid(r))?,
            "captureRadius" => {
                let radius: f32 = value.parse().map_err(|_| invalid("not a number"))?;
                if !radius.is_finite() || radius < 0.0 {
                    return Err(invalid("must be a non-negative number"));
                }
                self.capture_radius = radius;
            }
            "bufferDuration" => {
                self.buffer_duration = parse_duration(value).map_err(|r| invalid(r))?
            }
            "segmentDuration" => {
                let duration = parse_duration(value).map_err(|r| invalid(r))?;
                if duration.is_zero() {
                    return Err(invalid("must be greater than zero"));
                }
                self.segment_duration = duration;
            }
            "continuousMode" => self.continuous_mode = parse_bool(value).map_err(|r| invalid(r))?,
            "recordOnSuspicion" => {
                self.record_on_suspicion = parse_bool(value).map_err(|r| invalid(r))?
            }
            "recordOnCombat" => self.record_on_combat = parse_bool(value).map_err(|r| invalid(r))?,
            "recordOnReport" => self.record_on_report = parse_bool(value).map_err(|r| invalid(r))?,
            "storageDir" => {
                if value.is_empty() {
                    return Err(invalid("must not be empty"));
                }
                self.storage_dir = PathBuf::from(value);
            }
            "maxStorageBytes" => {
                self.max_storage_bytes = parse_bytes(value).map_err(|r| invalid(r))?
            }
            "maxStoragePerPlayerBytes" => {
                self.max_storage_per_player_bytes = parse_bytes(value).map_err(|r| invalid(r))?
            }
            "retentionPeriod" => {
                self.retention_period = parse_duration(value).map_err(|r| invalid(r))?
            }
            "compressionWorkers" => {
                self.compression_workers = parse_positive::<usize>(value).map_err(|r| invalid(r))?
            }
            "minTpsThreshold" => {
                let tps: f64 = value.parse().map_err(|_| invalid("not a number"))?;
                if !tps.is_finite() || tps < 0.0 {
                    return Err(invalid("must be a non-negative number"));
                }
                self.min_tps_threshold = tps;
            }
            "writeQueueCapacity" => {
                self.write_queue_capacity = parse_positive::<usize>(value).map_err(|r| invalid(r))?
            }
            "pruneInterval" => {
                let duration = parse_duration(value).map_err(|r| invalid(r))?;
                if duration.is_zero() {
                    return Err(invalid("must be greater than zero"));
                }
                self.prune_interval = duration;
            }
            "shutdownGrace" => self.shutdown_grace = parse_duration(value).map_err(|r| invalid(r))?,
            "poolCapacity" => {
                self.pool_capacity = parse_positive::<usize>(value).map_err(|r| invalid(r))?
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Current value of one option, formatted the way `set` accepts it.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "serverTickRate" => self.server_tick_rate.to_string(),
            "targetFps" => self.target_fps.to_string(),
            "captureRadius" => self.capture_radius.to_string(),
            "bufferDuration" => format_duration(self.buffer_duration),
            "segmentDuration" => format_duration(self.segment_duration),
            "continuousMode" => self.continuous_mode.to_string(),
            "recordOnSuspicion" => self.record_on_suspicion.to_string(),
            "recordOnCombat" => self.record_on_combat.to_string(),
            "recordOnReport" => self.record_on_report.to_string(),
            "storageDir" => self.storage_dir.display().to_string(),
            "maxStorageBytes" => self.max_storage_bytes.to_string(),
            "maxStoragePerPlayerBytes" => self.max_storage_per_player_bytes.to_string(),
            "retentionPeriod" => format_duration(self.retention_period),
            "compressionWorkers" => self.compression_workers.to_string(),
            "minTpsThreshold" => self.min_tps_threshold.to_string(),
            "writeQueueCapacity" => self.write_queue_capacity.to_string(),
            "pruneInterval" => format_duration(self.prune_interval),
            "shutdownGrace" => format_duration(self.shutdown_grace),
            "poolCapacity" => self.pool_capacity.to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        OPTION_NAMES
            .iter()
            .filter_map(|name| self.get(name).map(|value| (*name, value)))
            .collect()
    }
}

/// `targetFps` -> `REPLAY_TARGET_FPS`
pub fn env_var_name(option: &str) -> String {
    let mut out = String::from("REPLAY_");
    for c in option.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

fn parse_positive<T>(value: &str) -> Result<T, &'static str>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = value.parse().map_err(|_| "not an integer")?;
    if parsed <= T::default() {
        return Err("must be greater than zero");
    }
    Ok(parsed)
}

fn parse_bool(value: &str) -> Result<bool, &'static str> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err("expected true or false"),
    }
}

/// Accepts a bare number of seconds or a number with one of the suffixes
/// `ms`, `s`, `m`, `h`, `d`.
pub fn parse_duration(value: &str) -> Result<Duration, &'static str> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number.parse().map_err(|_| "expected a number with an optional unit")?;
    let millis_per_unit: u64 = match unit.trim() {
        "" | "s" => 1_000,
        "ms" => 1,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err("unknown unit (use ms, s, m, h or d)"),
    };
    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or("duration too large")
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis() as u64;
    const UNITS: [(u64, &str); 4] = [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    for (size, suffix) in UNITS {
        if millis >= size && millis % size == 0 {
            return format!("{}{}", millis / size, suffix);
        }
    }
    format!("{}ms", millis)
}

/// Accepts a bare byte count or a number with a binary suffix
/// (`k`, `m`, `g`, `t`, optionally followed by `b` or `ib`).
pub fn parse_bytes(value: &str) -> Result<u64, &'static str> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number.parse().map_err(|_| "expected a byte count")?;
    let unit = unit.trim().to_ascii_lowercase();
    let unit = unit.trim_end_matches('b').trim_end_matches('i');
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return Err("unknown size unit (use k, m, g or t)"),
    };
    amount.checked_mul(multiplier).ok_or("size too large")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_interval() {
        let mut config = ReplayConfig::default();
        assert_eq!(config.sample_interval_ticks(), 1);
        config.target_fps = 10;
        assert_eq!(config.sample_interval_ticks(), 2);
        assert_eq!(config.effective_sample_rate(), 10);
        config.target_fps = 40;
        assert_eq!(config.sample_interval_ticks(), 1);
        config.target_fps = 0;
        assert_eq!(config.sample_interval_ticks(), 1);
    }

    #[test]
    fn test_buffer_capacity_covers_segment() {
        let mut config = ReplayConfig::default();
        config.buffer_duration = Duration::from_secs(10);
        config.segment_duration = Duration::from_secs(30);
        assert_eq!(config.buffer_capacity_frames(), 600);
    }

    #[test]
    fn test_set_and_get_every_option() {
        let mut config = ReplayConfig::default();
        for (name, value) in config.clone().entries() {
            config.set(name, &value).unwrap();
            assert_eq!(config.get(name), Some(value));
        }
        assert_eq!(config, ReplayConfig::default());
    }

    #[test]
    fn test_set_validates() {
        let mut config = ReplayConfig::default();
        config.set("targetFps", "10").unwrap();
        config.set("retentionPeriod", "3d").unwrap();
        config.set("maxStoragePerPlayerBytes", "64MiB").unwrap();
        config.set("continuousMode", "on").unwrap();
        assert_eq!(config.target_fps, 10);
        assert_eq!(config.retention_period, Duration::from_secs(3 * 86_400));
        assert_eq!(config.max_storage_per_player_bytes, 64 * 1024 * 1024);
        assert!(config.continuous_mode);

        assert_eq!(
            config.set("bogus", "1"),
            Err(ConfigError::UnknownOption("bogus".to_string()))
        );
        for (key, value) in [
            ("targetFps", "0"),
            ("minTpsThreshold", "-1"),
            ("segmentDuration", "0s"),
            ("bufferDuration", "5 weeks"),
        ] {
            assert!(
                matches!(config.set(key, value), Err(ConfigError::InvalidValue { .. })),
                "{} = {}",
                key,
                value
            );
        }
    }

    #[test]
    fn test_duration_and_bytes_parsing() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7_200)));
        assert_eq!(format_duration(Duration::from_secs(7_200)), "2h");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1500ms");
        assert_eq!(parse_bytes("10GiB"), Ok(10 << 30));
        assert_eq!(parse_bytes("512k"), Ok(512 << 10));
        assert_eq!(parse_bytes("1234"), Ok(1234));
        assert!(parse_bytes("12 parsecs").is_err());
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("targetFps"), "REPLAY_TARGET_FPS");
        assert_eq!(env_var_name("maxStoragePerPlayerBytes"), "REPLAY_MAX_STORAGE_PER_PLAYER_BYTES");
    }
}
