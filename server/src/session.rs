//! Recording episodes and their on-disk layout.
//!
//! A session directory looks like
//! `<root>/<playerId>/<sessionId>/{session.properties, segment_0000.rbx, ...}`.
//! Metadata is written last, so a directory without it is an interrupted
//! write that pruning will eventually collect.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use common::{FormatError, Frame, SEGMENT_FILE_EXTENSION, Segment};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const METADATA_FILE: &str = "session.properties";
const SEGMENT_PREFIX: &str = "segment_";

/// What caused a recording to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Suspicion,
    Combat,
    Continuous,
    Report,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Suspicion => "suspicion",
            TriggerType::Combat => "combat",
            TriggerType::Continuous => "continuous",
            TriggerType::Report => "report",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(TriggerType::Manual),
            "suspicion" | "anticheat" | "anti_cheat" => Ok(TriggerType::Suspicion),
            "combat" => Ok(TriggerType::Combat),
            "continuous" => Ok(TriggerType::Continuous),
            "report" => Ok(TriggerType::Report),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is finalized and can no longer change")]
    Finalized(Uuid),

    #[error("session {0} must be finalized before it is persisted")]
    NotFinalized(Uuid),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("segment {path:?} is corrupt: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error("invalid session metadata in {path:?}: {reason}")]
    Metadata { path: PathBuf, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SessionError + '_ {
    move |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The key/value record stored next to a session's segments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub player_id: Uuid,
    pub player_name: String,
    pub trigger: TriggerType,
    pub reason: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_frames: u64,
    pub segment_count: u64,
    pub total_bytes: u64,
}

impl SessionMetadata {
    /// End time when known, otherwise start time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }

    pub fn to_properties(&self) -> String {
        let end_time = self
            .end_time
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();
        let entries = [
            ("sessionId", self.session_id.to_string()),
            ("playerId", self.player_id.to_string()),
            ("playerName", escape(&self.player_name)),
            ("triggerType", self.trigger.to_string()),
            ("reason", escape(&self.reason)),
            ("startTime", self.start_time.timestamp_millis().to_string()),
            ("endTime", end_time),
            ("totalFrames", self.total_frames.to_string()),
            ("segmentCount", self.segment_count.to_string()),
            ("totalBytes", self.total_bytes.to_string()),
        ];

        let mut out = String::from("# replay session\n");
        for (key, value) in entries {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str, path: &Path) -> Result<SessionMetadata, SessionError> {
        let bad = |reason: String| SessionError::Metadata {
            path: path.to_path_buf(),
            reason,
        };

        let mut values = std::collections::HashMap::new();
        for line in text.lines() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| bad(format!("line without '=': {}", line)))?;
            values.insert(key.trim(), value);
        }

        let field = |key: &str| {
            values
                .get(key)
                .copied()
                .ok_or_else(|| bad(format!("missing {}", key)))
        };
        let uuid = |key: &str| -> Result<Uuid, SessionError> {
            field(key)?
                .trim()
                .parse()
                .map_err(|e| bad(format!("{}: {}", key, e)))
        };
        let number = |key: &str| -> Result<u64, SessionError> {
            field(key)?
                .trim()
                .parse()
                .map_err(|e| bad(format!("{}: {}", key, e)))
        };
        let time = |raw: &str, key: &str| -> Result<DateTime<Utc>, SessionError> {
            let millis: i64 = raw.trim().parse().map_err(|e| bad(format!("{}: {}", key, e)))?;
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| bad(format!("{} out of range", key)))
        };

        let end_raw = field("endTime")?;
        let end_time = if end_raw.trim().is_empty() {
            None
        } else {
            Some(time(end_raw, "endTime")?)
        };

        Ok(SessionMetadata {
            session_id: uuid("sessionId")?,
            player_id: uuid("playerId")?,
            player_name: unescape(field("playerName")?),
            trigger: field("triggerType")?.parse::<TriggerType>().map_err(|e| bad(e))?,
            reason: unescape(field("reason")?),
            start_time: time(field("startTime")?, "startTime")?,
            end_time,
            total_frames: number("totalFrames")?,
            segment_count: number("segmentCount")?,
            total_bytes: number("totalBytes")?,
        })
    }

    /// Read `session.properties` from a session directory.
    pub fn read(dir: &Path) -> Result<SessionMetadata, SessionError> {
        let path = dir.join(METADATA_FILE);
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        Self::parse(&text, &path)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

pub fn segment_file_name(index: usize) -> String {
    format!("{}{:04}.{}", SEGMENT_PREFIX, index, SEGMENT_FILE_EXTENSION)
}

/// The index encoded in a segment file name, `None` for anything else.
fn segment_index(name: &str) -> Option<usize> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_FILE_EXTENSION)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn is_segment_file(name: &str) -> bool {
    segment_index(name).is_some()
}

/// Segment files in `dir`, ordered by index rather than by name.
fn segment_files(dir: &Path) -> Result<Vec<(usize, PathBuf)>, SessionError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if let Some(index) = segment_index(&entry.file_name().to_string_lossy()) {
            files.push((index, entry.path()));
        }
    }
    files.sort_unstable_by_key(|(index, _)| *index);
    Ok(files)
}

/// Where a session lives under a storage root.
pub fn session_dir(root: &Path, player_id: Uuid, session_id: Uuid) -> PathBuf {
    root.join(player_id.to_string()).join(session_id.to_string())
}

/// Outcome of writing a session to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    pub dir: PathBuf,
    /// Bytes of every file written, metadata included
    pub bytes_written: u64,
}

/// One recording episode: a single trigger for a single player.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    player_id: Uuid,
    player_name: String,
    trigger: TriggerType,
    reason: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    segments: Vec<Segment>,
    finalized: bool,
}

impl Session {
    pub fn new(player_id: Uuid, player_name: &str, trigger: TriggerType, reason: &str) -> Self {
        Self::new_at(player_id, player_name, trigger, reason, Utc::now())
    }

    pub fn new_at(
        player_id: Uuid,
        player_name: &str,
        trigger: TriggerType,
        reason: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            player_id,
            player_name: player_name.to_string(),
            trigger,
            reason: reason.to_string(),
            // stored with millisecond precision on disk
            start_time: start_time.trunc_subsecs(3),
            end_time: None,
            segments: Vec::new(),
            finalized: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn player_id(&self) -> Uuid {
        self.player_id
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn trigger(&self) -> TriggerType {
        self.trigger
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn frame_count(&self) -> usize {
        self.segments.iter().map(Segment::frame_count).sum()
    }

    /// Encoded size of all segments
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.encoded_len() as u64).sum()
    }

    /// Time spanned by the recorded frames.
    pub fn duration_ms(&self) -> i64 {
        match (self.segments.first(), self.segments.last()) {
            (Some(first), Some(last)) => {
                last.end_timestamp().saturating_sub(first.start_timestamp())
            }
            _ => 0,
        }
    }

    pub fn add_segment(&mut self, segment: Segment) -> Result<(), SessionError> {
        if self.finalized {
            return Err(SessionError::Finalized(self.id));
        }
        self.segments.push(segment);
        Ok(())
    }

    /// Stamp the end time and freeze the session. Calling it again is a no-op.
    pub fn finalize(&mut self) {
        self.finalize_at(Utc::now());
    }

    pub fn finalize_at(&mut self, end_time: DateTime<Utc>) {
        if self.finalized {
            return;
        }
        self.end_time = Some(end_time.trunc_subsecs(3));
        self.finalized = true;
    }

    /// Every frame of every segment, in capture order.
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        self.segments.iter().flat_map(|segment| segment.frames())
    }

    /// The last frame recorded at or before `timestamp`.
    pub fn frame_at(&self, timestamp: i64) -> Option<Frame> {
        self.segments
            .iter()
            .rev()
            .find(|segment| segment.start_timestamp() <= timestamp)
            .and_then(|segment| segment.frame_at(timestamp))
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            session_id: self.id,
            player_id: self.player_id,
            player_name: self.player_name.clone(),
            trigger: self.trigger,
            reason: self.reason.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            total_frames: self.frame_count() as u64,
            segment_count: self.segments.len() as u64,
            total_bytes: self.total_bytes(),
        }
    }

    pub fn directory(&self, root: &Path) -> PathBuf {
        session_dir(root, self.player_id, self.id)
    }

    /// Write the session under `root`. Only finalized sessions may be
    /// persisted; writing the same session again yields the same files.
    pub fn persist(&self, root: &Path) -> Result<PersistedSession, SessionError> {
        if !self.finalized {
            return Err(SessionError::NotFinalized(self.id));
        }

        let dir = self.directory(root);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let mut bytes_written = 0u64;
        for (index, segment) in self.segments.iter().enumerate() {
            let path = dir.join(segment_file_name(index));
            write_atomically(&path, segment.serialize())?;
            bytes_written += segment.encoded_len() as u64;
        }
        self.remove_stale_segments(&dir)?;

        let metadata = self.metadata().to_properties();
        write_atomically(&dir.join(METADATA_FILE), metadata.as_bytes())?;
        bytes_written += metadata.len() as u64;

        Ok(PersistedSession { dir, bytes_written })
    }

    fn remove_stale_segments(&self, dir: &Path) -> Result<(), SessionError> {
        let expected: std::collections::HashSet<String> =
            (0..self.segments.len()).map(segment_file_name).collect();
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_segment_file(&name) && !expected.contains(&name) {
                let path = entry.path();
                fs::remove_file(&path).map_err(io_error(&path))?;
            }
        }
        Ok(())
    }

    /// Read a session written by [`Session::persist`]. Any corrupt segment
    /// fails the whole load.
    pub fn load(dir: &Path) -> Result<Session, SessionError> {
        let metadata = SessionMetadata::read(dir)?;

        let metadata_error = |reason: String| SessionError::Metadata {
            path: dir.join(METADATA_FILE),
            reason,
        };

        let files = segment_files(dir)?;
        let mut segments = Vec::with_capacity(files.len());
        for (position, (index, path)) in files.into_iter().enumerate() {
            if index != position {
                return Err(metadata_error(format!("segment {} is missing", position)));
            }
            let bytes = fs::read(&path).map_err(io_error(&path))?;
            let segment = Segment::deserialize(&bytes).map_err(|source| SessionError::Format {
                path: path.clone(),
                source,
            })?;
            if segment.player_id() != metadata.player_id {
                return Err(metadata_error(format!(
                    "segment {} belongs to player {}, not {}",
                    index,
                    segment.player_id(),
                    metadata.player_id
                )));
            }
            segments.push(segment);
        }

        if segments.len() as u64 != metadata.segment_count {
            return Err(metadata_error(format!(
                "expected {} segments, found {}",
                metadata.segment_count,
                segments.len()
            )));
        }

        Ok(Session {
            id: metadata.session_id,
            player_id: metadata.player_id,
            player_name: metadata.player_name,
            trigger: metadata.trigger,
            reason: metadata.reason,
            start_time: metadata.start_time,
            end_time: metadata.end_time,
            segments,
            finalized: true,
        })
    }
}

/// Write to a temporary sibling and rename, so readers never observe a
/// half-written file under the final name.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), SessionError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

/// Total size of the regular files directly inside `dir`.
pub fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}
