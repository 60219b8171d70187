//! Stream sessions and their terminal states.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

pub const PLAYLIST_NAME: &str = "stream.m3u8";
/// Segment file template handed to the encoder (`stream_000.ts`, `stream_001.ts`, ...)
pub const SEGMENT_TEMPLATE: &str = "stream_%03d.ts";

const ID_LEN: usize = 16;

/// Opaque stream handle: 64 random bits as lowercase hex.
///
/// The id doubles as the name of the stream's output directory, so [`StreamId::parse`] only
/// accepts strings that are safe to join onto a path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub(crate) fn random() -> StreamId {
        StreamId(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn parse(s: &str) -> Option<StreamId> {
        if s.len() == ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Some(StreamId(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    StoppedByRequest,
    ExitedNaturally,
    Reclaimed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The encoder exited on its own (end of feed, unreachable source, crash)
    ExitedNaturally,
    /// The encoder exited within the grace period after a stop request
    StoppedByRequest,
    /// The encoder ignored the stop request and was force-killed
    Killed,
    /// The exit could not be observed
    Unobserved,
}

impl ExitReason {
    /// The state the session was in when its encoder exited
    pub fn state(&self) -> SessionState {
        match self {
            ExitReason::ExitedNaturally | ExitReason::Unobserved => SessionState::ExitedNaturally,
            ExitReason::StoppedByRequest | ExitReason::Killed => SessionState::StoppedByRequest,
        }
    }
}

/// Terminal state of a session, kept after the session is reclaimed.
#[derive(Clone, Debug, Serialize)]
pub struct Termination {
    pub id: StreamId,
    pub reason: ExitReason,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr_tail: Vec<String>,
    pub ended_at: DateTime<Utc>,
}

impl Termination {
    pub(crate) fn new(
        id: StreamId,
        reason: ExitReason,
        status: Option<std::process::ExitStatus>,
        stderr_tail: Vec<String>,
    ) -> Termination {
        Termination {
            id,
            reason,
            code: status.and_then(|s| s.code()),
            signal: status.and_then(exit_signal),
            stderr_tail,
            ended_at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(unix)]
fn exit_signal(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

/// The session's end of the channel pair shared with its monitor task.
pub(crate) struct ProcessControl {
    pub(crate) terminate: oneshot::Sender<()>,
    pub(crate) report: oneshot::Receiver<Termination>,
}

/// One running conversion job.
///
/// The monitor task owns the encoder's `Child`; the session owns the only way to reach it, so
/// whoever holds the session (the registry, then whichever of `stop` or the monitor removed it)
/// is the sole owner of the process.
pub struct StreamSession {
    pub(crate) id: StreamId,
    pub(crate) source_url: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) output_dir: PathBuf,
    pub(crate) pid: Option<u32>,
    pub(crate) control: ProcessControl,
}

impl StreamSession {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(PLAYLIST_NAME)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            source_url: self.source_url.clone(),
            started_at: self.started_at,
            pid: self.pid,
            output_dir: self.output_dir.clone(),
            playlist_path: self.playlist_path(),
            state: SessionState::Running,
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("source_url", &self.source_url)
            .field("started_at", &self.started_at)
            .field("output_dir", &self.output_dir)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Snapshot of a registered session
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: StreamId,
    pub source_url: String,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
    pub state: SessionState,
}
