//! streamlay turns live network video feeds (RTSP, RTMP, SRT, ...) into HLS playlists.
//! It launches one external encoder process per stream, supervises it, and reclaims the
//! on-disk segments and in-memory bookkeeping once the process ends.
//!
//! The entry point is [`StreamManager`]:
//! * [`StreamManager::start`] validates a source, launches the encoder and registers a session
//! * [`StreamManager::stop`] terminates a session and reclaims it
//! * [`StreamManager::list`] / [`StreamManager::info`] / [`StreamManager::outcome`] inspect state

pub mod config;
pub mod launcher;
pub mod session;

mod error;
mod manager;
mod monitor;
mod registry;

pub use config::{EncoderConfig, StreamConfig};
pub use error::Error;
pub use launcher::{FfmpegLauncher, Launcher};
pub use manager::StreamManager;
pub use registry::Registry;
pub use session::{ExitReason, SessionInfo, SessionState, StreamId, StreamSession, Termination};
