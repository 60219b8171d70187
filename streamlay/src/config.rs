//! Configuration for stream conversion.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ACCEPTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "srt", "udp", "rtp"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Directory holding one sub-directory per active stream
    pub streams_dir: PathBuf,
    /// URL schemes accepted as live sources
    pub accepted_schemes: Vec<String>,
    /// How long a stopped encoder may take to exit after SIGTERM
    pub stop_grace_ms: u64,
    /// How long to wait for a force-killed encoder to be reaped
    pub kill_timeout_ms: u64,
    /// Number of trailing encoder stderr lines kept for diagnosis
    pub stderr_tail_lines: usize,
    /// Number of terminated sessions remembered after reclamation
    pub outcome_log_size: usize,

    /// Encoder command line
    pub encoder: EncoderConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            streams_dir: PathBuf::from("static/streams"),
            accepted_schemes: DEFAULT_ACCEPTED_SCHEMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            stop_grace_ms: 10_000,
            kill_timeout_ms: 5_000,
            stderr_tail_lines: 20,
            outcome_log_size: 64,
            encoder: EncoderConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.accepted_schemes.is_empty() {
            return Err(crate::Error::Config(
                "accepted_schemes must not be empty".to_string(),
            ));
        }
        if self.stop_grace_ms == 0 {
            return Err(crate::Error::Config(
                "stop_grace_ms must be greater than 0".to_string(),
            ));
        }
        if self.encoder.segment_seconds == 0 {
            return Err(crate::Error::Config(
                "encoder.segment_seconds must be greater than 0".to_string(),
            ));
        }
        if self.encoder.binary.is_empty() {
            return Err(crate::Error::Config(
                "encoder.binary must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub binary: String,
    pub video_codec: String,
    pub audio_codec: String,
    /// Target duration of each HLS segment
    pub segment_seconds: u32,
    /// Number of segments kept in the live playlist window
    pub playlist_size: u32,
    pub log_level: String,
    /// Extra arguments placed before `-i`, e.g. `["-rtsp_transport", "tcp"]`
    pub input_args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            binary: "ffmpeg".to_string(),
            video_codec: "copy".to_string(),
            audio_codec: "aac".to_string(),
            segment_seconds: 2,
            playlist_size: 3,
            log_level: "warning".to_string(),
            input_args: vec![],
        }
    }
}
