//! Encoder process launching.

use crate::config::EncoderConfig;
use crate::session::{PLAYLIST_NAME, SEGMENT_TEMPLATE};
use log::*;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Starts the external encoder for one stream.
///
/// Implementations only spawn; they never wait on the child. Reachability of the source is
/// discovered later through the child's exit status.
pub trait Launcher: Send + Sync {
    fn launch(&self, source_url: &str, output_dir: &Path) -> Result<Child, crate::Error>;
}

/// Spawn `command` detached from the caller's standard I/O.
///
/// stdin and stdout are null. stderr is piped and must be drained by the owner of the child,
/// otherwise a chatty encoder blocks once the pipe buffer fills.
pub fn spawn_detached(mut command: Command) -> Result<Child, crate::Error> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
        .spawn()
        .map_err(|e| crate::Error::Launch(format!("{:?}: {}", command.as_std().get_program(), e)))
}

/// Launches `ffmpeg` writing an HLS playlist with a sliding segment window.
pub struct FfmpegLauncher {
    config: EncoderConfig,
}

impl FfmpegLauncher {
    pub fn new(config: EncoderConfig) -> Self {
        FfmpegLauncher { config }
    }

    pub fn args(&self, source_url: &str, output_dir: &Path) -> Vec<OsString> {
        let config = &self.config;
        let mut args: Vec<OsString> = vec![
            "-nostdin".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            config.log_level.clone().into(),
        ];
        args.extend(config.input_args.iter().map(OsString::from));
        args.extend([
            "-i".into(),
            source_url.into(),
            "-c:v".into(),
            config.video_codec.clone().into(),
            "-c:a".into(),
            config.audio_codec.clone().into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            config.segment_seconds.to_string().into(),
            "-hls_list_size".into(),
            config.playlist_size.to_string().into(),
            "-hls_flags".into(),
            "delete_segments".into(),
            "-hls_segment_filename".into(),
            output_dir.join(SEGMENT_TEMPLATE).into_os_string(),
            output_dir.join(PLAYLIST_NAME).into_os_string(),
        ]);
        args
    }
}

impl Launcher for FfmpegLauncher {
    fn launch(&self, source_url: &str, output_dir: &Path) -> Result<Child, crate::Error> {
        let mut command = Command::new(&self.config.binary);
        command.args(self.args(source_url, output_dir));
        let child = spawn_detached(command)?;
        debug!(
            "Started {} (pid {:?}) for {} into {:?}",
            self.config.binary,
            child.id(),
            source_url,
            output_dir
        );
        Ok(child)
    }
}
