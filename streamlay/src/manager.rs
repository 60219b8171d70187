use crate::config::StreamConfig;
use crate::launcher::{FfmpegLauncher, Launcher};
use crate::monitor;
use crate::registry::Registry;
use crate::session::{ExitReason, SessionInfo, StreamId, StreamSession, Termination};
use crate::Error;
use log::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const MAX_ID_ATTEMPTS: usize = 8;
const STOP_REPORT_SLACK: Duration = Duration::from_secs(1);

/// Starts, stops and inspects stream conversions.
///
/// Cheap to share behind an `Arc`; all state lives in the [`Registry`].
pub struct StreamManager {
    config: Arc<StreamConfig>,
    registry: Arc<Registry>,
    launcher: Arc<dyn Launcher>,
}

impl StreamManager {
    /// A manager launching `ffmpeg` as configured in `config.encoder`
    pub fn new(config: StreamConfig) -> Result<Self, Error> {
        let launcher = Arc::new(FfmpegLauncher::new(config.encoder.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: StreamConfig, launcher: Arc<dyn Launcher>) -> Result<Self, Error> {
        let registry = Arc::new(Registry::new(config.outcome_log_size));
        Self::with_registry(config, launcher, registry)
    }

    pub fn with_registry(
        config: StreamConfig,
        launcher: Arc<dyn Launcher>,
        registry: Arc<Registry>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(StreamManager {
            config: Arc::new(config),
            registry,
            launcher,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Check that `source_url` is a `scheme://host...` address with an accepted scheme.
    pub fn validate_source(&self, source_url: &str) -> Result<(), Error> {
        let invalid = |reason: String| Err(Error::InvalidSource(source_url.to_string(), reason));

        if source_url.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return invalid("contains whitespace or control characters".to_string());
        }
        let (scheme, rest) = match source_url.split_once("://") {
            Some(parts) => parts,
            None => return invalid("expected scheme://host/...".to_string()),
        };
        if !self
            .config
            .accepted_schemes
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(scheme))
        {
            return invalid(format!(
                "scheme `{}` not in {{{}}}",
                scheme,
                self.config.accepted_schemes.join(", ")
            ));
        }
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        let host_port = authority.rsplit('@').next().unwrap_or("");
        let host = match host_port.strip_prefix('[') {
            Some(bracketed) => bracketed.split_once(']').map(|(ip, _)| ip).unwrap_or(""),
            None => host_port.split(':').next().unwrap_or(""),
        };
        if host.is_empty() {
            return invalid("missing host".to_string());
        }
        Ok(())
    }

    /// Launch an encoder for `source_url` and register its session.
    ///
    /// On success the stream's output directory exists and the session is listed. On failure
    /// nothing is registered and the directory has been removed again. The work runs on its own
    /// task, so a caller that goes away mid-start cannot leave a directory without a session.
    pub async fn start(&self, source_url: &str) -> Result<StreamId, Error> {
        self.validate_source(source_url)?;
        let task = tokio::task::spawn(launch_session(
            source_url.to_string(),
            self.config.clone(),
            self.registry.clone(),
            self.launcher.clone(),
        ));
        match task.await {
            Ok(res) => res,
            Err(err) => {
                error!("Start task for {} failed: {}", source_url, err);
                Err(Error::Launch(format!("start task failed: {}", err)))
            }
        }
    }

    /// Terminate a stream and reclaim it.
    ///
    /// The encoder gets SIGTERM and `stop_grace` to exit before it is killed. Returns
    /// [`Error::NotFound`] if the stream is not registered, including when it already ended.
    ///
    /// Once the session is taken out of the registry the stop runs to completion on its own task,
    /// even if the returned future is dropped.
    pub async fn stop(&self, id: &StreamId) -> Result<Termination, Error> {
        let session = self
            .registry
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let task = tokio::task::spawn(stop_session(
            session,
            self.registry.clone(),
            self.config.clone(),
        ));
        match task.await {
            Ok(termination) => Ok(termination),
            Err(err) => {
                error!("Stop task for stream {} failed: {}", id, err);
                Ok(Termination::new(id.clone(), ExitReason::Unobserved, None, vec![]))
            }
        }
    }

    pub fn list(&self) -> Vec<StreamId> {
        self.registry.list()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.infos()
    }

    pub fn info(&self, id: &StreamId) -> Option<SessionInfo> {
        self.registry.get(id)
    }

    /// How a reclaimed stream ended, while it is still remembered
    pub fn outcome(&self, id: &StreamId) -> Option<Termination> {
        self.registry.outcome(id)
    }

    /// Remove stream directories that belong to no registered session and are older than
    /// `min_age`, e.g. leftovers of a previous process. Returns how many were removed.
    pub async fn sweep_orphans(&self, min_age: Duration) -> Result<usize, Error> {
        let mut entries = match tokio::fs::read_dir(&self.config.streams_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let id = match entry.file_name().to_str().and_then(StreamId::parse) {
                Some(id) => id,
                None => continue,
            };
            if self.registry.contains(&id) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age < min_age || self.registry.contains(&id) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("Removed orphaned stream directory {:?}", entry.path());
                    removed += 1;
                }
                Err(err) => warn!("Failed to remove {:?}: {}", entry.path(), err),
            }
        }
        Ok(removed)
    }

    /// Stop every registered stream
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        info!("Stopping {} streams", sessions.len());

        let mut stops = tokio::task::JoinSet::new();
        for session in sessions {
            stops.spawn(stop_session(
                session,
                self.registry.clone(),
                self.config.clone(),
            ));
        }
        while let Some(res) = stops.join_next().await {
            if let Err(err) = res {
                error!("Stop task failed: {}", err);
            }
        }
    }
}

async fn launch_session(
    source_url: String,
    config: Arc<StreamConfig>,
    registry: Arc<Registry>,
    launcher: Arc<dyn Launcher>,
) -> Result<StreamId, Error> {
    tokio::fs::create_dir_all(&config.streams_dir).await?;
    let (id, output_dir) = reserve_id(&config, &registry).await?;

    let child = match launcher.launch(&source_url, &output_dir) {
        Ok(child) => child,
        Err(err) => {
            error!("Failed to launch encoder for {}: {}", source_url, err);
            if let Err(err) = tokio::fs::remove_dir_all(&output_dir).await {
                warn!("Failed to remove {:?}: {}", output_dir, err);
            }
            return Err(err);
        }
    };

    let pid = child.id();
    let (control, channels) = monitor::channels();
    let session = StreamSession {
        id: id.clone(),
        source_url: source_url.clone(),
        started_at: chrono::Utc::now(),
        output_dir,
        pid,
        control,
    };
    if let Err(session) = registry.put(session) {
        // The directory belongs to the registered session; dropping the child kills it
        error!("Stream id {} is already registered", session.id);
        return Err(Error::Launch(format!(
            "stream id {} is already registered",
            session.id
        )));
    }
    monitor::spawn(id.clone(), child, channels, registry, config);

    info!("Started stream {} from {} (pid {:?})", id, source_url, pid);
    Ok(id)
}

async fn reserve_id(
    config: &StreamConfig,
    registry: &Registry,
) -> Result<(StreamId, PathBuf), Error> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = StreamId::random();
        if registry.contains(&id) {
            warn!("Generated stream id {} is in use, retrying", id);
            continue;
        }
        let output_dir = config.streams_dir.join(id.as_str());
        match tokio::fs::create_dir(&output_dir).await {
            Ok(()) => return Ok((id, output_dir)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("Output directory {:?} already exists, retrying", output_dir);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::IdExhausted(MAX_ID_ATTEMPTS))
}

async fn stop_session(
    session: StreamSession,
    registry: Arc<Registry>,
    config: Arc<StreamConfig>,
) -> Termination {
    let StreamSession {
        id,
        output_dir,
        control,
        ..
    } = session;

    // A closed channel means the monitor already saw the exit and has reported it
    let _ = control.terminate.send(());

    let deadline =
        config.stop_grace() + config.kill_timeout() + monitor::STDERR_FLUSH_TIMEOUT + STOP_REPORT_SLACK;
    let termination = match tokio::time::timeout(deadline, control.report).await {
        Ok(Ok(termination)) => termination,
        Ok(Err(_)) => {
            error!("Monitor of stream {} went away without reporting", id);
            Termination::new(id.clone(), ExitReason::Unobserved, None, vec![])
        }
        Err(_) => {
            error!("Monitor of stream {} did not report within {:?}", id, deadline);
            Termination::new(id.clone(), ExitReason::Unobserved, None, vec![])
        }
    };

    info!(
        "Stopped stream {} ({:?}, code {:?})",
        id, termination.reason, termination.code
    );
    monitor::reclaim(&id, &output_dir).await;
    registry.record(termination.clone());
    termination
}
