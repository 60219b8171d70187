use crate::config::StreamConfig;
use crate::registry::Registry;
use crate::session::{ExitReason, ProcessControl, StreamId, Termination};
use log::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::oneshot;

/// How long to keep reading stderr after the encoder has exited
pub(crate) const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// The monitor's end of the channel pair shared with a session.
pub(crate) struct MonitorChannels {
    terminate: oneshot::Receiver<()>,
    report: oneshot::Sender<Termination>,
}

pub(crate) fn channels() -> (ProcessControl, MonitorChannels) {
    let (terminate_tx, terminate_rx) = oneshot::channel();
    let (report_tx, report_rx) = oneshot::channel();
    (
        ProcessControl {
            terminate: terminate_tx,
            report: report_rx,
        },
        MonitorChannels {
            terminate: terminate_rx,
            report: report_tx,
        },
    )
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    TerminateRequested,
}

/// Spawn the task that owns `child` until it exits.
///
/// If the child exits on its own, the monitor races `stop` for the session through
/// [`Registry::remove`]. Winning means the monitor reclaims the session; losing means a stopper
/// owns it and the monitor only reports the termination to it.
pub(crate) fn spawn(
    id: StreamId,
    child: Child,
    channels: MonitorChannels,
    registry: Arc<Registry>,
    config: Arc<StreamConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(supervise(id, child, channels, registry, config))
}

async fn supervise(
    id: StreamId,
    mut child: Child,
    channels: MonitorChannels,
    registry: Arc<Registry>,
    config: Arc<StreamConfig>,
) {
    let MonitorChannels {
        mut terminate,
        report,
    } = channels;

    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(config.stderr_tail_lines)));
    let mut drain = match child.stderr.take() {
        Some(stderr) => Some(tokio::task::spawn(drain_stderr(
            id.clone(),
            stderr,
            tail.clone(),
            config.stderr_tail_lines,
        ))),
        None => None,
    };

    let event = tokio::select! {
        status = child.wait() => Event::Exited(status),
        _ = &mut terminate => Event::TerminateRequested,
    };

    let (reason, status, natural) = match event {
        Event::Exited(Ok(status)) => (ExitReason::ExitedNaturally, Some(status), true),
        Event::Exited(Err(err)) => {
            error!("Failed to wait on encoder of stream {}: {}", id, err);
            (ExitReason::Unobserved, None, true)
        }
        Event::TerminateRequested => {
            let (reason, status) = terminate_child(&id, &mut child, &config).await;
            (reason, status, false)
        }
    };

    if let Some(handle) = drain.as_mut() {
        if tokio::time::timeout(STDERR_FLUSH_TIMEOUT, &mut *handle).await.is_err() {
            debug!("Stream {} stderr still open after exit, giving up on it", id);
            handle.abort();
        }
    }
    let stderr_tail: Vec<String> = tail.lock().iter().cloned().collect();
    let termination = Termination::new(id.clone(), reason, status, stderr_tail);

    if natural {
        match registry.remove(&id) {
            Some(session) => {
                info!(
                    "Stream {} encoder exited on its own (code {:?}, signal {:?})",
                    id, termination.code, termination.signal
                );
                if !termination.success() {
                    for line in &termination.stderr_tail {
                        warn!("[{}] {}", id, line);
                    }
                }
                reclaim(&session.id, &session.output_dir).await;
                registry.record(termination);
                return;
            }
            None => {
                debug!("Stream {} exited while being stopped", id);
            }
        }
    }

    if let Err(termination) = report.send(termination) {
        // Nobody owns the session any more. A stopper that timed out has recorded `Unobserved`
        // already; the newer record wins in `Registry::outcome`.
        warn!("Nobody is waiting on the termination of stream {}, reclaiming it", id);
        reclaim(&id, &config.streams_dir.join(id.as_str())).await;
        registry.record(termination);
    }
}

async fn terminate_child(
    id: &StreamId,
    child: &mut Child,
    config: &StreamConfig,
) -> (ExitReason, Option<ExitStatus>) {
    if let Err(err) = request_graceful_exit(child) {
        warn!("Failed to signal encoder of stream {}: {}", id, err);
    }

    match tokio::time::timeout(config.stop_grace(), child.wait()).await {
        Ok(Ok(status)) => return (ExitReason::StoppedByRequest, Some(status)),
        Ok(Err(err)) => {
            error!("Failed to wait on encoder of stream {}: {}", id, err);
            return (ExitReason::Unobserved, None);
        }
        Err(_) => {
            warn!(
                "Stream {} encoder did not exit within {:?}, killing it",
                id,
                config.stop_grace()
            );
        }
    }

    if let Err(err) = child.start_kill() {
        warn!("Failed to kill encoder of stream {}: {}", id, err);
    }
    match tokio::time::timeout(config.kill_timeout(), child.wait()).await {
        Ok(Ok(status)) => (ExitReason::Killed, Some(status)),
        Ok(Err(err)) => {
            error!("Failed to wait on killed encoder of stream {}: {}", id, err);
            (ExitReason::Unobserved, None)
        }
        Err(_) => {
            error!("Killed encoder of stream {} could not be reaped", id);
            (ExitReason::Unobserved, None)
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child) -> std::io::Result<()> {
    let pid = match child.id() {
        Some(pid) => pid,
        None => return Ok(()), // already reaped
    };
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn drain_stderr(
    id: StreamId,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                trace!("[{}] {}", id, line);
                if max_lines == 0 {
                    continue;
                }
                let mut tail = tail.lock();
                while tail.len() >= max_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(err) => {
                debug!("Stopped reading stderr of stream {}: {}", id, err);
                break;
            }
        }
    }
}

/// Remove a session's output directory. Failures are logged, never returned: the session is
/// over regardless of what is left on disk.
pub(crate) async fn reclaim(id: &StreamId, output_dir: &Path) {
    match tokio::fs::remove_dir_all(output_dir).await {
        Ok(()) => debug!("Removed {:?}", output_dir),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("{:?} was already gone", output_dir)
        }
        Err(err) => warn!(
            "Failed to remove output directory {:?} of stream {}: {}",
            output_dir, id, err
        ),
    }
}
