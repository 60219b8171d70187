#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamlay::launcher::spawn_detached;
use streamlay::*;
use tokio::process::{Child, Command};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Runs `sh -c script sh <source_url> <output_dir>` in place of the encoder
struct ShellLauncher {
    script: String,
}

impl Launcher for ShellLauncher {
    fn launch(&self, source_url: &str, output_dir: &Path) -> Result<Child, Error> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.script)
            .arg("sh")
            .arg(source_url)
            .arg(output_dir);
        spawn_detached(command)
    }
}

struct FailingLauncher;

impl Launcher for FailingLauncher {
    fn launch(&self, _source_url: &str, _output_dir: &Path) -> Result<Child, Error> {
        spawn_detached(Command::new("/nonexistent/streamlay-test-encoder"))
    }
}

fn test_config(root: &Path) -> StreamConfig {
    StreamConfig {
        streams_dir: root.join("streams"),
        stop_grace_ms: 2_000,
        kill_timeout_ms: 2_000,
        ..StreamConfig::default()
    }
}

fn shell_manager(root: &Path, script: &str) -> StreamManager {
    shell_manager_with(test_config(root), script)
}

fn shell_manager_with(config: StreamConfig, script: &str) -> StreamManager {
    let launcher = Arc::new(ShellLauncher {
        script: script.to_string(),
    });
    StreamManager::with_launcher(config, launcher).unwrap()
}

fn stream_dir(manager: &StreamManager, id: &StreamId) -> PathBuf {
    manager.config().streams_dir.join(id.as_str())
}

fn dir_entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => vec![],
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_start_registers_session_and_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(tmp.path(), "echo '#EXTM3U' > \"$2/stream.m3u8\"; exec sleep 30");

    let mut ids = Vec::new();
    for url in [
        "rtsp://camera.local:554/stream1",
        "rtmp://ingest.local/app/key",
        "srt://10.0.0.5:9000",
    ] {
        let id = manager.start(url).await.unwrap();
        assert!(stream_dir(&manager, &id).is_dir());
        assert!(!ids.contains(&id));

        let info = manager.info(&id).unwrap();
        assert_eq!(info.source_url, url);
        assert_eq!(info.state, SessionState::Running);
        assert_eq!(info.playlist_path, stream_dir(&manager, &id).join("stream.m3u8"));
        assert!(info.pid.is_some());
        ids.push(id);
    }

    let mut listed = manager.list();
    listed.sort();
    ids.sort();
    assert_eq!(listed, ids);

    let playlist = manager.info(&ids[0]).unwrap().playlist_path;
    assert!(eventually(|| playlist.exists()).await);

    manager.shutdown().await;
    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn test_rejected_scheme_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(tmp.path(), "exec sleep 30");

    let res = manager.start("http://example.com/live.m3u8").await;
    assert!(matches!(res, Err(Error::InvalidSource(..))));
    assert!(res.unwrap_err().is_validation());
    assert!(manager.list().is_empty());
    assert!(dir_entries(&manager.config().streams_dir).is_empty());
}

#[tokio::test]
async fn test_launch_failure_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let manager =
        StreamManager::with_launcher(test_config(tmp.path()), Arc::new(FailingLauncher)).unwrap();

    let res = manager.start("rtsp://camera.local/live").await;
    assert!(matches!(res, Err(Error::Launch(_))));
    assert!(manager.list().is_empty());
    assert!(dir_entries(&manager.config().streams_dir).is_empty());
}

#[tokio::test]
async fn test_stop_twice() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(tmp.path(), "exec sleep 30");

    let id = manager.start("rtsp://camera.local/live").await.unwrap();
    let dir = stream_dir(&manager, &id);
    assert!(dir.is_dir());

    let termination = manager.stop(&id).await.unwrap();
    assert_eq!(termination.id, id);
    assert_eq!(termination.reason, ExitReason::StoppedByRequest);
    assert_eq!(termination.signal, Some(SIGTERM));
    assert!(!dir.exists());
    assert!(manager.info(&id).is_none());

    assert!(matches!(manager.stop(&id).await, Err(Error::NotFound(_))));
    assert_eq!(
        manager.outcome(&id).unwrap().reason,
        ExitReason::StoppedByRequest
    );
}

#[tokio::test]
async fn test_graceful_stop_lets_encoder_finish() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(
        tmp.path(),
        "trap 'echo finalizing >&2; exit 0' TERM; while :; do sleep 0.05; done",
    );

    let id = manager.start("rtsp://camera.local/live").await.unwrap();
    // give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let termination = manager.stop(&id).await.unwrap();
    assert_eq!(termination.reason, ExitReason::StoppedByRequest);
    assert_eq!(termination.code, Some(0));
    assert!(termination.success());
    assert_eq!(termination.stderr_tail, vec!["finalizing".to_string()]);
}

#[tokio::test]
async fn test_encoder_ignoring_stop_is_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StreamConfig {
        stop_grace_ms: 300,
        ..test_config(tmp.path())
    };
    let manager = shell_manager_with(config, "trap '' TERM; exec sleep 30");

    let id = manager.start("rtsp://camera.local/live").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let termination = manager.stop(&id).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(termination.reason, ExitReason::Killed);
    assert_eq!(termination.signal, Some(SIGKILL));
    assert!(!stream_dir(&manager, &id).exists());
    assert!(manager.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_stop_still_reclaims() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StreamConfig {
        stop_grace_ms: 500,
        kill_timeout_ms: 500,
        ..test_config(tmp.path())
    };
    let manager = Arc::new(shell_manager_with(config, "trap '' TERM; exec sleep 30"));

    let id = manager.start("rtsp://camera.local/live").await.unwrap();
    let dir = stream_dir(&manager, &id);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The caller goes away while the encoder is still in its grace period
    let stopper = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.stop(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    stopper.abort();
    assert!(stopper.await.unwrap_err().is_cancelled());

    assert!(eventually(|| manager.outcome(&id).is_some()).await);
    assert_eq!(manager.outcome(&id).unwrap().reason, ExitReason::Killed);
    assert!(!dir.exists());
    assert!(manager.info(&id).is_none());
    assert!(dir_entries(&manager.config().streams_dir).is_empty());
}

#[tokio::test]
async fn test_natural_exit_is_reclaimed_without_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(
        tmp.path(),
        "echo 'rtsp://camera.local/live: Connection refused' >&2; exit 3",
    );

    let id = manager.start("rtsp://camera.local/live").await.unwrap();
    let dir = stream_dir(&manager, &id);

    assert!(eventually(|| manager.outcome(&id).is_some()).await);
    assert!(manager.list().is_empty());
    assert!(!dir.exists());

    let termination = manager.outcome(&id).unwrap();
    assert_eq!(termination.reason, ExitReason::ExitedNaturally);
    assert_eq!(termination.code, Some(3));
    assert!(!termination.success());
    assert_eq!(
        termination.stderr_tail,
        vec!["rtsp://camera.local/live: Connection refused".to_string()]
    );

    assert!(matches!(manager.stop(&id).await, Err(Error::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_racing_natural_exit_cleans_up_once() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = Arc::new(shell_manager(tmp.path(), "exec sleep 0.2"));

    for _ in 0..5 {
        let id = manager.start("rtsp://camera.local/live").await.unwrap();
        tokio::time::sleep(Duration::from_millis(190)).await;

        let first = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.stop(&id).await })
        };
        let second = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.stop(&id).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        // At most one stop can own the session, the other (or both, if the monitor won) see NotFound
        let stopped = results.iter().filter(|r| r.is_ok()).count();
        assert!(stopped <= 1);
        for res in &results {
            if let Err(err) = res {
                assert!(matches!(err, Error::NotFound(_)));
            }
        }

        assert!(eventually(|| manager.outcome(&id).is_some()).await);
        assert!(!stream_dir(&manager, &id).exists());
        assert!(manager.info(&id).is_none());
    }
    assert!(manager.list().is_empty());
    assert!(dir_entries(&manager.config().streams_dir).is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_every_stream() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(tmp.path(), "exec sleep 30");

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(manager.start("rtsp://camera.local/live").await.unwrap());
    }
    manager.shutdown().await;

    assert!(manager.list().is_empty());
    assert!(dir_entries(&manager.config().streams_dir).is_empty());
    for id in &ids {
        assert_eq!(
            manager.outcome(id).unwrap().reason,
            ExitReason::StoppedByRequest
        );
    }
}

#[tokio::test]
async fn test_sweep_removes_only_orphans() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = shell_manager(tmp.path(), "exec sleep 30");

    let live = manager.start("rtsp://camera.local/live").await.unwrap();
    let streams_dir = manager.config().streams_dir.clone();
    std::fs::create_dir(streams_dir.join("0123456789abcdef")).unwrap();
    std::fs::write(streams_dir.join("0123456789abcdef/stream_000.ts"), b"ts").unwrap();
    std::fs::create_dir(streams_dir.join("not-a-stream")).unwrap();

    // Too young to be swept
    assert_eq!(manager.sweep_orphans(Duration::from_secs(3600)).await.unwrap(), 0);

    assert_eq!(manager.sweep_orphans(Duration::ZERO).await.unwrap(), 1);
    let mut left = dir_entries(&streams_dir);
    left.sort();
    let mut expected = vec![live.to_string(), "not-a-stream".to_string()];
    expected.sort();
    assert_eq!(left, expected);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_injected_registry_is_shared() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new(8));
    let launcher = Arc::new(ShellLauncher {
        script: "exec sleep 30".to_string(),
    });
    let manager =
        StreamManager::with_registry(test_config(tmp.path()), launcher, registry.clone()).unwrap();

    let id = manager.start("rtsp://camera.local/live").await.unwrap();
    assert!(registry.contains(&id));
    assert_eq!(registry.get(&id).unwrap().id, id);

    manager.stop(&id).await.unwrap();
    assert!(registry.is_empty());
    assert!(registry.outcome(&id).is_some());
}
