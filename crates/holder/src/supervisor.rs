//! Worker process supervision.
//!
//! Spawns the worker with the control pipes on fds 3/4, forwards its
//! stdout/stderr line by line, and watches for exit. On outer cancellation
//! the worker is killed. Pipe ends held for the worker are released only
//! after the process has been reaped, whichever way it ended.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe::{Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::LogSource;
use crate::config::{DiagnosticObserver, HostConfig, MAX_FRAME_ENV};
use crate::pipes::ControlPipes;

/// How long exit handling waits for diagnostic output to drain.
const DIAGNOSTIC_DRAIN: Duration = Duration::from_millis(500);

/// Exit as observed by the supervisor: a status, or why waiting failed.
pub(crate) type ExitState = Result<ExitStatus, String>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create control pipes: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to register control pipes: {0}")]
    Register(#[source] io::Error),

    #[error("worker {0} was not captured")]
    Missing(&'static str),
}

/// A running worker as seen by the host.
pub(crate) struct Supervised {
    pub reader: Receiver,
    pub writer: Sender,
    pub pid: Option<u32>,
    pub exit: watch::Receiver<Option<ExitState>>,
    /// Cancelled once the worker has exited and its pipe ends are released.
    pub closed: CancellationToken,
}

/// Start the worker described by `config`. Must run inside a Tokio runtime.
///
/// Any failure before the worker is handed to its exit task closes every
/// descriptor opened so far and kills the process if it was started.
pub(crate) fn spawn_worker(
    config: &HostConfig,
    outer: CancellationToken,
) -> Result<Supervised, SpawnError> {
    let pipes = ControlPipes::create().map_err(SpawnError::Pipe)?;

    let mut command = config.spawner.command(config);
    command
        .envs(config.env.iter().map(|(k, v)| (k, v)))
        .env(MAX_FRAME_ENV, config.max_frame_len.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.current_dir {
        command.current_dir(dir);
    }
    pipes.install(&mut command);

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    tracing::info!(%program, "Spawning worker");

    let mut child = command
        .spawn()
        .map_err(|source| SpawnError::Spawn { program, source })?;
    let pid = child.id();

    let stdout = child.stdout.take().ok_or(SpawnError::Missing("stdout"))?;
    let stderr = child.stderr.take().ok_or(SpawnError::Missing("stderr"))?;

    let (host, worker_ends) = pipes.split();
    let (reader, writer) = host.into_async().map_err(SpawnError::Register)?;

    let forwarders = [
        tokio::spawn(forward_diagnostics(
            stdout,
            LogSource::Stdout,
            config.observer.clone(),
        )),
        tokio::spawn(forward_diagnostics(
            stderr,
            LogSource::Stderr,
            config.observer.clone(),
        )),
    ];

    let (exit_tx, exit_rx) = watch::channel(None);
    let closed = CancellationToken::new();
    let exit_closed = closed.clone();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = outer.cancelled() => {
                tracing::info!(?pid, "Outer scope cancelled, killing worker");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(?pid, error = %e, "Failed to kill worker");
                }
                child.wait().await
            }
        };

        match &status {
            Ok(status) if status.success() => tracing::info!(?pid, "Worker exited"),
            Ok(status) => tracing::warn!(?pid, %status, "Worker exited abnormally"),
            Err(e) => tracing::error!(?pid, error = %e, "Failed to wait for worker"),
        }

        drain(forwarders).await;
        drop(worker_ends);
        exit_closed.cancel();
        let _ = exit_tx.send(Some(status.map_err(|e| e.to_string())));
    });

    tracing::debug!(?pid, "Worker started");
    Ok(Supervised {
        reader,
        writer,
        pid,
        exit: exit_rx,
        closed,
    })
}

async fn drain(forwarders: [JoinHandle<()>; 2]) {
    for forwarder in forwarders {
        if tokio::time::timeout(DIAGNOSTIC_DRAIN, forwarder).await.is_err() {
            // Something else still holds the stream open; the task keeps
            // forwarding in the background.
            tracing::debug!("Diagnostic stream still open after worker exit");
        }
    }
}

async fn forward_diagnostics<R>(stream: R, source: LogSource, observer: Option<DiagnosticObserver>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.strip_suffix('\n').unwrap_or(&line);
                match &observer {
                    Some(observer) => observer(source, line),
                    None => tracing::info!(target: "holder::worker", source = ?source, "{}", line),
                }
            }
            Err(e) => {
                tracing::warn!(source = ?source, error = %e, "Diagnostic stream read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpawner;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn shell(script: &str) -> HostConfig {
        HostConfig::new().with_spawner(Arc::new(
            CommandSpawner::new("/bin/sh").arg("-c").arg(script),
        ))
    }

    async fn exit_of(mut worker: Supervised) -> ExitState {
        let state = worker.exit.wait_for(|s| s.is_some()).await.unwrap();
        state.clone().unwrap()
    }

    #[tokio::test]
    async fn control_pipes_land_on_fds_3_and_4() {
        let config = shell(r#"read line <&3; echo "got $line" >&4"#);
        let mut worker = spawn_worker(&config, CancellationToken::new()).unwrap();

        worker.writer.write_all(b"ping\n").await.unwrap();
        let mut out = String::new();
        worker.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "got ping\n");

        let status = exit_of(worker).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn diagnostics_reach_observer_by_source() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let config = shell("echo out one; echo err one >&2; printf 'no newline'; exit 3")
            .with_observer(move |source, line| {
                sink.lock().unwrap().push((source, line.to_string()));
            });

        let worker = spawn_worker(&config, CancellationToken::new()).unwrap();
        let status = exit_of(worker).await.unwrap();
        assert_eq!(status.code(), Some(3));

        let lines = lines.lock().unwrap().clone();
        assert!(lines.contains(&(LogSource::Stdout, "out one".to_string())));
        assert!(lines.contains(&(LogSource::Stdout, "no newline".to_string())));
        assert!(lines.contains(&(LogSource::Stderr, "err one".to_string())));
    }

    #[tokio::test]
    async fn env_and_current_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell(r#"echo "$HOLDER_TEST_VALUE $(pwd)" >&4"#)
            .with_env("HOLDER_TEST_VALUE", "seven")
            .with_current_dir(dir.path());

        let mut worker = spawn_worker(&config, CancellationToken::new()).unwrap();
        let mut out = String::new();
        worker.reader.read_to_string(&mut out).await.unwrap();

        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(out.trim_end(), format!("seven {}", expected_dir.display()));
    }

    #[tokio::test]
    async fn frame_ceiling_is_exported_to_worker() {
        let config = shell(r#"echo "$HOLDER_MAX_FRAME" >&4"#)
            .with_env("HOLDER_MAX_FRAME", "1")
            .with_max_frame_len(200_000);

        let mut worker = spawn_worker(&config, CancellationToken::new()).unwrap();
        let mut out = String::new();
        worker.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim_end(), "200000");
    }

    #[tokio::test]
    async fn outer_cancel_kills_worker() {
        let outer = CancellationToken::new();
        let worker = spawn_worker(&shell("exec sleep 30"), outer.clone()).unwrap();
        assert!(worker.pid.is_some());
        let closed = worker.closed.clone();

        outer.cancel();
        let status = tokio::time::timeout(Duration::from_secs(10), exit_of(worker))
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), None);
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let config = HostConfig::new().with_program("/definitely/not/here/node");
        match spawn_worker(&config, CancellationToken::new()) {
            Err(SpawnError::Spawn { program, .. }) => {
                assert_eq!(program, "/definitely/not/here/node")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
