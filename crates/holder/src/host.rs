//! The public host handle: one worker process, one pending call table.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::call::{Method, Payload, Request};
use crate::config::HostConfig;
use crate::correlator::{self, Correlator};
use crate::error::{HostError, Result};
use crate::supervisor::{self, ExitState};

/// Handle to a running worker. Cheap to clone; every clone talks to the
/// same process.
///
/// ```no_run
/// # async fn example() -> holder::Result<()> {
/// use holder::{CancellationToken, Host, HostConfig, Request};
///
/// let host = Host::spawn(HostConfig::new(), CancellationToken::new())?;
/// let six: i64 = host
///     .call_as(Request::new("/srv/m.js").method("inc").arg(5), &CancellationToken::new())
///     .await?;
/// host.stop().await?;
/// host.wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Host {
    inner: Arc<Inner>,
}

struct Inner {
    correlator: Arc<Correlator>,
    exit: watch::Receiver<Option<ExitState>>,
    pid: Option<u32>,
}

impl Host {
    /// Start a worker. Must be called inside a Tokio runtime.
    ///
    /// Cancelling `outer` kills the worker and fails every pending call with
    /// [`HostError::HostCancelled`].
    pub fn spawn(config: HostConfig, outer: CancellationToken) -> Result<Self> {
        let worker = supervisor::spawn_worker(&config, outer.clone())?;
        let correlator = correlator::start(
            worker.reader,
            worker.writer,
            config.max_frame_len,
            outer,
            worker.closed,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                correlator,
                exit: worker.exit,
                pid: worker.pid,
            }),
        })
    }

    /// Spawn with [`HostConfig::from_env`].
    pub fn from_env(outer: CancellationToken) -> Result<Self> {
        Self::spawn(HostConfig::from_env()?, outer)
    }

    /// Invoke a call and wait for its result, or until `cancel` fires.
    ///
    /// On cancellation the worker is told to abandon the call and this
    /// returns [`HostError::Cancelled`] without waiting for it. Dropping the
    /// returned future has the same effect.
    pub async fn call(&self, request: Request, cancel: &CancellationToken) -> Result<Payload> {
        let pending = self.inner.correlator.register(request)?;
        pending
            .wait(async {
                cancel.cancelled().await;
                HostError::Cancelled
            })
            .await
    }

    /// Invoke a call with a deadline.
    pub async fn call_timeout(&self, request: Request, timeout: Duration) -> Result<Payload> {
        let pending = self.inner.correlator.register(request)?;
        pending
            .wait(async move {
                tokio::time::sleep(timeout).await;
                HostError::DeadlineExceeded(timeout)
            })
            .await
    }

    /// Invoke a call and decode its result. An empty result decodes as JSON
    /// `null`, so `()` and `Option<T>` work for exports returning nothing.
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.call(request, cancel).await?.decode_or_null()
    }

    /// Bind an export to fixed argument and result types.
    pub fn method<A, R>(&self, import: impl Into<String>, method: impl Into<String>) -> Method<A, R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        Method::new(self.clone(), import.into(), Some(method.into()))
    }

    /// Ask the worker to exit. Returns once the request is written; use
    /// [`Host::wait`] to wait for the exit itself. Later calls fail with
    /// [`HostError::Closed`].
    pub async fn stop(&self) -> Result<()> {
        let Some(written) = self.inner.correlator.shutdown()? else {
            return Ok(());
        };
        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(HostError::Transport(reason)),
            Err(_) => Err(HostError::Closed),
        }
    }

    /// Wait for the worker to exit. Any exit other than status 0 is an error.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut exit = self.inner.exit.clone();
        let state = exit
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| HostError::Wait("supervisor went away".to_string()))?
            .clone();

        match state {
            Some(Ok(status)) if status.success() => Ok(status),
            Some(Ok(status)) => Err(HostError::Exited(status)),
            Some(Err(reason)) => Err(HostError::Wait(reason)),
            None => Err(HostError::Wait("no exit status".to_string())),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn is_running(&self) -> bool {
        self.inner.exit.borrow().is_none()
    }

    /// Calls registered and not yet resolved or abandoned.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("pid", &self.inner.pid)
            .field("running", &self.is_running())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

#[cfg(test)]
impl Host {
    /// A host wired to an in-process worker loop instead of a child process.
    /// The loop ending stands in for process exit.
    pub(crate) fn in_process<H: crate::worker::CallHandler>(
        handler: Arc<H>,
        outer: CancellationToken,
    ) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);

        let (exit_tx, exit_rx) = watch::channel(None);
        let closed = CancellationToken::new();
        let worker_closed = closed.clone();
        let worker_outer = outer.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                result = crate::worker::serve(
                    handler,
                    worker_read,
                    worker_write,
                    crate::bridge::codec::DEFAULT_MAX_FRAME,
                ) => {
                    if result.is_ok() { 0 } else { 1 << 8 }
                }
                _ = worker_outer.cancelled() => 9,
            };
            worker_closed.cancel();
            let _ = exit_tx.send(Some(Ok(ExitStatus::from_raw(code))));
        });

        let correlator = correlator::start(
            host_read,
            host_write,
            crate::bridge::codec::DEFAULT_MAX_FRAME,
            outer,
            closed,
        );
        Self {
            inner: Arc::new(Inner {
                correlator,
                exit: exit_rx,
                pid: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{CallHandler, WorkerCall};
    use serde::Deserialize;
    use serde_json::json;

    struct Calculator;

    #[async_trait::async_trait]
    impl CallHandler for Calculator {
        async fn call(&self, call: WorkerCall) -> std::result::Result<Option<serde_json::Value>, String> {
            match call.method.as_str() {
                "inc" => {
                    let n = call.args.first().and_then(|v| v.as_i64()).ok_or("inc needs a number")?;
                    Ok(Some(json!(n + 1)))
                }
                "add" => Ok(Some(json!(
                    call.args.iter().filter_map(|v| v.as_i64()).sum::<i64>()
                ))),
                "scale" => {
                    let factor = call.args[0]["factor"].as_f64().unwrap_or(1.0);
                    let x = call.args[0]["point"]["x"].as_f64().unwrap_or(0.0);
                    let y = call.args[0]["point"]["y"].as_f64().unwrap_or(0.0);
                    Ok(Some(json!({"x": x * factor, "y": y * factor})))
                }
                "nothing" => Ok(None),
                "boom" => Err("Error: boom".to_string()),
                "hang" => {
                    call.cancel.cancelled().await;
                    Ok(None)
                }
                other => Err(format!("TypeError: {other} is not a function")),
            }
        }
    }

    fn host() -> (Host, CancellationToken) {
        let outer = CancellationToken::new();
        (Host::in_process(Arc::new(Calculator), outer.clone()), outer)
    }

    #[tokio::test]
    async fn call_returns_worker_result() {
        let (host, _outer) = host();
        let six: i64 = host
            .call_as(Request::new("m.js").method("inc").arg(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(six, 6);
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn variadic_args_are_spread() {
        let (host, _outer) = host();
        let sum = host
            .call(
                Request::new("m.js").method("add").args([1, 2, 3, 4]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(sum.into_value(), Some(json!(10)));
    }

    #[tokio::test]
    async fn empty_result_decodes_as_unit() {
        let (host, _outer) = host();
        let payload = host
            .call(Request::new("m.js").method("nothing"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(payload.is_empty());

        let () = host
            .call_as(Request::new("m.js").method("nothing"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn worker_error_reaches_only_its_caller() {
        let (host, _outer) = host();
        let cancel = CancellationToken::new();
        let (bad, good) = tokio::join!(
            host.call(Request::new("m.js").method("boom"), &cancel),
            host.call(Request::new("m.js").method("inc").arg(1), &cancel),
        );

        match bad {
            Err(HostError::Call { message }) => assert!(message.contains("boom")),
            other => panic!("expected call error, got {other:?}"),
        }
        assert_eq!(good.unwrap().into_value(), Some(json!(2)));
    }

    #[tokio::test]
    async fn typed_method_round_trip() {
        #[derive(Serialize)]
        struct Scale {
            factor: f64,
            point: Point,
        }
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Point {
            x: f64,
            y: f64,
        }

        let (host, _outer) = host();
        let scale = host.method::<Scale, Point>("geo.js", "scale");
        let scaled = scale
            .call(
                &Scale {
                    factor: 2.0,
                    point: Point { x: 1.5, y: -3.0 },
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(scaled, Point { x: 3.0, y: -6.0 });

        let inc = host.method::<i64, i64>("m.js", "inc");
        assert_eq!(inc.call_timeout(&41, Duration::from_secs(5)).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn decode_mismatch_is_a_decode_error() {
        let (host, _outer) = host();
        let result: Result<String> = host
            .call_as(Request::new("m.js").method("inc").arg(1), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HostError::Decode(_))));
    }

    #[tokio::test]
    async fn cancel_returns_promptly_and_cleans_up() {
        let (host, _outer) = host();
        let cancel = CancellationToken::new();

        let call = {
            let host = host.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { host.call(Request::new("m.js").method("hang"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(HostError::Cancelled)));
        assert_eq!(host.pending_calls(), 0);

        // The host is still usable afterwards.
        let n: i64 = host
            .call_as(Request::new("m.js").method("inc").arg(0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn timeout_reports_deadline() {
        let (host, _outer) = host();
        let limit = Duration::from_millis(20);
        let result = host
            .call_timeout(Request::new("m.js").method("hang"), limit)
            .await;
        match result {
            Err(HostError::DeadlineExceeded(d)) => assert_eq!(d, limit),
            other => panic!("expected deadline, got {other:?}"),
        }
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stop_then_wait() {
        let (host, _outer) = host();
        assert!(host.is_running());

        host.stop().await.unwrap();
        // Stopping twice is harmless.
        host.stop().await.unwrap();

        let status = host.wait().await.unwrap();
        assert!(status.success());
        assert!(!host.is_running());

        assert!(matches!(
            host.call(Request::new("m.js"), &CancellationToken::new()).await,
            Err(HostError::Closed)
        ));
    }

    #[tokio::test]
    async fn outer_cancel_fails_pending_calls() {
        let (host, outer) = host();
        let call = {
            let host = host.clone();
            tokio::spawn(async move {
                host.call(Request::new("m.js").method("hang"), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        outer.cancel();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(HostError::HostCancelled)));
        assert!(matches!(host.wait().await, Err(HostError::Exited(_))));
    }
}
