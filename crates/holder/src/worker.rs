//! Worker side of the control-pipe protocol, for workers written in Rust.
//!
//! The host side (spawning, correlation) lives in supervisor.rs and
//! correlator.rs. A worker reads request frames from fd 3 and writes
//! response frames to fd 4:
//! - each call runs on its own task, so a slow call never blocks the next
//! - responses go through one ordered queue to the single writer task
//! - the active table maps call ids to cancellation tokens; a cancel for an
//!   unknown id is ignored, a duplicate active id is fatal
//! - a cancel with an empty id ends the loop

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, LineJsonCodec};
use crate::bridge::protocol::{WorkerRequest, WorkerResponse};
use crate::config::{self, ConfigError};
use crate::pipes;

/// One call as handed to a [`CallHandler`].
#[derive(Debug, Clone)]
pub struct WorkerCall {
    pub id: String,
    pub import: String,
    /// Export name, `default` when the request named none.
    pub method: String,
    pub args: Vec<serde_json::Value>,
    /// Cancelled when the host abandons this call.
    pub cancel: CancellationToken,
}

/// Executes calls - abstracts whatever the worker actually runs.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Run a call. `Ok(None)` means the export returned nothing; `Err`
    /// carries the error text sent back to the host.
    async fn call(&self, call: WorkerCall) -> Result<Option<serde_json::Value>, String>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to open control pipes: {0}")]
    Pipe(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The host reused the id of a call that is still running.
    #[error("call {0} is already active")]
    DuplicateId(String),

    #[error("host closed the control pipe")]
    HostClosed,
}

type ActiveTable = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock(active: &ActiveTable) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serve calls on the inherited control pipes until the host asks us to stop.
///
/// The frame ceiling comes from `HOLDER_MAX_FRAME`, which the host sets to
/// its own.
pub async fn run_worker<H: CallHandler>(handler: Arc<H>) -> Result<(), WorkerError> {
    let max_frame_len = config::worker_max_frame()?;
    let (reader, writer) = pipes::open_inherited().map_err(WorkerError::Pipe)?;
    tracing::debug!(max_frame_len, "Worker attached to control pipes");
    serve(handler, reader, writer, max_frame_len).await
}

/// Serve calls over any reader/writer pair.
///
/// Returns `Ok(())` on a shutdown message. Calls still running when the
/// loop ends are cancelled and their responses discarded.
pub async fn serve<H, R, W>(
    handler: Arc<H>,
    reader: R,
    writer: W,
    max_frame_len: usize,
) -> Result<(), WorkerError>
where
    H: CallHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut requests = FramedRead::new(
        reader,
        LineJsonCodec::<WorkerRequest>::with_max_frame_len(max_frame_len),
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerResponse>();
    let writer_task = tokio::spawn(async move {
        let mut framed = FramedWrite::new(
            writer,
            LineJsonCodec::<WorkerResponse>::with_max_frame_len(max_frame_len),
        );
        while let Some(response) = rx.recv().await {
            let id = response.id.clone();
            match framed.send(response).await {
                Ok(()) => {}
                // Rejected before anything was buffered; the pipe is still usable.
                Err(CodecError::FrameTooLarge { limit }) => {
                    tracing::warn!(%id, limit, "Result too large for one frame");
                    let errtext = format!("result exceeds the {limit} byte frame limit");
                    if let Err(e) = framed.send(WorkerResponse::err(id, errtext)).await {
                        tracing::warn!(error = %e, "Failed to write response");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(%id, error = %e, "Failed to write response");
                    break;
                }
            }
        }
    });

    let active: ActiveTable = Arc::new(Mutex::new(HashMap::new()));

    let result = loop {
        let request = match requests.next().await {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read request");
                break Err(e.into());
            }
            None => break Err(WorkerError::HostClosed),
        };

        if request.cancel {
            if request.is_shutdown() {
                tracing::info!("Shutdown requested");
                break Ok(());
            }
            match lock(&active).get(&request.id) {
                Some(token) => {
                    tracing::debug!(id = %request.id, "Cancelling call");
                    token.cancel();
                }
                None => tracing::debug!(id = %request.id, "Cancel for inactive call ignored"),
            }
            continue;
        }

        let cancel = CancellationToken::new();
        {
            let mut active = lock(&active);
            if active.contains_key(&request.id) {
                tracing::error!(id = %request.id, "Duplicate active call id");
                break Err(WorkerError::DuplicateId(request.id));
            }
            active.insert(request.id.clone(), cancel.clone());
        }

        let call = WorkerCall {
            method: request.method_name().to_string(),
            id: request.id,
            import: request.import,
            args: request.args,
            cancel,
        };
        tracing::debug!(id = %call.id, import = %call.import, method = %call.method, "Running call");

        let handler = Arc::clone(&handler);
        let active = Arc::clone(&active);
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = call.id.clone();
            let outcome = AssertUnwindSafe(handler.call(call)).catch_unwind().await;
            lock(&active).remove(&id);

            let response = match outcome {
                Ok(Ok(res)) => WorkerResponse::ok(id, res),
                Ok(Err(errtext)) => WorkerResponse::err(id, errtext),
                Err(_) => {
                    tracing::error!(%id, "Call handler panicked");
                    WorkerResponse::err(id, "call handler panicked")
                }
            };
            let _ = tx.send(response);
        });
    };

    for (_, token) in lock(&active).drain() {
        token.cancel();
    }
    writer_task.abort();
    result
}
