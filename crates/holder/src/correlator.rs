//! Request correlation over the control pipes.
//!
//! The correlator owns the sequence counter and the pending call table. One
//! lock covers both and is held only while an id is assigned, the frame is
//! queued and the waiter is registered; never while a caller waits.
//!
//! Two background loops serve a correlator:
//! - the write loop is the only writer of the host → worker pipe and drains
//!   an ordered queue, so frames from concurrent callers never interleave
//! - the read loop is the only reader of the worker → host pipe and hands
//!   each response to its own task for delivery
//!
//! Both loops hold the correlator weakly and stop once every host handle is
//! gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, LineJsonCodec};
use crate::bridge::protocol::{CallId, WorkerRequest, WorkerResponse};
use crate::call::{Payload, Request};
use crate::error::{HostError, Result};

/// A frame queued for the write loop, optionally acknowledged once written.
pub(crate) struct Outbound {
    request: WorkerRequest,
    written: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

impl Outbound {
    fn frame(request: WorkerRequest) -> Self {
        Self {
            request,
            written: None,
        }
    }
}

/// What a waiter receives: its own response, or why there will be none.
enum Delivery {
    Reply(WorkerResponse),
    TooLarge(usize),
    Failed(String),
}

#[derive(Default)]
struct Table {
    seq: u64,
    waiters: HashMap<CallId, oneshot::Sender<Delivery>>,
    /// Set once the connection has failed; later calls fail fast with it.
    failure: Option<String>,
    /// Set once shutdown has been queued.
    stopped: bool,
}

pub(crate) struct Correlator {
    table: Mutex<Table>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outer: CancellationToken,
}

impl Correlator {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pending call table mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    /// Assign an id, queue the call frame and register its waiter.
    pub(crate) fn register(self: &Arc<Self>, request: Request) -> Result<PendingCall> {
        let mut table = self.lock();
        if self.outer.is_cancelled() {
            return Err(HostError::HostCancelled);
        }
        if table.stopped {
            return Err(HostError::Closed);
        }
        if let Some(reason) = &table.failure {
            return Err(HostError::Transport(reason.clone()));
        }

        table.seq += 1;
        let id = CallId::from_seq(table.seq);
        let frame = request.into_frame(id);
        tracing::debug!(%id, import = %frame.import, method = frame.method_name(), "Dispatching call");

        self.outbound
            .send(Outbound::frame(frame))
            .map_err(|_| HostError::Closed)?;

        let (tx, rx) = oneshot::channel();
        if table.waiters.insert(id, tx).is_some() {
            // Ids come from a monotonic counter, so this cannot happen.
            tracing::error!(%id, "Replaced an in-flight waiter");
        }

        Ok(PendingCall {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    fn deliver(&self, response: WorkerResponse) {
        let Some(id) = CallId::parse(&response.id) else {
            tracing::warn!(id = %response.id, "Response with invalid call id, dropping");
            return;
        };

        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                if tx.send(Delivery::Reply(response)).is_err() {
                    tracing::debug!(%id, "Caller went away before delivery");
                }
            }
            None => tracing::warn!(%id, "Response for unknown or abandoned call, dropping"),
        }
    }

    /// Fail a call whose frame could not be written.
    fn reject(&self, id: &str, limit: usize) {
        let Some(id) = CallId::parse(id) else {
            return;
        };
        if let Some(tx) = self.lock().waiters.remove(&id) {
            let _ = tx.send(Delivery::TooLarge(limit));
        }
    }

    /// Fail every pending call and refuse new ones. First reason wins.
    fn fail_all(&self, reason: &str) {
        let waiters = {
            let mut table = self.lock();
            if table.failure.is_none() {
                table.failure = Some(reason.to_string());
            }
            std::mem::take(&mut table.waiters)
        };

        if !waiters.is_empty() {
            tracing::warn!(count = waiters.len(), %reason, "Failing pending calls");
        }
        for (_, tx) in waiters {
            let _ = tx.send(Delivery::Failed(reason.to_string()));
        }
    }

    /// Remove an abandoned call and tell the worker about it.
    fn forget(&self, id: CallId) {
        let mut table = self.lock();
        if table.waiters.remove(&id).is_none() {
            return;
        }
        // The worker is being killed or is unreachable; nobody to tell.
        if self.outer.is_cancelled() || table.failure.is_some() {
            return;
        }

        tracing::debug!(%id, "Call abandoned, sending cancel");
        if self
            .outbound
            .send(Outbound::frame(WorkerRequest::cancel(id.to_string())))
            .is_err()
        {
            tracing::debug!(%id, "Write loop gone, cancel not sent");
        }
    }

    /// Queue the shutdown message. The receiver resolves once it is written.
    ///
    /// Returns `None` if shutdown was already requested.
    pub(crate) fn shutdown(
        &self,
    ) -> Result<Option<oneshot::Receiver<std::result::Result<(), String>>>> {
        // The worker is being killed; a shutdown frame could never be read.
        if self.outer.is_cancelled() {
            return Err(HostError::HostCancelled);
        }
        let mut table = self.lock();
        if table.stopped {
            return Ok(None);
        }
        if let Some(reason) = &table.failure {
            return Err(HostError::Transport(reason.clone()));
        }
        table.stopped = true;

        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                request: WorkerRequest::shutdown(),
                written: Some(tx),
            })
            .map_err(|_| HostError::Closed)?;
        tracing::debug!("Queued worker shutdown");
        Ok(Some(rx))
    }

    /// Number of calls currently waiting for a response.
    pub(crate) fn pending(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// A registered call. Dropping it before a response arrives abandons the
/// call: the table entry goes away and the worker is sent a cancel.
pub(crate) struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<Delivery>,
    correlator: Arc<Correlator>,
}

enum Outcome {
    Delivered(std::result::Result<Delivery, oneshot::error::RecvError>),
    Abandoned(HostError),
    HostCancelled,
}

impl PendingCall {
    /// Wait for the response, or until `abandon` resolves with the error to
    /// return, or until the host's outer scope is cancelled.
    pub(crate) async fn wait(mut self, abandon: impl Future<Output = HostError>) -> Result<Payload> {
        let outer = self.correlator.outer.clone();

        let outcome = tokio::select! {
            biased;
            delivery = &mut self.rx => Outcome::Delivered(delivery),
            error = abandon => Outcome::Abandoned(error),
            _ = outer.cancelled() => Outcome::HostCancelled,
        };

        match outcome {
            Outcome::Delivered(Ok(Delivery::Reply(response))) => {
                tracing::debug!(id = %self.id, status = ?response.status, "Call completed");
                response
                    .into_result()
                    .map(Payload::new)
                    .map_err(|message| HostError::Call { message })
            }
            Outcome::Delivered(Ok(Delivery::TooLarge(limit))) => Err(HostError::FrameTooLarge { limit }),
            Outcome::Delivered(Ok(Delivery::Failed(reason))) => Err(HostError::Transport(reason)),
            Outcome::Delivered(Err(_)) => Err(HostError::Closed),
            Outcome::Abandoned(error) => {
                tracing::debug!(id = %self.id, %error, "Call abandoned");
                Err(error)
            }
            Outcome::HostCancelled => Err(HostError::HostCancelled),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

/// Build a correlator over the host ends of the control pipes and start its
/// read and write loops. The write loop exits when `closed` is cancelled.
pub(crate) fn start<R, W>(
    reader: R,
    writer: W,
    max_frame_len: usize,
    outer: CancellationToken,
    closed: CancellationToken,
) -> Arc<Correlator>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let correlator = Arc::new(Correlator {
        table: Mutex::new(Table::default()),
        outbound: tx,
        outer,
    });

    tokio::spawn(run_write_loop(
        writer,
        max_frame_len,
        rx,
        Arc::downgrade(&correlator),
        closed,
    ));
    tokio::spawn(run_read_loop(
        reader,
        max_frame_len,
        Arc::downgrade(&correlator),
    ));

    correlator
}

async fn run_write_loop<W>(
    writer: W,
    max_frame_len: usize,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    correlator: Weak<Correlator>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(
        writer,
        LineJsonCodec::<WorkerRequest>::with_max_frame_len(max_frame_len),
    );

    loop {
        let outbound = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                tracing::debug!("Write loop stopping: worker exited");
                break;
            }
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => {
                    tracing::debug!("Write loop stopping: host dropped");
                    break;
                }
            },
        };

        let Outbound { request, written } = outbound;
        let id = request.id.clone();
        match framed.send(request).await {
            Ok(()) => {
                tracing::trace!(%id, "Frame written");
                if let Some(ack) = written {
                    let _ = ack.send(Ok(()));
                }
            }
            // Rejected before anything was buffered; only this call fails.
            Err(CodecError::FrameTooLarge { limit }) => {
                tracing::warn!(%id, limit, "Call frame too large, rejecting");
                if let Some(ack) = written {
                    let _ = ack.send(Err(format!("frame exceeds {} bytes", limit)));
                }
                if let Some(correlator) = correlator.upgrade() {
                    correlator.reject(&id, limit);
                }
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "Control pipe write failed");
                let reason = format!("write to worker failed: {}", e);
                if let Some(ack) = written {
                    let _ = ack.send(Err(reason.clone()));
                }
                if let Some(correlator) = correlator.upgrade() {
                    correlator.fail_all(&reason);
                }
                break;
            }
        }
    }
}

async fn run_read_loop<R>(reader: R, max_frame_len: usize, correlator: Weak<Correlator>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(
        reader,
        LineJsonCodec::<WorkerResponse>::with_max_frame_len(max_frame_len),
    );
    let mut deliveries = JoinSet::new();

    let reason = loop {
        while deliveries.try_join_next().is_some() {}

        match framed.next().await {
            Some(Ok(response)) => {
                let Some(correlator) = correlator.upgrade() else {
                    tracing::debug!("Read loop stopping: host dropped");
                    return;
                };
                deliveries.spawn(async move { correlator.deliver(response) });
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Control pipe read failed");
                break format!("read from worker failed: {}", e);
            }
            None => {
                tracing::debug!("Control pipe closed by worker");
                break "worker closed the control pipe".to_string();
            }
        }
    };

    // Responses read before the failure still reach their callers.
    while deliveries.join_next().await.is_some() {}

    if let Some(correlator) = correlator.upgrade() {
        correlator.fail_all(&reason);
    }
}
