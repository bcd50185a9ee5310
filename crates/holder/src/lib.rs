//! holder: keep a worker process alive and call functions in it.
//!
//! The host spawns one worker per [`Host`], talks to it over two dedicated
//! pipes (fd 3 in, fd 4 out) using line-delimited JSON, and multiplexes any
//! number of concurrent calls over them. The worker's stdout and stderr are
//! diagnostics only and are forwarded line by line.

#[cfg(not(unix))]
compile_error!("holder passes control pipes as inherited descriptors and only supports unix");

mod call;
mod correlator;
mod error;
mod host;
mod supervisor;

pub mod bridge;
pub mod config;
pub mod harness;
pub mod logging;
pub mod pipes;
pub mod worker;

/// Holder version from Cargo.toml
pub const HOLDER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use call::{Method, Payload, Request};
pub use config::{
    CommandSpawner, ConfigError, DiagnosticObserver, HostConfig, NodeSpawner, WorkerFlags,
    WorkerSpawner,
};
pub use error::{HostError, Result};
pub use host::Host;
pub use supervisor::SpawnError;
pub use worker::{CallHandler, WorkerCall, WorkerError, run_worker};

pub use bridge::protocol::LogSource;
pub use tokio_util::sync::CancellationToken;
