use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::supervisor::SpawnError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The worker ran the call and reported a failure.
    #[error("worker call failed:\n{message}")]
    Call { message: String },

    /// The caller's cancellation token fired before a reply arrived.
    #[error("call cancelled")]
    Cancelled,

    #[error("call did not complete within {0:?}")]
    DeadlineExceeded(Duration),

    /// The host's outer scope was cancelled; the worker is being killed.
    #[error("host shut down")]
    HostCancelled,

    /// The control pipes failed; affects every call on this host.
    #[error("worker connection lost: {0}")]
    Transport(String),

    /// The call's request frame was larger than the frame ceiling.
    #[error("call frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("host connection closed")]
    Closed,

    #[error("failed to encode call argument: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode worker result: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("worker exited with {0}")]
    Exited(ExitStatus),

    #[error("failed to wait for worker: {0}")]
    Wait(String),
}

impl HostError {
    /// True for the three ways a call can be abandoned rather than fail.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::DeadlineExceeded(_) | Self::HostCancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
