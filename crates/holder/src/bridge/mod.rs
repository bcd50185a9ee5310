//! IPC bridge between the host and its worker process.
//!
//! This module provides the wire protocol and codec shared by both sides of
//! the control pipes.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse, CallId)
//! - **codec**: Line-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
