//! A worker speaking the control-pipe protocol natively, for exercising the
//! host end to end without a Node.js install.
//!
//! Methods: `inc`, `echo`, `boom`, `nothing` (also the default export),
//! `sleep`, `shout`, `big`, `crash`.

use std::sync::Arc;
use std::time::Duration;

use holder::{CallHandler, WorkerCall};
use serde_json::{Value, json};

struct EchoHandler;

impl EchoHandler {
    fn int_arg(call: &WorkerCall, index: usize) -> Result<i64, String> {
        call.args
            .get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| format!("TypeError: argument {index} of {} must be an integer", call.method))
    }
}

#[async_trait::async_trait]
impl CallHandler for EchoHandler {
    async fn call(&self, call: WorkerCall) -> Result<Option<Value>, String> {
        match call.method.as_str() {
            "inc" => Ok(Some(json!(Self::int_arg(&call, 0)? + 1))),
            "echo" => Ok(Some(Value::Array(call.args))),
            "boom" => Err(format!("Error: boom (from {})", call.import)),
            "default" | "nothing" => Ok(None),
            "sleep" => {
                let ms = Self::int_arg(&call, 0)?.max(0) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Some(json!(ms))),
                    _ = call.cancel.cancelled() => {
                        tracing::debug!(id = %call.id, "Sleep aborted");
                        Err("AbortError: sleep aborted".to_string())
                    }
                }
            }
            "shout" => {
                let text = call.args.first().and_then(Value::as_str).unwrap_or("hello");
                println!("{text}");
                eprintln!("{}", text.to_uppercase());
                Ok(Some(json!(text.len())))
            }
            "big" => {
                let len = Self::int_arg(&call, 0)?.max(0) as usize;
                Ok(Some(json!("x".repeat(len))))
            }
            "crash" => {
                let code = Self::int_arg(&call, 0).unwrap_or(3);
                std::process::exit(code as i32);
            }
            other => Err(format!("TypeError: module.{other} is not a function")),
        }
    }
}

#[tokio::main]
async fn main() {
    holder::logging::init_tracing();

    if let Err(e) = holder::run_worker(Arc::new(EchoHandler)).await {
        tracing::error!(error = %e, "Worker failed");
        std::process::exit(1);
    }
}
