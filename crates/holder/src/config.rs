//! Host configuration and worker spawn strategies.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;

use crate::bridge::codec::{DEFAULT_MAX_FRAME, MIN_BUFFER};
use crate::bridge::protocol::LogSource;
use crate::harness::NODE_HARNESS;

/// Frame ceiling handed to the worker, so both ends enforce the same limit.
pub const MAX_FRAME_ENV: &str = "HOLDER_MAX_FRAME";

/// Receives each diagnostic line the worker writes to stdout or stderr.
pub type DiagnosticObserver = Arc<dyn Fn(LogSource, &str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}={value:?}: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime feature toggles for the Node.js worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerFlags {
    /// Pass `--disable-warning=ExperimentalWarning`.
    pub disable_experimental_warning: bool,
    /// Pass `--experimental-transform-types` so `.ts` modules can be imported.
    pub transform_types: bool,
}

impl WorkerFlags {
    pub fn to_args(self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.disable_experimental_warning {
            args.push("--disable-warning=ExperimentalWarning");
        }
        if self.transform_types {
            args.push("--experimental-transform-types");
        }
        args
    }
}

/// Extension point for different worker spawn strategies.
///
/// The spawner only builds the command; stdio, control pipes, environment
/// and working directory are wired by the supervisor.
pub trait WorkerSpawner: Send + Sync {
    fn command(&self, config: &HostConfig) -> Command;
}

/// Runs `node <flags> --input-type=module -e <harness>`.
pub struct NodeSpawner;

impl WorkerSpawner for NodeSpawner {
    fn command(&self, config: &HostConfig) -> Command {
        let mut command = Command::new(&config.program);
        command
            .args(config.flags.to_args())
            .args(&config.extra_flags)
            .arg("--input-type=module")
            .arg("-e")
            .arg(NODE_HARNESS);
        command
    }
}

/// Runs an arbitrary program that speaks the control-pipe protocol itself.
/// `config.program` and the worker flags are ignored.
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn command(&self, config: &HostConfig) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).args(&config.extra_flags);
        command
    }
}

/// Process-spawn configuration, fixed for the life of a host.
#[derive(Clone)]
pub struct HostConfig {
    pub program: PathBuf,
    pub flags: WorkerFlags,
    pub extra_flags: Vec<String>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
    pub observer: Option<DiagnosticObserver>,
    pub max_frame_len: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("program", &self.program)
            .field("flags", &self.flags)
            .field("extra_flags", &self.extra_flags)
            .field("env", &self.env)
            .field("current_dir", &self.current_dir)
            .field("observer", &self.observer.is_some())
            .field("max_frame_len", &self.max_frame_len)
            .finish_non_exhaustive()
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a frame ceiling as exported in [`MAX_FRAME_ENV`].
pub fn parse_max_frame(raw: &str) -> Result<usize, ConfigError> {
    let max = raw
        .trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidEnv {
            name: MAX_FRAME_ENV,
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
    if max < MIN_BUFFER {
        return Err(ConfigError::InvalidEnv {
            name: MAX_FRAME_ENV,
            value: raw.to_string(),
            reason: format!("must be at least {MIN_BUFFER}"),
        });
    }
    Ok(max)
}

/// Frame ceiling for a worker process: the host's export, or the default.
pub fn worker_max_frame() -> Result<usize, ConfigError> {
    match std::env::var(MAX_FRAME_ENV) {
        Ok(raw) if !raw.is_empty() => parse_max_frame(&raw),
        _ => Ok(DEFAULT_MAX_FRAME),
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("node"),
            flags: WorkerFlags::default(),
            extra_flags: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            observer: None,
            max_frame_len: DEFAULT_MAX_FRAME,
            spawner: Arc::new(NodeSpawner),
        }
    }

    /// Defaults overridden by `HOLDER_NODE` (worker program) and
    /// `HOLDER_MAX_FRAME` (frame ceiling in bytes).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(program) = lookup("HOLDER_NODE").filter(|p| !p.is_empty()) {
            config.program = PathBuf::from(program);
        }

        if let Some(raw) = lookup(MAX_FRAME_ENV) {
            config.max_frame_len = parse_max_frame(&raw)?;
        }

        Ok(config)
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_flags(mut self, flags: WorkerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_extra_flag(mut self, flag: impl Into<String>) -> Self {
        self.extra_flags.push(flag.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_observer(
        mut self,
        observer: impl Fn(LogSource, &str) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.max(MIN_BUFFER);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
