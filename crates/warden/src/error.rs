//! Error types for the warden library

use crate::registry::ModuleId;
use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use std::num::NonZeroI32;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while setting up or configuring the supervisor.
///
/// Stage failures are not reported through this type; they are folded into a
/// [`StageError`] by the executor.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Failed to create event multiplexer: {0}")]
    Multiplexer(#[source] Errno),

    #[error("Failed to set up child-exit notification: {0}")]
    ExitNotifier(#[source] Errno),

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Unsafe process state: {0}")]
    ProcessState(String),
}

/// Result type alias for warden setup operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Failures of the fixed-size message exchange.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Short write: sent {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Failed to send message: {0}")]
    Send(#[source] std::io::Error),

    #[error("Malformed message: received {received} bytes, expected {expected}")]
    BadLength { received: usize, expected: usize },

    #[error("Failed to receive message: {0}")]
    Recv(#[source] std::io::Error),
}

/// Failures of the process spawner that are visible to the parent.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to create worker channel: {0}")]
    Channel(#[source] std::io::Error),

    #[error("fork() failed: {0}")]
    Fork(#[source] Errno),
}

/// Why a stage did not produce a successful result.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Module {0} is not registered")]
    InvalidArgument(ModuleId),

    #[error("Channel setup failed: {0}")]
    Channel(#[source] std::io::Error),

    #[error("fork() failed: {0}")]
    Fork(#[source] Errno),

    #[error("Failed to register channel on multiplexer: {0}")]
    Registration(#[source] Errno),

    #[error("Worker failed to send its message")]
    ProtocolSend,

    #[error("Protocol receive failure: {0}")]
    ProtocolRecv(#[source] ProtocolError),

    #[error("Timed out waiting for worker")]
    Timeout,

    #[error("Module reported failure (code {code}){}", with_detail(.detail))]
    Module { code: i32, detail: Option<String> },

    #[error("Event wait failed: {0}")]
    Wait(#[source] Errno),

    #[error("Worker exited without responding ({})", describe_exit(.status))]
    NoResponse { status: Option<WaitStatus> },

    #[error("Worker would not die after SIGKILL")]
    Zombie,
}

impl From<SpawnError> for StageError {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::Channel(e) => StageError::Channel(e),
            SpawnError::Fork(e) => StageError::Fork(e),
        }
    }
}

fn with_detail(detail: &Option<String>) -> String {
    match detail {
        Some(d) if !d.is_empty() => format!(": {d}"),
        _ => String::new(),
    }
}

fn describe_exit(status: &Option<WaitStatus>) -> String {
    match status {
        Some(WaitStatus::Exited(_, code)) => format!("exit code {code}"),
        Some(WaitStatus::Signaled(_, sig, _)) => format!("killed by {sig}"),
        Some(other) => format!("{other:?}"),
        None => "status already collected".to_string(),
    }
}

/// Failures inside a module body. Each maps to the status code the worker
/// reports on its channel.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Missing or invalid argument")]
    InvalidArgument,

    #[error("Failed to open database: {0}")]
    DbOpen(#[source] rusqlite::Error),

    #[error("Database statement failed: {0}")]
    DbExec(#[source] rusqlite::Error),

    #[error("Property {0} not found")]
    PropertyMissing(String),

    #[error("Network request failed: {0}")]
    Network(String),

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

impl WorkerError {
    /// Status code carried in the reply message.
    #[must_use]
    pub fn code(&self) -> NonZeroI32 {
        match self {
            WorkerError::InvalidArgument => status::INVALID_ARGUMENT,
            WorkerError::DbOpen(_) => status::DB_OPEN,
            WorkerError::DbExec(_) => status::DB_EXEC,
            WorkerError::PropertyMissing(_) => status::PROPERTY_MISSING,
            WorkerError::Network(_) => status::NETWORK,
            WorkerError::Open { .. } => status::OPEN,
            WorkerError::Read { .. } => status::READ,
            WorkerError::XmlParse(_) => status::XML_PARSE,
        }
    }
}

/// Stable status codes reported by module bodies.
pub mod status {
    use std::num::NonZeroI32;

    const fn code(n: i32) -> NonZeroI32 {
        match NonZeroI32::new(n) {
            Some(c) => c,
            None => panic!("status code must be non-zero"),
        }
    }

    pub const INVALID_ARGUMENT: NonZeroI32 = code(2);
    pub const DB_OPEN: NonZeroI32 = code(13);
    pub const DB_EXEC: NonZeroI32 = code(14);
    pub const PROPERTY_MISSING: NonZeroI32 = code(15);
    pub const NETWORK: NonZeroI32 = code(16);
    pub const OPEN: NonZeroI32 = code(17);
    pub const READ: NonZeroI32 = code(18);
    pub const XML_PARSE: NonZeroI32 = code(19);
}
