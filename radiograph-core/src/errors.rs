//! Engine error types with granular categories (section 7).

use thiserror::Error;

/// Top-level error type for all engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("{0}")]
    TypeMismatch(#[from] TypeMismatchError),

    #[error("{0}")]
    Startup(#[from] StartupError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("{0}")]
    Io(#[from] IoError),

    #[error("{0}")]
    StopTimeout(#[from] StopTimeoutError),
}

/// Stable kind tag for an `EngineError`, independent of its message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Graph,
    TypeMismatch,
    Startup,
    Runtime,
    Io,
    StopTimeout,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Graph(_) => ErrorKind::Graph,
            EngineError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            EngineError::Startup(_) => ErrorKind::Startup,
            EngineError::Runtime(_) => ErrorKind::Runtime,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::StopTimeout(_) => ErrorKind::StopTimeout,
        }
    }
}

/// Errors raised during `load`/`validate`, recovered locally without
/// changing engine state.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("graph contains a cycle reachable from node '{0}'")]
    Cyclic(String),

    #[error("input port '{port}' on node '{node}' is not connected")]
    Disconnected { node: String, port: String },

    #[error("port mismatch: {0}")]
    PortMismatch(String),

    #[error("unknown block class '{0}'")]
    UnknownClass(String),

    #[error("composite '{composite}' references unknown inner node '{inner}'")]
    DanglingCompositePort { composite: String, inner: String },
}

/// Type inference failure: no registered signature matched the resolved
/// input types.
#[derive(Debug, Clone, Error)]
#[error("type mismatch on node '{node}': got [{}], no signature accepted it (candidates: [{}])",
    got.join(", "), expected.join("; "))]
pub struct TypeMismatchError {
    pub node: String,
    pub got: Vec<String>,
    pub expected: Vec<String>,
}

/// `initialize()` raised, or the worker failed to spawn.
#[derive(Debug, Clone, Error)]
#[error("worker for node '{node}' failed to start: {cause}")]
pub struct StartupError {
    pub node: String,
    pub cause: String,
}

/// `process()` raised; promoted to a graph failure after reaping.
#[derive(Debug, Clone, Error)]
#[error("worker for node '{node}' failed at runtime: {cause}")]
pub struct RuntimeError {
    pub node: String,
    pub cause: String,
}

/// Pipe read/write failure not attributable to normal EOF.
#[derive(Debug, Clone, Error)]
#[error("I/O error on node '{node}' during {op}: {message}")]
pub struct IoError {
    pub node: String,
    pub op: String,
    pub errno: Option<i32>,
    pub message: String,
}

/// The graceful stop deadline was exceeded; the named workers did not exit
/// in time.
#[derive(Debug, Clone, Error)]
#[error("stop deadline exceeded, still running: [{}]", nodes.join(", "))]
pub struct StopTimeoutError {
    pub nodes: Vec<String>,
}

pub type Result<T> = std::result::Result<T, EngineError>;
