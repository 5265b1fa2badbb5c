//! Error handling for the execution engine
//!
//! Every fallible operation in the crate returns [`Result`]. Variants mirror
//! the status kinds callers match on (`Invalid`, `IOError`, ...), and the
//! whole type is `Clone` because one completion result is handed to every
//! waiter of a plan or node.

use thiserror::Error;

/// Status kind of an [`ExecError`], independent of any attached context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Invalid,
    Io,
    NotImplemented,
    Cancelled,
    Key,
    Type,
    Execution,
    Config,
    Serialization,
}

/// Main error type for execution engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    /// Malformed options, bad topology, or a misuse of the plan lifecycle
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Errors raised by I/O performed on behalf of a node
    #[error("IOError: {0}")]
    Io(String),

    /// A requested feature or function does not exist
    #[error("NotImplemented: {0}")]
    NotImplemented(String),

    /// Work was abandoned because the plan was stopped
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A referenced field or function could not be found
    #[error("KeyError: {0}")]
    Key(String),

    /// Operand types do not fit the requested operation
    #[error("TypeError: {0}")]
    Type(String),

    /// A kernel failed while processing a batch
    #[error("ExecutionError: {0}")]
    Execution(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to (de)serializing batches
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ExecError>,
    },
}

impl ExecError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ExecError::Invalid(message.into())
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        ExecError::NotImplemented(message.into())
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        ExecError::Type(message.into())
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        ExecError::Key(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ExecError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Status kind, looking through any context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Invalid(_) => ErrorKind::Invalid,
            ExecError::Io(_) => ErrorKind::Io,
            ExecError::NotImplemented(_) => ErrorKind::NotImplemented,
            ExecError::Cancelled(_) => ErrorKind::Cancelled,
            ExecError::Key(_) => ErrorKind::Key,
            ExecError::Type(_) => ErrorKind::Type,
            ExecError::Execution(_) => ErrorKind::Execution,
            ExecError::Config(_) => ErrorKind::Config,
            ExecError::Serialization(_) => ErrorKind::Serialization,
            ExecError::WithContext { source, .. } => source.kind(),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.kind() == ErrorKind::Invalid
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        ExecError::Serialization(err.to_string())
    }
}

/// Result type alias for execution engine operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
