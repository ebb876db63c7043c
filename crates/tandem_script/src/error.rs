//! Error taxonomy for the bridge
//!
//! `Error` is `Clone` on purpose: an error raised inside a host callable is
//! parked in the engine while it travels through script code, and comes back
//! out as the very same value if the script does not handle it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tandem_core::{ArenaError, Handle, HostException};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("cannot convert {type_name}: {reason}")]
    Conversion { type_name: String, reason: String },

    #[error("undefined constructor '{name}'")]
    UndefinedConstructor { name: String },

    #[error("{name}() takes {expected} argument(s) but {given} were given")]
    Arity {
        name: String,
        expected: usize,
        given: usize,
    },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("{0}")]
    Foreign(HostException),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("thread-only binding '{name}' is not initialized in this context")]
    NotInitialized { name: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("the value stack is empty")]
    StackUnderflow,

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("interpreter error: {0}")]
    Interpreter(String),
}

impl Error {
    pub(crate) fn conversion(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Conversion {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Name given to the script-side `Error` object when this error is
    /// thrown into script code.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Conversion { .. } | Error::UndefinedConstructor { .. } => "ConversionError",
            Error::Arity { .. } => "ArityError",
            Error::Script(_) => "ScriptError",
            Error::Foreign(_) => "ForeignError",
            Error::Lifecycle(_) => "LifecycleError",
            Error::NotInitialized { .. } => "NotInitializedError",
            Error::NotFound { .. } => "NotFoundError",
            Error::InvalidArgument(_) => "InvalidArgumentError",
            Error::StackUnderflow => "StackUnderflowError",
            Error::Io { .. } => "IoError",
            Error::Config(_) => "ConfigError",
            Error::Interpreter(_) => "InterpreterError",
        }
    }
}

impl From<ArenaError> for Error {
    fn from(err: ArenaError) -> Self {
        let handle = match err {
            ArenaError::Stale { handle, .. } | ArenaError::OutOfBounds { handle, .. } => handle,
        };
        Error::Lifecycle(LifecycleError::StaleHandle { handle })
    }
}

/// Misuse of engines, contexts, proxies or suspend tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("the engine has been destroyed")]
    EngineDestroyed,

    #[error("the execution context has been destroyed")]
    ContextDestroyed,

    #[error("execution context {context} is suspended")]
    Suspended { context: Handle },

    #[error("suspend token was already consumed")]
    TokenConsumed,

    #[error("suspend token belongs to another execution context")]
    ForeignToken,

    #[error("engine is busy running {}", describe_context(.context))]
    EngineBusy { context: Option<Handle> },

    #[error("the engine cannot be re-entered from inside a host callable")]
    Reentrant,

    #[error("handle {handle} is stale")]
    StaleHandle { handle: Handle },

    #[error("host callable returned while execution context {context} is suspended")]
    ReturnedWhileSuspended { context: Handle },

    #[error("value belongs to another engine")]
    ForeignEngine,
}

fn describe_context(context: &Option<Handle>) -> String {
    match context {
        Some(handle) => format!("execution context {handle}"),
        None => "engine maintenance".to_string(),
    }
}

/// Syntax or runtime error raised by script code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Script-side error name (`SyntaxError`, `TypeError`, ...)
    pub name: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub stack: Option<String>,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " ({file}:{line})"),
            (Some(file), None) => write!(f, " ({file})"),
            (None, Some(line)) => write!(f, " (line {line})"),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for ScriptError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display_has_location() {
        let err = ScriptError {
            name: "SyntaxError".into(),
            message: "unexpected end of input".into(),
            file: Some("/tmp/x.js".into()),
            line: Some(2),
            stack: None,
        };
        assert_eq!(
            err.to_string(),
            "SyntaxError: unexpected end of input (/tmp/x.js:2)"
        );
    }

    #[test]
    fn test_arena_errors_are_lifecycle() {
        let handle = Handle::from_bits(1);
        let err: Error = ArenaError::Stale { handle, current: 1 }.into();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::StaleHandle { .. })
        ));
        assert_eq!(err.kind_name(), "LifecycleError");
    }

    #[test]
    fn test_busy_message() {
        let busy = LifecycleError::EngineBusy { context: None };
        assert_eq!(busy.to_string(), "engine is busy running engine maintenance");
    }
}
