//! Error types surfaced by the engine host.

use super::dispatcher::LifecycleState;
use super::InstanceId;
use deno_core::error::{CoreError, JsError};
use deno_error::JsErrorBox;
use std::fmt;

/// A script exception captured with its diagnostics.
///
/// `Display` renders the boundary format:
/// `"<Name>: <message>\nStack trace: <stack>\nLine: <n>, Column: <m>"`,
/// where the trailing segments only appear when the exception carries them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub line: Option<i64>,
    pub column: Option<i64>,
}

impl ScriptError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            line: None,
            column: None,
        }
    }

    pub(crate) fn from_js_error(error: &JsError) -> Self {
        let name = error.name.clone().unwrap_or_else(|| "Error".to_string());
        let message = error
            .message
            .clone()
            .unwrap_or_else(|| error.exception_message.clone());
        let position = error
            .frames
            .iter()
            .find(|frame| frame.line_number.is_some());
        Self {
            name,
            message,
            stack: error.stack.clone().filter(|stack| !stack.is_empty()),
            line: position.and_then(|frame| frame.line_number),
            column: position.and_then(|frame| frame.column_number),
        }
    }
}

impl From<CoreError> for ScriptError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Js(js_error) => Self::from_js_error(&js_error),
            other => Self::new("Error", other.to_string()),
        }
    }
}

impl From<Box<JsError>> for ScriptError {
    fn from(error: Box<JsError>) -> Self {
        Self::from_js_error(&error)
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(stack) = &self.stack {
            write!(f, "\nStack trace: {}", stack)?;
        }
        if let Some(line) = self.line {
            write!(f, "\nLine: {}", line)?;
            if let Some(column) = self.column {
                write!(f, ", Column: {}", column)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Engine construction failures. The instance is never registered.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn engine thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("failed to build event loop: {0}")]
    EventLoop(#[source] std::io::Error),
    #[error("bootstrap script failed: {0}")]
    Bootstrap(ScriptError),
    #[error("engine thread exited before reporting readiness")]
    EngineExited,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("instance {0} already exists")]
    AlreadyExists(InstanceId),
    #[error("instance initialization failed: {0}")]
    InitFailed(#[from] InitError),
}

/// Why a task submission was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("instance {0} not found")]
    NotFound(InstanceId),
    #[error("instance {0} is not running ({1:?})")]
    NotRunning(InstanceId, LifecycleState),
    #[error("task payload is empty")]
    EmptyTask,
}

/// Failures of [`InstanceRegistry::evaluate`](super::InstanceRegistry::evaluate).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Rejected(#[from] Rejected),
    #[error("{0}")]
    Script(ScriptError),
    #[error("instance {0} closed before the script completed")]
    Closed(InstanceId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestroyError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),
}

/// Failures of the script-to-host bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("instance is closing")]
    InstanceClosing,
    #[error("host channel unavailable")]
    ChannelClosed,
    #[error("host rejected invocation: {0}")]
    HostRejected(String),
    #[error("host dropped the invocation without replying")]
    HostDropped,
    #[error("failed to marshal bridge payload: {0}")]
    Marshal(String),
}

impl BridgeError {
    /// Script-visible form; bridge failures surface as `InternalError`.
    pub(crate) fn into_js_error(self) -> JsErrorBox {
        JsErrorBox::new("InternalError", self.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed engine configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid engine configuration: {0}")]
    Invalid(String),
}
