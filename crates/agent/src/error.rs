//! Tool invocation outcomes.
//!
//! A tool returns `Ok(json)` on success, [`ToolError::Failed`] when the
//! world said no (surfaced to the model as a tool-role message, never
//! terminates the run), [`ToolError::Fatal`] when a dependency the model
//! cannot route around is gone, or [`ToolError::Interrupted`] — the
//! cooperative-suspension sentinel the runtime recognizes.

use serde_json::Value;

use lum_domain::Error;

/// A cooperative suspension raised inside a tool invocation.
#[derive(Debug, Clone)]
pub struct InterruptRequest {
    /// Shown to the caller (and the end user) to decide how to resume.
    pub info: Value,
    /// Opaque tool state restored on resume.
    pub state: Option<Value>,
}

/// Outcome of a tool invocation other than success.
#[derive(Debug)]
pub enum ToolError {
    /// Suspend the run; not an error.
    Interrupted(InterruptRequest),
    /// Business failure; becomes a tool-role message for the model.
    Failed(String),
    /// Dependency unavailable; terminates the run.
    Fatal(Error),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Interrupted(_) => write!(f, "interrupted"),
            ToolError::Failed(msg) => write!(f, "{msg}"),
            ToolError::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// Suspend the current tool invocation without state.
pub fn interrupt(info: Value) -> ToolError {
    ToolError::Interrupted(InterruptRequest { info, state: None })
}

/// Suspend the current tool invocation, saving `state` for the
/// re-invocation on resume.
pub fn stateful_interrupt(info: Value, state: Value) -> ToolError {
    ToolError::Interrupted(InterruptRequest {
        info,
        state: Some(state),
    })
}
