//! Dependency bundle and per-invocation context handed to tools.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use lum_domain::asset::AssetQueries;

use crate::cancel::CancelToken;
use crate::refs::ReferenceManager;
use crate::sidechannel::Dispatcher;

/// Everything a bound tool closes over. Built per run: the dispatcher is
/// owned by the run, so tools must never outlive it — the registry holds
/// factories only.
#[derive(Clone)]
pub struct ToolDeps {
    pub queries: Arc<dyn AssetQueries>,
    pub refs: Arc<ReferenceManager>,
    pub dispatcher: Dispatcher,
}

/// Ambient resume state exposed to a tool re-invoked after an interrupt.
#[derive(Debug, Clone, Default)]
pub struct ResumeEnv {
    pub saved_state: Option<Value>,
    pub is_target: bool,
    pub user_data: Option<Value>,
}

/// Per-invocation context. Carries identity for side-channel events, the
/// cancel token, and — on resume only — the ambient [`ResumeEnv`].
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: Uuid,
    pub tool_call_id: String,
    /// Stable across all side-channel events of this invocation.
    pub execution_id: String,
    pub cancel: CancelToken,
    resume: Option<ResumeEnv>,
}

impl ToolContext {
    pub fn new(run_id: Uuid, tool_call_id: &str, cancel: CancelToken) -> Self {
        Self {
            run_id,
            tool_call_id: tool_call_id.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            cancel,
            resume: None,
        }
    }

    /// Attach the ambient resume environment (runtime-internal).
    pub fn with_resume(mut self, env: ResumeEnv) -> Self {
        self.resume = Some(env);
        self
    }

    /// Whether this invocation is a re-invocation after an interrupt.
    pub fn was_interrupted(&self) -> bool {
        self.resume.is_some()
    }

    /// Whether this tool's interrupt id was targeted by the resume call.
    pub fn is_resume_target(&self) -> bool {
        self.resume.as_ref().map(|r| r.is_target).unwrap_or(false)
    }

    /// State the tool saved when it interrupted, if any.
    pub fn saved_state(&self) -> Option<&Value> {
        self.resume.as_ref().and_then(|r| r.saved_state.as_ref())
    }

    /// User-supplied data for a targeted resume.
    pub fn user_data(&self) -> Option<&Value> {
        self.resume.as_ref().and_then(|r| r.user_data.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_has_no_resume_env() {
        let ctx = ToolContext::new(Uuid::new_v4(), "tc_1", CancelToken::new());
        assert!(!ctx.was_interrupted());
        assert!(!ctx.is_resume_target());
        assert!(ctx.saved_state().is_none());
        assert!(ctx.user_data().is_none());
    }

    #[test]
    fn resume_env_accessors() {
        let ctx = ToolContext::new(Uuid::new_v4(), "tc_1", CancelToken::new()).with_resume(
            ResumeEnv {
                saved_state: Some(serde_json::json!({"count": 42})),
                is_target: true,
                user_data: Some(serde_json::json!({"approved": true})),
            },
        );
        assert!(ctx.was_interrupted());
        assert!(ctx.is_resume_target());
        assert_eq!(ctx.saved_state().unwrap()["count"], 42);
        assert_eq!(ctx.user_data().unwrap()["approved"], true);
    }

    #[test]
    fn non_target_resume() {
        let ctx = ToolContext::new(Uuid::new_v4(), "tc_2", CancelToken::new()).with_resume(
            ResumeEnv {
                saved_state: Some(serde_json::json!({})),
                is_target: false,
                user_data: None,
            },
        );
        assert!(ctx.was_interrupted());
        assert!(!ctx.is_resume_target());
    }
}
