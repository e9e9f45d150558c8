//! Agent execution runtime.
//!
//! Drives the reasoning loop between a [`lum_model::ChatModel`] and a set
//! of registered tools: the tool registry, the per-run reference
//! manager, the UI side channel, cooperative interrupt/resume with
//! checkpointing, and the built-in photo tools.
//!
//! # Resuming interrupted tools
//!
//! Every interrupted tool is re-invoked on resume with its original
//! arguments, so each stateful tool is a one-step state machine:
//!
//! ```text
//! if !ctx.was_interrupted()      -> first call, run normally
//! else if ctx.is_resume_target() -> consume ctx.user_data(), complete
//! else                           -> re-interrupt with ctx.saved_state()
//! ```
//!
//! A tool that skips the re-interrupt in the last arm silently drops the
//! suspension for every non-targeted leaf of a composite interrupt.

pub mod cancel;
pub mod checkpoint;
pub mod deps;
pub mod error;
pub mod refs;
pub mod registry;
pub mod runtime;
pub mod sidechannel;
pub mod tools;

pub use cancel::CancelToken;
pub use checkpoint::{
    Checkpoint, CheckpointStore, FsCheckpointStore, InterruptContext, MemoryCheckpointStore,
};
pub use deps::{ResumeEnv, ToolContext, ToolDeps};
pub use error::{interrupt, stateful_interrupt, InterruptRequest, ToolError};
pub use refs::ReferenceManager;
pub use registry::{Tool, ToolRegistry};
pub use runtime::{AgentEvent, AgentRuntime, RunHandle, RunInput, RunOptions};
pub use sidechannel::{side_channel, Dispatcher, UiEvent};

/// Name of the top-level agent, used as the root of interrupt address
/// paths and in transport events.
pub const AGENT_NAME: &str = "lumilio";
