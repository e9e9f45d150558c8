//! The reasoning loop — alternates model calls and tool execution,
//! streaming [`AgentEvent`]s to the caller.
//!
//! Entry points: [`AgentRuntime::start`] for a fresh run and
//! [`AgentRuntime::resume`] to continue a checkpointed one. Both spawn
//! the loop and return a [`RunHandle`] whose receivers the transport
//! drains.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use lum_domain::asset::AssetQueries;
use lum_domain::chat::{Message, ToolCall, ToolDefinition};
use lum_domain::stream::StreamEvent;
use lum_domain::Error;
use lum_model::retry::{with_retry, RetryPolicy};
use lum_model::{ChatModel, ChatRequest};

use crate::cancel::CancelToken;
use crate::checkpoint::{Checkpoint, CheckpointStore, InterruptContext, CHECKPOINT_VERSION};
use crate::deps::{ResumeEnv, ToolDeps, ToolContext};
use crate::error::{InterruptRequest, ToolError};
use crate::refs::ReferenceManager;
use crate::registry::{Tool, ToolRegistry};
use crate::sidechannel::{side_channel, UiEvent};
use crate::AGENT_NAME;

const DEFAULT_SYSTEM_PROMPT: &str = "You are Lumilio, a photo library assistant. You help the \
user find, organize, and act on their photos using the available tools. Tool results are JSON; \
use their `message` field when describing outcomes. Never show raw identifiers (asset ids, \
reference ids) to the user.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Interrupt leaf as exposed to callers (tool state stays internal).
#[derive(Debug, Clone, Serialize)]
pub struct InterruptNotice {
    pub id: String,
    pub address: Vec<String>,
    pub info: Value,
    pub is_root_cause: bool,
}

impl From<&InterruptContext> for InterruptNotice {
    fn from(ctx: &InterruptContext) -> Self {
        Self {
            id: ctx.id.clone(),
            address: ctx.address_path.clone(),
            info: ctx.info.clone(),
            is_root_cause: ctx.is_root_cause,
        }
    }
}

/// Events emitted during a run. The stream terminates after `Done`,
/// `Error`, or `Interrupted`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Incremental assistant text.
    #[serde(rename = "assistant_delta")]
    AssistantDelta { text: String },

    /// Incremental reasoning text.
    #[serde(rename = "reasoning_delta")]
    ReasoningDelta { text: String },

    /// The final coalesced assistant message of the run.
    #[serde(rename = "assistant_message")]
    AssistantMessage { content: String },

    #[serde(rename = "tool_call_started")]
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    #[serde(rename = "tool_call_result")]
    ToolCallResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// The run is suspended; resume with the checkpoint id and targets.
    #[serde(rename = "interrupted")]
    Interrupted {
        checkpoint_id: String,
        interrupt_contexts: Vec<InterruptNotice>,
    },

    #[serde(rename = "error")]
    Error { kind: String, message: String },

    #[serde(rename = "done")]
    Done,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs and handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_iterations: u32,
    /// Execute the tool calls of one reasoning step concurrently.
    /// Callers must not rely on cross-tool ordering when set.
    pub parallel_tools: bool,
    pub retry: RetryPolicy,
    pub system_prompt: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            parallel_tools: false,
            retry: RetryPolicy::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
        }
    }
}

/// Input to a fresh run.
#[derive(Debug, Clone)]
pub struct RunInput {
    /// Key any checkpoint of this run is stored under (the transport's
    /// thread id).
    pub checkpoint_id: String,
    pub query: String,
    pub tool_names: Vec<String>,
}

/// Live handle to a spawned run.
pub struct RunHandle {
    pub run_id: Uuid,
    pub events: mpsc::Receiver<AgentEvent>,
    pub ui_events: mpsc::Receiver<UiEvent>,
    pub cancel: CancelToken,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentRuntime {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    queries: Arc<dyn AssetQueries>,
    refs: Arc<ReferenceManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: RunOptions,
    /// Keys with a resume in flight; a second resume of the same key is
    /// rejected instead of racing the first.
    active_resumes: Arc<Mutex<HashSet<String>>>,
}

impl AgentRuntime {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        queries: Arc<dyn AssetQueries>,
        refs: Arc<ReferenceManager>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            model,
            registry,
            queries,
            refs,
            checkpoints,
            options,
            active_resumes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn references(&self) -> &Arc<ReferenceManager> {
        &self.refs
    }

    fn task(&self, run_id: Uuid, checkpoint_id: String, tool_names: Vec<String>) -> (RunTask, RunHandle) {
        let (tx, rx) = mpsc::channel(64);
        let (dispatcher, ui_rx) = side_channel();
        let cancel = CancelToken::new();

        let deps = ToolDeps {
            queries: self.queries.clone(),
            refs: self.refs.clone(),
            dispatcher: dispatcher.clone(),
        };
        let tools = self.registry.build(&tool_names, &deps);
        let tool_defs = ToolRegistry::definitions(&tools);

        let task = RunTask {
            dispatcher,
            model: self.model.clone(),
            retry: self.options.retry.clone(),
            max_iterations: self.options.max_iterations,
            parallel_tools: self.options.parallel_tools,
            run_id,
            checkpoint_id,
            tool_names,
            tools,
            tool_defs,
            refs: self.refs.clone(),
            checkpoints: self.checkpoints.clone(),
            tx,
            cancel: cancel.clone(),
            interrupt_acknowledged: false,
            _resume_guard: None,
        };
        let handle = RunHandle {
            run_id,
            events: rx,
            ui_events: ui_rx,
            cancel,
        };
        (task, handle)
    }

    /// Start a fresh run. Unknown tool names are skipped (the registry
    /// logs them); an empty tool set still reasons, it just cannot act.
    pub fn start(&self, input: RunInput) -> RunHandle {
        let run_id = Uuid::new_v4();
        let (task, handle) = self.task(run_id, input.checkpoint_id, input.tool_names);
        let system_prompt = self.options.system_prompt.clone();

        let span = tracing::info_span!("run", run_id = %run_id, agent = AGENT_NAME);
        tokio::spawn(
            async move {
                tracing::debug!(tools = task.tools.len(), "run started");
                let conversation = vec![
                    Message::system(&system_prompt),
                    Message::user(&input.query),
                ];
                task.drive(conversation, 0, None).await;
            }
            .instrument(span),
        );

        handle
    }

    /// Resume a checkpointed run. `targets` maps interrupt ids to the
    /// user data each targeted tool consumes; non-targeted leaves
    /// re-interrupt and the checkpoint stays valid.
    pub fn resume(&self, checkpoint_id: String, targets: HashMap<String, Value>) -> RunHandle {
        // Reject a concurrent resume of the same key up front.
        let guard = {
            let mut active = self.active_resumes.lock();
            if !active.insert(checkpoint_id.clone()) {
                None
            } else {
                Some(ResumeGuard {
                    set: self.active_resumes.clone(),
                    key: checkpoint_id.clone(),
                })
            }
        };

        let Some(guard) = guard else {
            let (task, handle) = self.task(Uuid::new_v4(), checkpoint_id.clone(), Vec::new());
            tokio::spawn(async move {
                task.emit_error(&Error::InvalidInput(format!(
                    "a resume of {checkpoint_id} is already in progress"
                )))
                .await;
            });
            return handle;
        };

        let checkpoints = self.checkpoints.clone();
        let (mut probe_task, probe_handle) =
            self.task(Uuid::new_v4(), checkpoint_id.clone(), Vec::new());
        let registry = self.registry.clone();
        let queries = self.queries.clone();
        let refs = self.refs.clone();

        let span = tracing::info_span!("resume", checkpoint_id = %checkpoint_id);
        tokio::spawn(
            async move {
                let blob = match checkpoints.get(&checkpoint_id).await {
                    Ok(blob) => blob,
                    Err(Error::NotFound(_)) => {
                        probe_task
                            .emit_error(&Error::InvalidInput(format!(
                                "no checkpoint under {checkpoint_id}"
                            )))
                            .await;
                        return;
                    }
                    Err(e) => {
                        probe_task.emit_error(&e).await;
                        return;
                    }
                };
                let cp = match Checkpoint::deserialize(&blob) {
                    Ok(cp) => cp,
                    Err(e) => {
                        probe_task.emit_error(&e).await;
                        return;
                    }
                };

                // Rebind tools for the checkpointed tool set, reusing the
                // task's dispatcher/cancel wiring.
                probe_task.run_id = cp.run_id;
                probe_task.tool_names = cp.tool_names.clone();
                let deps = ToolDeps {
                    queries,
                    refs,
                    dispatcher: probe_task.dispatcher.clone(),
                };
                probe_task.tools = registry.build(&cp.tool_names, &deps);
                probe_task.tool_defs = ToolRegistry::definitions(&probe_task.tools);
                // The checkpoint exists because the caller received an
                // `Interrupted` for it; that interrupt is acknowledged.
                probe_task.interrupt_acknowledged = true;
                probe_task._resume_guard = Some(guard);

                tracing::info!(
                    run_id = %cp.run_id,
                    interrupts = cp.interrupt_contexts.len(),
                    pending = cp.pending_tool_calls.len(),
                    "resuming checkpointed run"
                );

                let plan = ResumePlan {
                    interrupts: cp.interrupt_contexts,
                    pending: cp.pending_tool_calls,
                    targets,
                };
                probe_task
                    .drive(cp.conversation, cp.iteration_count, Some(plan))
                    .await;
            }
            .instrument(span),
        );

        probe_handle
    }
}

struct ResumeGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One unit of tool work in a step: a call, plus — when re-invoking an
/// interrupted tool on resume — the preserved interrupt id and ambient
/// environment.
struct WorkItem {
    call: ToolCall,
    resume: Option<(String, Vec<String>, ResumeEnv)>,
}

struct ResumePlan {
    interrupts: Vec<InterruptContext>,
    pending: Vec<ToolCall>,
    targets: HashMap<String, Value>,
}

enum StepOutcome {
    /// All calls resolved; keep reasoning.
    Continue,
    /// A `returns_directly` tool succeeded; `Done` was emitted.
    Finished,
    /// Interrupted; checkpoint written, `Interrupted` emitted.
    Suspended,
    /// Fatal or cancelled; terminal `Error` emitted.
    Aborted,
}

struct ModelTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
}

struct RunTask {
    model: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    max_iterations: u32,
    parallel_tools: bool,
    run_id: Uuid,
    checkpoint_id: String,
    tool_names: Vec<String>,
    tools: Vec<Arc<dyn Tool>>,
    tool_defs: Vec<ToolDefinition>,
    refs: Arc<ReferenceManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    dispatcher: crate::sidechannel::Dispatcher,
    tx: mpsc::Sender<AgentEvent>,
    cancel: CancelToken,
    /// Whether the caller has already received an `Interrupted` event
    /// for this checkpoint key (true on resume). Governs whether a
    /// cancelled suspension may delete the checkpoint.
    interrupt_acknowledged: bool,
    /// Held for its Drop: releases the resume-in-flight marker.
    _resume_guard: Option<ResumeGuard>,
}

impl RunTask {
    async fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event).await;
    }

    async fn emit_error(&self, err: &Error) {
        tracing::warn!(run_id = %self.run_id, error = %err, "run terminated with error");
        self.emit(AgentEvent::Error {
            kind: err.kind().into(),
            message: err.to_string(),
        })
        .await;
    }

    /// Run terminal: release run-scoped references.
    fn finish(&self) {
        self.refs.drop_run(self.run_id);
    }

    async fn drive(self, mut conversation: Vec<Message>, iteration: u32, resume: Option<ResumePlan>) {
        if let Some(plan) = resume {
            let items = plan_to_items(&plan);
            match self.execute_step(&mut conversation, items, iteration).await {
                StepOutcome::Continue => {
                    if let Err(e) = self.checkpoints.delete(&self.checkpoint_id).await {
                        tracing::warn!(error = %e, "failed to delete consumed checkpoint");
                    }
                }
                StepOutcome::Finished => {
                    if let Err(e) = self.checkpoints.delete(&self.checkpoint_id).await {
                        tracing::warn!(error = %e, "failed to delete consumed checkpoint");
                    }
                    return;
                }
                StepOutcome::Suspended | StepOutcome::Aborted => return,
            }
        }
        self.reason_loop(conversation, iteration).await;
    }

    async fn reason_loop(&self, mut conversation: Vec<Message>, mut iteration: u32) {
        loop {
            iteration += 1;
            if self.cancel.is_cancelled() {
                self.emit_error(&Error::Cancelled).await;
                self.finish();
                return;
            }
            if iteration > self.max_iterations {
                self.emit_error(&Error::IterationLimit(self.max_iterations)).await;
                self.finish();
                return;
            }
            tracing::debug!(iteration, "reasoning iteration");

            let turn = match self.call_model(&conversation).await {
                Ok(turn) => turn,
                Err(e) => {
                    self.emit_error(&e).await;
                    self.finish();
                    return;
                }
            };

            if turn.tool_calls.is_empty() {
                // Also covers a fully empty assistant turn: done, not a
                // forever-loop.
                self.emit(AgentEvent::AssistantMessage {
                    content: turn.text,
                })
                .await;
                self.emit(AgentEvent::Done).await;
                self.finish();
                return;
            }

            conversation.push(Message::assistant_with_tool_calls(&turn.text, &turn.tool_calls));

            let items = turn
                .tool_calls
                .iter()
                .map(|tc| WorkItem {
                    call: tc.clone(),
                    resume: None,
                })
                .collect();

            match self.execute_step(&mut conversation, items, iteration).await {
                StepOutcome::Continue => {}
                StepOutcome::Finished | StepOutcome::Suspended | StepOutcome::Aborted => return,
            }
        }
    }

    // ── Model call ─────────────────────────────────────────────────

    async fn call_model(&self, conversation: &[Message]) -> Result<ModelTurn, Error> {
        let req = ChatRequest {
            messages: conversation.to_vec(),
            tools: self.tool_defs.clone(),
            temperature: Some(0.2),
            max_tokens: None,
        };

        // The retry policy covers establishing the stream; a failure
        // mid-stream is surfaced, not retried.
        let mut stream = with_retry(&self.retry, "model.generate", || {
            self.model.generate_stream(&req)
        })
        .await?;

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        // call_id -> (name, argument buffer), for adapters that emit
        // started/delta without a finished event.
        let mut partial: HashMap<String, (String, String)> = HashMap::new();

        while let Some(event) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match event? {
                StreamEvent::Reasoning { text } => {
                    self.emit(AgentEvent::ReasoningDelta { text }).await;
                }
                StreamEvent::Token { text: t } => {
                    self.emit(AgentEvent::AssistantDelta { text: t.clone() }).await;
                    text.push_str(&t);
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    partial.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = partial.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    partial.remove(&call_id);
                    tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { .. } => {}
            }
        }

        for (call_id, (tool_name, args)) in partial.drain() {
            let arguments = if args.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "unfinished tool call has invalid JSON arguments; defaulting to empty object"
                    );
                    Value::Object(Default::default())
                })
            };
            tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        Ok(ModelTurn { text, tool_calls })
    }

    // ── Tool step ──────────────────────────────────────────────────

    async fn execute_step(
        &self,
        conversation: &mut Vec<Message>,
        items: Vec<WorkItem>,
        iteration: u32,
    ) -> StepOutcome {
        let mut interrupts: Vec<InterruptContext> = Vec::new();
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut finished = false;

        if self.parallel_tools && items.len() > 1 {
            for item in &items {
                self.emit(AgentEvent::ToolCallStarted {
                    call_id: item.call.call_id.clone(),
                    tool_name: item.call.tool_name.clone(),
                    arguments: item.call.arguments.clone(),
                })
                .await;
            }
            if self.cancel.is_cancelled() {
                self.emit_error(&Error::Cancelled).await;
                self.finish();
                return StepOutcome::Aborted;
            }

            let futures: Vec<_> = items.iter().map(|item| self.invoke_item(item)).collect();
            let results = futures_util::future::join_all(futures).await;

            for (item, outcome) in items.iter().zip(results) {
                match outcome {
                    Invocation::Success { value, returns_directly } => {
                        self.record_success(conversation, &item.call, value).await;
                        finished = finished || returns_directly;
                    }
                    Invocation::Business(message) => {
                        self.record_failure(conversation, &item.call, &message).await;
                    }
                    Invocation::Interrupt(req) => {
                        interrupts.push(self.interrupt_context(item, req));
                    }
                    Invocation::Fatal(e) => {
                        self.emit_error(&e).await;
                        self.finish();
                        return StepOutcome::Aborted;
                    }
                }
            }
        } else {
            for item in items.iter() {
                if self.cancel.is_cancelled() {
                    self.emit_error(&Error::Cancelled).await;
                    self.finish();
                    return StepOutcome::Aborted;
                }
                if !interrupts.is_empty() && item.resume.is_none() {
                    // Once the step is interrupting, fresh calls never
                    // start; they run on resume. Re-invocations of
                    // already-interrupted leaves still execute so every
                    // leaf either resolves or re-suspends.
                    pending.push(item.call.clone());
                    continue;
                }

                self.emit(AgentEvent::ToolCallStarted {
                    call_id: item.call.call_id.clone(),
                    tool_name: item.call.tool_name.clone(),
                    arguments: item.call.arguments.clone(),
                })
                .await;

                match self.invoke_item(item).await {
                    Invocation::Success { value, returns_directly } => {
                        self.record_success(conversation, &item.call, value).await;
                        if returns_directly {
                            finished = true;
                            // Terminate immediately; later calls never run.
                            break;
                        }
                    }
                    Invocation::Business(message) => {
                        self.record_failure(conversation, &item.call, &message).await;
                    }
                    Invocation::Interrupt(req) => {
                        interrupts.push(self.interrupt_context(item, req));
                    }
                    Invocation::Fatal(e) => {
                        self.emit_error(&e).await;
                        self.finish();
                        return StepOutcome::Aborted;
                    }
                }
            }
        }

        if !interrupts.is_empty() {
            // The first leaf in deterministic tool-call order is the root
            // cause; resume may target any subset.
            for (i, ictx) in interrupts.iter_mut().enumerate() {
                ictx.is_root_cause = i == 0;
            }
            return self
                .suspend(conversation.clone(), pending, interrupts, iteration)
                .await;
        }

        if finished {
            self.emit(AgentEvent::Done).await;
            self.finish();
            return StepOutcome::Finished;
        }

        StepOutcome::Continue
    }

    async fn suspend(
        &self,
        conversation: Vec<Message>,
        pending_tool_calls: Vec<ToolCall>,
        interrupt_contexts: Vec<InterruptContext>,
        iteration_count: u32,
    ) -> StepOutcome {
        // Cancellation beats suspension. The caller acknowledges an
        // interrupt by receiving the `Interrupted` event; a run
        // cancelled before that must terminate with `error(cancelled)`
        // and leave no fresh checkpoint behind.
        if self.cancel.is_cancelled() {
            self.emit_error(&Error::Cancelled).await;
            self.finish();
            return StepOutcome::Aborted;
        }

        let notices: Vec<InterruptNotice> =
            interrupt_contexts.iter().map(InterruptNotice::from).collect();
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            run_id: self.run_id,
            created_at: chrono::Utc::now(),
            originator: AGENT_NAME.into(),
            conversation,
            pending_tool_calls,
            interrupt_contexts,
            iteration_count,
            tool_names: self.tool_names.clone(),
        };

        let blob = match checkpoint.serialize() {
            Ok(blob) => blob,
            Err(e) => {
                self.emit_error(&e).await;
                self.finish();
                return StepOutcome::Aborted;
            }
        };
        if let Err(e) = self.checkpoints.put(&self.checkpoint_id, blob).await {
            self.emit_error(&e).await;
            self.finish();
            return StepOutcome::Aborted;
        }

        // Cancellation may have landed while the blob was being written.
        // If so, this interrupt was never acknowledged: remove the
        // checkpoint again — unless an earlier acknowledged interrupt
        // owns this key (a cancelled re-suspension during resume), in
        // which case the rewritten blob stays resumable.
        if self.cancel.is_cancelled() {
            if !self.interrupt_acknowledged {
                if let Err(e) = self.checkpoints.delete(&self.checkpoint_id).await {
                    tracing::warn!(error = %e, "failed to delete unacknowledged checkpoint");
                }
            }
            self.emit_error(&Error::Cancelled).await;
            self.finish();
            return StepOutcome::Aborted;
        }

        tracing::info!(
            run_id = %self.run_id,
            checkpoint_id = %self.checkpoint_id,
            leaves = notices.len(),
            "run suspended"
        );
        self.emit(AgentEvent::Interrupted {
            checkpoint_id: self.checkpoint_id.clone(),
            interrupt_contexts: notices,
        })
        .await;
        StepOutcome::Suspended
    }

    // ── Single invocation ──────────────────────────────────────────

    async fn invoke_item(&self, item: &WorkItem) -> Invocation {
        let call = &item.call;
        let tool = match self
            .tools
            .iter()
            .find(|t| t.descriptor().name == call.tool_name)
        {
            Some(tool) => tool.clone(),
            None => {
                return Invocation::Business(format!(
                    "tool '{}' is not available in this run",
                    call.tool_name
                ))
            }
        };

        let mut ctx = ToolContext::new(self.run_id, &call.call_id, self.cancel.clone());
        if let Some((_, _, env)) = &item.resume {
            ctx = ctx.with_resume(env.clone());
        }

        let span = tracing::info_span!("tool.call", tool = %call.tool_name, call_id = %call.call_id);
        let result = tool
            .invoke(&ctx, call.arguments.clone())
            .instrument(span)
            .await;

        match result {
            Ok(value) => Invocation::Success {
                value,
                returns_directly: tool.descriptor().returns_directly,
            },
            Err(ToolError::Interrupted(req)) => Invocation::Interrupt(req),
            Err(ToolError::Failed(message)) => Invocation::Business(message),
            Err(ToolError::Fatal(e)) => Invocation::Fatal(e),
        }
    }

    fn interrupt_context(&self, item: &WorkItem, req: InterruptRequest) -> InterruptContext {
        // A re-interrupting leaf keeps its original id and address so a
        // later resume can still target it.
        let (id, address_path) = match &item.resume {
            Some((id, address, _)) => (id.clone(), address.clone()),
            None => (
                Uuid::new_v4().to_string(),
                vec![
                    AGENT_NAME.to_string(),
                    item.call.tool_name.clone(),
                    item.call.call_id.clone(),
                ],
            ),
        };
        InterruptContext {
            id,
            address_path,
            info: req.info,
            state: req.state,
            is_root_cause: false,
            tool_call: item.call.clone(),
        }
    }

    async fn record_success(&self, conversation: &mut Vec<Message>, call: &ToolCall, value: Value) {
        let content = serde_json::to_string(&value).unwrap_or_else(|_| "{}".into());
        conversation.push(Message::tool_result(&call.call_id, &content));
        self.emit(AgentEvent::ToolCallResult {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            content,
            is_error: false,
        })
        .await;
    }

    async fn record_failure(&self, conversation: &mut Vec<Message>, call: &ToolCall, message: &str) {
        tracing::debug!(tool = %call.tool_name, error = message, "tool returned a business error");
        conversation.push(Message::tool_error(&call.call_id, message));
        self.emit(AgentEvent::ToolCallResult {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            content: message.to_string(),
            is_error: true,
        })
        .await;
    }
}

enum Invocation {
    Success { value: Value, returns_directly: bool },
    Business(String),
    Interrupt(InterruptRequest),
    Fatal(Error),
}

fn plan_to_items(plan: &ResumePlan) -> Vec<WorkItem> {
    let known: HashSet<&String> = plan.interrupts.iter().map(|i| &i.id).collect();
    for target in plan.targets.keys() {
        if !known.contains(target) {
            tracing::warn!(target = %target, "resume target not present in checkpoint, ignoring");
        }
    }

    let mut items: Vec<WorkItem> = plan
        .interrupts
        .iter()
        .map(|ictx| WorkItem {
            call: ictx.tool_call.clone(),
            resume: Some((
                ictx.id.clone(),
                ictx.address_path.clone(),
                ResumeEnv {
                    saved_state: ictx.state.clone(),
                    is_target: plan.targets.contains_key(&ictx.id),
                    user_data: plan.targets.get(&ictx.id).cloned(),
                },
            )),
        })
        .collect();
    items.extend(plan.pending.iter().map(|call| WorkItem {
        call: call.clone(),
        resume: None,
    }));
    items
}
