//! Chat endpoints — marshal agent runs onto Server-Sent Events.
//!
//! Stream shape: one `session_info` first, then interleaved `message`
//! (assistant output and tool actions), `ui_event` (side-channel
//! passthrough), and `heartbeat` every 30s, terminated by `done`,
//! `error`, or an `action{interrupted}` describing how to resume.
//!
//! Guardrails: raw tool-role output is never forwarded as user text —
//! only assistant messages with non-empty content become `message`
//! events; tool activity reaches the client through the side channel.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OwnedSemaphorePermit;

use lum_agent::runtime::InterruptNotice;
use lum_agent::{AgentEvent, CancelToken, RunHandle, RunInput, AGENT_NAME};

use crate::state::AppState;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Conversation thread; generated when absent. Doubles as the
    /// checkpoint key for interrupts.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub query: String,
    /// Tools to bind for this run. Defaults to every registered tool.
    #[serde(default)]
    pub tool_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub thread_id: String,
    /// interrupt-id → user data consumed by the targeted tool.
    #[serde(default)]
    pub targets: HashMap<String, Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let Some(runtime) = state.runtime.clone() else {
        return error_sse("no_model_configured: set the LLM API key and restart").into_response();
    };

    let thread_id = body
        .thread_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let permit = match state.thread_locks.try_acquire(&thread_id) {
        Ok(p) => p,
        Err(_) => return error_sse("thread is busy — a run is already in progress").into_response(),
    };

    let tool_names = body.tool_names.unwrap_or_else(|| state.registry.names());
    let handle = runtime.start(RunInput {
        checkpoint_id: thread_id.clone(),
        query: body.query,
        tool_names,
    });

    Sse::new(event_stream(thread_id, handle, permit))
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat/resume (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_resume(
    State(state): State<AppState>,
    Json(body): Json<ResumeRequest>,
) -> impl IntoResponse {
    let Some(runtime) = state.runtime.clone() else {
        return error_sse("no_model_configured: set the LLM API key and restart").into_response();
    };

    let permit = match state.thread_locks.try_acquire(&body.thread_id) {
        Ok(p) => p,
        Err(_) => return error_sse("thread is busy — a run is already in progress").into_response(),
    };

    let handle = runtime.resume(body.thread_id.clone(), body.targets);

    Sse::new(event_stream(body.thread_id, handle, permit))
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat/complete (non-streaming)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_complete(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let Some(runtime) = state.runtime.clone() else {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no_model_configured"})),
        )
            .into_response();
    };

    let thread_id = body
        .thread_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let _permit = match state.thread_locks.try_acquire(&thread_id) {
        Ok(p) => p,
        Err(_) => {
            return (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "thread is busy — a run is already in progress"})),
            )
                .into_response();
        }
    };

    let tool_names = body.tool_names.unwrap_or_else(|| state.registry.names());
    let mut handle = runtime.start(RunInput {
        checkpoint_id: thread_id.clone(),
        query: body.query,
        tool_names,
    });

    let mut content = String::new();
    let mut actions = Vec::new();
    let mut interrupted: Option<Value> = None;
    let mut error: Option<String> = None;

    while let Some(event) = handle.events.recv().await {
        match event {
            AgentEvent::AssistantMessage { content: text } => content = text,
            AgentEvent::ToolCallStarted { tool_name, .. } => actions.push(tool_name),
            AgentEvent::Interrupted {
                interrupt_contexts, ..
            } => interrupted = Some(interrupt_payload(&interrupt_contexts)),
            AgentEvent::Error { message, .. } => error = Some(message),
            _ => {}
        }
    }
    let mut ui_events = Vec::new();
    while let Ok(event) = handle.ui_events.try_recv() {
        ui_events.push(serde_json::to_value(&event).unwrap_or(Value::Null));
    }

    Json(json!({
        "thread_id": thread_id,
        "output": content,
        "actions": actions,
        "interrupted": interrupted,
        "error": error,
        "ui_events": ui_events,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sse(event: &str, data: Value) -> Event {
    Event::default().event(event).data(data.to_string())
}

fn error_sse(message: &str) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let data = json!({"error": message}).to_string();
    let stream = futures_util::stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("error").data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn interrupt_payload(contexts: &[InterruptNotice]) -> Value {
    json!({
        "interruptContexts": contexts
            .iter()
            .map(|c| {
                json!({
                    "ID": c.id,
                    "Address": c.address,
                    "Info": c.info,
                    "IsRootCause": c.is_root_cause,
                })
            })
            .collect::<Vec<_>>()
    })
}

/// Map one runtime event to its transport form. `None` means the event
/// stays internal (streaming deltas, raw tool results).
fn map_agent_event(event: &AgentEvent) -> Option<Event> {
    match event {
        AgentEvent::AssistantMessage { content } if !content.is_empty() => Some(sse(
            "message",
            json!({"agent_name": AGENT_NAME, "output": content}),
        )),
        AgentEvent::AssistantMessage { .. } => None,
        AgentEvent::ToolCallStarted { tool_name, .. } => Some(sse(
            "message",
            json!({"agent_name": AGENT_NAME, "action": tool_name}),
        )),
        // Tool output is model food, not user text.
        AgentEvent::ToolCallResult { .. } => None,
        AgentEvent::AssistantDelta { .. } | AgentEvent::ReasoningDelta { .. } => None,
        AgentEvent::Interrupted {
            interrupt_contexts, ..
        } => Some(sse(
            "action",
            json!({"interrupted": interrupt_payload(interrupt_contexts)}),
        )),
        AgentEvent::Error { message, .. } => Some(sse("error", json!({"error": message}))),
        AgentEvent::Done => Some(sse("done", json!({}))),
    }
}

/// Cancels the run when the client goes away mid-stream.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn event_stream(
    thread_id: String,
    handle: RunHandle,
    _permit: OwnedSemaphorePermit,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _cancel_guard = CancelOnDrop(handle.cancel.clone());
        let mut events = handle.events;
        let mut ui_events = handle.ui_events;

        yield Ok(sse("session_info", json!({"thread_id": thread_id})));

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_PERIOD,
            HEARTBEAT_PERIOD,
        );
        let mut events_done = false;
        let mut ui_done = false;

        while !(events_done && ui_done) {
            tokio::select! {
                event = events.recv(), if !events_done => match event {
                    Some(event) => {
                        if let Some(out) = map_agent_event(&event) {
                            yield Ok(out);
                        }
                    }
                    None => events_done = true,
                },
                event = ui_events.recv(), if !ui_done => match event {
                    Some(event) => {
                        let data = serde_json::to_string(&event).unwrap_or_default();
                        yield Ok(Event::default().event("ui_event").data(data));
                    }
                    None => ui_done = true,
                },
                _ = heartbeat.tick() => {
                    yield Ok(sse(
                        "heartbeat",
                        json!({"timestamp": chrono::Utc::now().timestamp_millis()}),
                    ));
                }
            }
        }
        // _permit drops here, releasing the thread lock.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use lum_agent::sidechannel::{side_channel, ExecutionStatus, UiEvent};
    use tokio::sync::mpsc;

    fn notice() -> InterruptNotice {
        InterruptNotice {
            id: "int_1".into(),
            address: vec!["lumilio".into(), "filter_assets".into(), "tc_1".into()],
            info: json!({"count": 42}),
            is_root_cause: true,
        }
    }

    #[test]
    fn final_assistant_message_maps_to_message_event() {
        let out = map_agent_event(&AgentEvent::AssistantMessage {
            content: "hello".into(),
        });
        assert!(out.is_some());
    }

    #[test]
    fn empty_assistant_message_is_suppressed() {
        assert!(map_agent_event(&AgentEvent::AssistantMessage {
            content: String::new(),
        })
        .is_none());
    }

    #[test]
    fn tool_results_never_reach_the_user() {
        assert!(map_agent_event(&AgentEvent::ToolCallResult {
            call_id: "tc".into(),
            tool_name: "filter_assets".into(),
            content: "{\"ref_id\":\"ref_secret\"}".into(),
            is_error: false,
        })
        .is_none());
    }

    #[test]
    fn deltas_stay_internal() {
        assert!(map_agent_event(&AgentEvent::AssistantDelta { text: "he".into() }).is_none());
        assert!(map_agent_event(&AgentEvent::ReasoningDelta { text: "hm".into() }).is_none());
    }

    #[test]
    fn interrupt_payload_field_names() {
        let payload = interrupt_payload(&[notice()]);
        let ctx = &payload["interruptContexts"][0];
        assert_eq!(ctx["ID"], "int_1");
        assert_eq!(ctx["Address"][1], "filter_assets");
        assert_eq!(ctx["Info"]["count"], 42);
        assert_eq!(ctx["IsRootCause"], true);
    }

    #[tokio::test]
    async fn stream_starts_with_session_info_and_ends_after_channels_close() {
        let (agent_tx, agent_rx) = mpsc::channel(8);
        let (dispatcher, ui_rx) = side_channel();
        let handle = RunHandle {
            run_id: uuid::Uuid::new_v4(),
            events: agent_rx,
            ui_events: ui_rx,
            cancel: CancelToken::new(),
        };
        let map = crate::locks::ThreadLockMap::new();
        let permit = map.try_acquire("t1").unwrap();

        dispatcher.dispatch(UiEvent::tool_execution(
            "filter_assets",
            "exec-1",
            ExecutionStatus::Pending,
            "Filtering assets",
        ));
        agent_tx
            .send(AgentEvent::AssistantMessage {
                content: "done deal".into(),
            })
            .await
            .unwrap();
        agent_tx.send(AgentEvent::Done).await.unwrap();
        drop(agent_tx);
        drop(dispatcher);

        let stream = event_stream("t1".into(), handle, permit);
        let events: Vec<_> = stream.collect().await;
        assert!(events.len() >= 3, "session_info + message + done at least");

        // The lock is released once the stream completes.
        assert!(map.try_acquire("t1").is_ok());
    }
}
