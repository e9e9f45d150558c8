//! Scripted model fakes for runtime tests.
//!
//! [`ScriptedModel`] plays back a fixed sequence of turns;
//! [`FlakyModel`] fails transiently a configured number of times before
//! delegating, for exercising the retry policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use lum_domain::chat::ToolCall;
use lum_domain::stream::{BoxStream, StreamEvent, Usage};
use lum_domain::{Error, Result};

use crate::{ChatModel, ChatRequest, ChatResponse};

/// One scripted model turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ScriptedTurn {
    /// A plain final-answer turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// A turn that invokes a single tool.
    pub fn tool_call(call_id: &str, tool_name: &str, arguments: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments,
            }],
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_tool_call(
        mut self,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Self {
        self.tool_calls.push(ToolCall {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        });
        self
    }
}

enum Script {
    Queue(Mutex<VecDeque<ScriptedTurn>>),
    /// The same turn forever (for iteration-cap tests).
    Repeat(ScriptedTurn),
}

/// A [`ChatModel`] that plays back scripted turns. When the queue runs
/// dry it answers with an empty final turn so loops terminate.
pub struct ScriptedModel {
    script: Script,
    calls: AtomicU32,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(turns.into())),
            calls: AtomicU32::new(0),
        }
    }

    /// Always answer with a clone of `turn`.
    pub fn repeating(turn: ScriptedTurn) -> Self {
        Self {
            script: Script::Repeat(turn),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of model calls made so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> ScriptedTurn {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Queue(q) => q.lock().pop_front().unwrap_or_default(),
            Script::Repeat(turn) => turn.clone(),
        }
    }
}

fn turn_usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    async fn generate(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        let turn = self.next_turn();
        Ok(ChatResponse {
            content: turn.text,
            reasoning: turn.reasoning,
            tool_calls: turn.tool_calls,
            usage: Some(turn_usage()),
            finish_reason: Some("stop".into()),
        })
    }

    async fn generate_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let turn = self.next_turn();
        let mut events: Vec<Result<StreamEvent>> = Vec::new();

        if let Some(reasoning) = turn.reasoning {
            events.push(Ok(StreamEvent::Reasoning { text: reasoning }));
        }
        // Split the text so consumers exercise the delta path.
        if !turn.text.is_empty() {
            let mid = turn.text.len() / 2;
            let mut split = mid;
            while !turn.text.is_char_boundary(split) && split > 0 {
                split -= 1;
            }
            let (a, b) = turn.text.split_at(split);
            if !a.is_empty() {
                events.push(Ok(StreamEvent::Token { text: a.into() }));
            }
            if !b.is_empty() {
                events.push(Ok(StreamEvent::Token { text: b.into() }));
            }
        }
        for tc in turn.tool_calls {
            events.push(Ok(StreamEvent::ToolCallFinished {
                call_id: tc.call_id,
                tool_name: tc.tool_name,
                arguments: tc.arguments,
            }));
        }
        events.push(Ok(StreamEvent::Done {
            usage: Some(turn_usage()),
            finish_reason: Some("stop".into()),
        }));

        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Fails with a transient error `failures` times, then delegates.
pub struct FlakyModel {
    inner: Arc<ScriptedModel>,
    failures: AtomicU32,
}

impl FlakyModel {
    pub fn new(inner: Arc<ScriptedModel>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    fn try_take_failure(&self) -> Option<Error> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            Some(Error::Model {
                model: "scripted".into(),
                message: "simulated transient failure".into(),
            })
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for FlakyModel {
    async fn generate(&self, req: &ChatRequest) -> Result<ChatResponse> {
        if let Some(e) = self.try_take_failure() {
            return Err(e);
        }
        self.inner.generate(req).await
    }

    async fn generate_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        if let Some(e) = self.try_take_failure() {
            return Err(e);
        }
        self.inner.generate_stream(req).await
    }

    fn model_id(&self) -> &str {
        "scripted-flaky"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_stream_plays_back_turn() {
        let model = ScriptedModel::new(vec![
            ScriptedTurn::tool_call("c1", "filter_assets", serde_json::json!({"rating": 5}))
        ]);
        let mut stream = model.generate_stream(&ChatRequest::default()).await.unwrap();

        let mut tool_calls = 0;
        let mut done = 0;
        while let Some(ev) = stream.next().await {
            match ev.unwrap() {
                StreamEvent::ToolCallFinished { tool_name, .. } => {
                    assert_eq!(tool_name, "filter_assets");
                    tool_calls += 1;
                }
                StreamEvent::Done { .. } => done += 1,
                _ => {}
            }
        }
        assert_eq!((tool_calls, done), (1, 1));
    }

    #[tokio::test]
    async fn exhausted_queue_yields_empty_final_turn() {
        let model = ScriptedModel::new(vec![]);
        let resp = model.generate(&ChatRequest::default()).await.unwrap();
        assert!(resp.content.is_empty());
        assert!(resp.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn repeating_model_never_runs_dry() {
        let model =
            ScriptedModel::repeating(ScriptedTurn::tool_call("c", "t", serde_json::json!({})));
        for _ in 0..5 {
            let resp = model.generate(&ChatRequest::default()).await.unwrap();
            assert_eq!(resp.tool_calls.len(), 1);
        }
        assert_eq!(model.call_count(), 5);
    }

    #[tokio::test]
    async fn flaky_model_recovers() {
        let inner = Arc::new(ScriptedModel::new(vec![ScriptedTurn::text("hi")]));
        let flaky = FlakyModel::new(inner, 2);

        assert!(flaky.generate(&ChatRequest::default()).await.is_err());
        assert!(flaky.generate(&ChatRequest::default()).await.is_err());
        let resp = flaky.generate(&ChatRequest::default()).await.unwrap();
        assert_eq!(resp.content, "hi");
    }
}
