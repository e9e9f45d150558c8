//! OpenAI-compatible chat adapter.
//!
//! Works against any endpoint that follows the OpenAI chat-completions
//! contract (OpenAI, vLLM, Ollama, LM Studio, Together). Streaming
//! responses are parsed from SSE; tool calls are assembled from deltas
//! and emitted as [`StreamEvent::ToolCallFinished`] once complete.

use std::collections::BTreeMap;

use serde_json::Value;

use lum_domain::chat::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use lum_domain::config::LlmConfig;
use lum_domain::stream::{BoxStream, StreamEvent, Usage};
use lum_domain::{Error, Result};

use crate::{ChatModel, ChatRequest, ChatResponse};

pub struct OpenAiChatModel {
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    /// Build from config. The API key is read once from the environment
    /// variable named in `cfg.api_key_env`.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
            Error::Config(format!(
                "LLM API key env var {} is not set",
                cfg.api_key_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            client,
        })
    }

    fn body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_wire).collect());
        }
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Model {
                model: self.model.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiChatModel {
    async fn generate(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.body(req, false);
        tracing::debug!(model = %self.model, "chat request");
        let resp = self.post(&body).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let v: Value = serde_json::from_str(&text)?;
        parse_response(&self.model, &v)
    }

    async fn generate_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.body(req, true);
        tracing::debug!(model = %self.model, "chat stream request");
        let resp = self.post(&body).await?;

        let stream = async_stream::stream! {
            let mut resp = resp;
            let mut buffer = String::new();
            let mut state = StreamState::default();
            let mut done_emitted = false;

            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for data in drain_sse_data(&mut buffer) {
                            for ev in state.handle_data(&data) {
                                if matches!(ev, StreamEvent::Done { .. }) {
                                    done_emitted = true;
                                }
                                yield Ok(ev);
                            }
                        }
                    }
                    Ok(None) => {
                        // Body closed; flush any trailing partial event.
                        if !buffer.trim().is_empty() {
                            buffer.push_str("\n\n");
                            for data in drain_sse_data(&mut buffer) {
                                for ev in state.handle_data(&data) {
                                    if matches!(ev, StreamEvent::Done { .. }) {
                                        done_emitted = true;
                                    }
                                    yield Ok(ev);
                                }
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(Error::Http(e.to_string()));
                        break;
                    }
                }
            }

            if !done_emitted {
                for ev in state.finish(None) {
                    yield Ok(ev);
                }
                yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Assistant => assistant_to_wire(msg),
        Role::Tool => tool_result_to_wire(msg),
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": msg.content.all_text(),
        }),
    }
}

fn assistant_to_wire(msg: &Message) -> Value {
    let text = msg.content.all_text();
    let calls = msg.content.tool_calls();

    let mut obj = serde_json::json!({"role": "assistant"});
    obj["content"] = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !calls.is_empty() {
        obj["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {
                            "name": tc.tool_name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    obj
}

fn tool_result_to_wire(msg: &Message) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.all_text(),
    })
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_response(model: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Model {
            model: model.into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Model {
        model: model.into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let reasoning = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .map(String::from);

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let call_id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let tool_name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
                    Some(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        reasoning,
        tool_calls,
        usage: body.get("usage").and_then(parse_usage),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull complete `data:` payloads out of an SSE buffer.
///
/// Events are delimited by `\n\n`; consumed bytes are drained in place,
/// a trailing partial event stays for the next chunk.
fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    out.push(data.to_string());
                }
            }
        }
    }
    out
}

/// Assembles tool calls across chunks; index → (id, name, argument buf).
#[derive(Default)]
struct StreamState {
    calls: BTreeMap<u64, (String, String, String)>,
}

impl StreamState {
    fn handle_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if data == "[DONE]" {
            let mut out = self.finish(None);
            out.push(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
            return out;
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable stream chunk, skipping");
                return Vec::new();
            }
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        let choice = match choice {
            Some(c) => c,
            None => {
                // Usage-only chunk (stream_options.include_usage).
                if let Some(usage) = v.get("usage").and_then(parse_usage) {
                    let mut out = self.finish(None);
                    out.push(StreamEvent::Done {
                        usage: Some(usage),
                        finish_reason: None,
                    });
                    return out;
                }
                return Vec::new();
            }
        };

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            let usage = v.get("usage").and_then(parse_usage);
            let mut out = self.finish(Some(fr));
            out.push(StreamEvent::Done {
                usage,
                finish_reason: Some(fr.to_string()),
            });
            return out;
        }

        let delta = match choice.get("delta") {
            Some(d) => d,
            None => return Vec::new(),
        };

        if let Some(arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in arr {
                let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let entry = self.calls.entry(idx).or_default();
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    entry.0 = id.to_string();
                }
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                {
                    entry.1 = name.to_string();
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    entry.2.push_str(args);
                }
            }
            return Vec::new();
        }

        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return vec![StreamEvent::Reasoning {
                    text: text.to_string(),
                }];
            }
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return vec![StreamEvent::Token {
                    text: text.to_string(),
                }];
            }
        }

        Vec::new()
    }

    /// Flush assembled tool calls as `ToolCallFinished` events.
    fn finish(&mut self, _finish_reason: Option<&str>) -> Vec<StreamEvent> {
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .filter(|(id, name, _)| !id.is_empty() && !name.is_empty())
            .map(|(id, name, args)| {
                let arguments = if args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&args).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %id,
                            tool = %name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                StreamEvent::ToolCallFinished {
                    call_id: id,
                    tool_name: name,
                    arguments,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_complete_and_partial_events() {
        let mut buf = String::from("data: one\n\nevent: x\ndata: two\n\ndata: par");
        assert_eq!(drain_sse_data(&mut buf), vec!["one", "two"]);
        assert_eq!(buf, "data: par");
        buf.push_str("tial\n\n");
        assert_eq!(drain_sse_data(&mut buf), vec!["partial"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_state_assembles_tool_call_from_deltas() {
        let mut state = StreamState::default();

        let started = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"filter_assets","arguments":""}}]}}]}"#;
        assert!(state.handle_data(started).is_empty());

        let d1 = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"type\":"}}]}}]}"#;
        let d2 = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"PHOTO\"}"}}]}}]}"#;
        assert!(state.handle_data(d1).is_empty());
        assert!(state.handle_data(d2).is_empty());

        let finish = r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#;
        let events = state.handle_data(finish);
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(tool_name, "filter_assets");
                assert_eq!(arguments, &serde_json::json!({"type": "PHOTO"}));
            }
            other => panic!("expected ToolCallFinished, got {other:?}"),
        }
        assert!(matches!(events[1], StreamEvent::Done { .. }));
    }

    #[test]
    fn stream_state_text_tokens() {
        let mut state = StreamState::default();
        let chunk = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        let events = state.handle_data(chunk);
        assert!(matches!(&events[0], StreamEvent::Token { text } if text == "Hel"));
    }

    #[test]
    fn stream_state_done_sentinel() {
        let mut state = StreamState::default();
        let events = state.handle_data("[DONE]");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Done { .. }));
    }

    #[test]
    fn stream_state_usage_only_chunk() {
        let mut state = StreamState::default();
        let chunk = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let events = state.handle_data(chunk);
        match &events[0] {
            StreamEvent::Done { usage: Some(u), .. } => assert_eq!(u.total_tokens, 15),
            other => panic!("expected Done with usage, got {other:?}"),
        }
    }

    #[test]
    fn stream_state_malformed_arguments_default_to_empty_object() {
        let mut state = StreamState::default();
        let started = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"t","arguments":"{not json"}}]}}]}"#;
        state.handle_data(started);
        let events = state.handle_data("[DONE]");
        match &events[0] {
            StreamEvent::ToolCallFinished { arguments, .. } => {
                assert_eq!(arguments, &Value::Object(Default::default()));
            }
            other => panic!("expected ToolCallFinished, got {other:?}"),
        }
    }

    #[test]
    fn assistant_wire_includes_tool_calls() {
        let msg = Message::assistant_with_tool_calls(
            "",
            &[ToolCall {
                call_id: "c1".into(),
                tool_name: "bulk_like_assets".into(),
                arguments: serde_json::json!({"ref_id": "ref_x"}),
            }],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "bulk_like_assets");
    }

    #[test]
    fn tool_result_wire_carries_call_id() {
        let msg = Message::tool_result("c9", "{\"message\":\"ok\"}");
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c9");
    }

    #[test]
    fn parse_full_response_with_tool_calls() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "filter_assets", "arguments": "{\"rating\":5}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        });
        let resp = parse_response("gpt-4o", &body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments, serde_json::json!({"rating": 5}));
        assert_eq!(resp.usage.unwrap().total_tokens, 120);
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
    }
}
