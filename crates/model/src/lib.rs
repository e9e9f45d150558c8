//! The chat-model seam of the agent runtime.
//!
//! The reasoning loop only ever talks to [`ChatModel`]; the concrete
//! vendor lives behind it. One OpenAI-compatible adapter ships here
//! ([`openai::OpenAiChatModel`]), plus scripted fakes for tests
//! ([`testing`]).

pub mod openai;
pub mod retry;
pub mod testing;

use lum_domain::chat::{Message, ToolCall, ToolDefinition};
use lum_domain::stream::{BoxStream, StreamEvent, Usage};
use lum_domain::Result;

/// A vendor-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A fully-assembled chat completion response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// Trait every model adapter must implement.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn generate(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    ///
    /// The stream always terminates with exactly one
    /// [`StreamEvent::Done`]; tool calls arrive fully assembled as
    /// [`StreamEvent::ToolCallFinished`] before `Done`.
    async fn generate_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Identifier of the underlying model (for logging).
    fn model_id(&self) -> &str;
}
