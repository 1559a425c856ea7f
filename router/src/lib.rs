//! Switchboard webserver
mod batcher;
mod infer;
mod prompt;
pub mod server;
mod stream;
mod validation;

pub use prompt::ChatTemplate;
use serde::{Deserialize, Serialize};
use switchboard_backend::{GenerationParameters, GenerationResult};
use utoipa::ToSchema;

/// Served endpoint info
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Info {
    #[schema(example = "single-process")]
    pub engine: &'static str,
    #[schema(example = "128")]
    pub max_concurrent_requests: usize,
    #[schema(example = "4")]
    pub max_batch_size: usize,
    #[schema(example = "10")]
    pub max_batch_delay_ms: u64,
    #[schema(example = false)]
    pub chat_template: bool,
    #[schema(example = "0.1.0")]
    pub version: &'static str,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub(crate) struct GenerateRequest {
    /// One prompt, a list of prompts, or a list of chat turns.
    #[serde(default)]
    #[schema(value_type = Object, example = "My name is Olivier and I")]
    pub text: TextInput,
    #[serde(default)]
    #[schema(default = "false")]
    pub stream: bool,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: GenerationParameters,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TextInput {
    Single(String),
    Sequence(Vec<TextPart>),
}

impl Default for TextInput {
    fn default() -> Self {
        TextInput::Single(String::new())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TextPart {
    Prompt(String),
    ChatTurn(ChatMessage),
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub(crate) struct ChatMessage {
    #[schema(example = "user")]
    pub role: String,
    #[schema(example = "What is batching?")]
    pub content: String,
}

/// The uniform response unit of both the plain and the streaming path.
/// Streaming emits one envelope per token.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub(crate) struct ResponseEnvelope {
    #[schema(example = "test")]
    pub generated_text: String,
    #[schema(example = 4)]
    pub num_input_tokens: u32,
    #[schema(example = 16)]
    pub num_generated_tokens: u32,
    /// Tracked for API compatibility; preprocessing is not timed separately.
    #[schema(example = 0.0)]
    pub preprocessing_time: f64,
}

impl ResponseEnvelope {
    pub(crate) fn from_result(result: GenerationResult) -> Self {
        Self {
            generated_text: result.text,
            num_input_tokens: result.input_length,
            num_generated_tokens: result.generate_length,
            preprocessing_time: 0.0,
        }
    }

    pub(crate) fn from_token(text: String, input_length: u32) -> Self {
        Self {
            generated_text: text,
            num_input_tokens: input_length,
            num_generated_tokens: 1,
            preprocessing_time: 0.0,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub error_type: String,
}
