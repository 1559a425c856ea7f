//! Switchboard engine interface
//!
//! The router talks to one text generation engine through the [`Engine`]
//! trait. Four kinds of engines exist; the kind is chosen once at startup and
//! the instance is shared behind an `Arc` for the lifetime of the process.
//! Everything that crosses the engine boundary lives here: the generation
//! parameters (which double as the batching identity), whole-batch results
//! and the incremental token types used for streaming.

pub mod mock;
mod streamer;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
pub use streamer::{token_channel, NotReady, StreamerSink, TokenStreamer};
use thiserror::Error;

/// The closed set of engine variants the router can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    /// Multi-GPU sharded engine; synchronous batch generation with a
    /// pollable token streamer.
    Sharded,
    /// Engine with its own internal continuous batching; everything is
    /// asynchronous and the router never queues locally.
    ContinuousBatch,
    /// Plain single-process model runner.
    SingleProcess,
    /// Single-process variant that also accepts image inputs.
    Multimodal,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sharded => "sharded",
            EngineKind::ContinuousBatch => "continuous-batch",
            EngineKind::SingleProcess => "single-process",
            EngineKind::Multimodal => "multimodal",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sharded" => Ok(EngineKind::Sharded),
            "continuous-batch" => Ok(EngineKind::ContinuousBatch),
            "single-process" => Ok(EngineKind::SingleProcess),
            "multimodal" => Ok(EngineKind::Multimodal),
            _ => Err(format!(
                "unknown engine kind `{s}`, expected one of: sharded, continuous-batch, single-process, multimodal"
            )),
        }
    }
}

/// Generation parameters attached to a request's `config` object.
///
/// Two requests may share one engine call only when their parameters are
/// identical, so this type is also the grouping key of the dynamic batcher.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParameters {
    #[serde(default)]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub ignore_eos_token: bool,
}

impl std::hash::Hash for GenerationParameters {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.max_new_tokens.hash(state);

        // Hash the raw bits of the floats, acknowledging that this can
        // cause issues with different representations of the same value.
        self.temperature.map(f32::to_bits).hash(state);
        self.top_p.map(f32::to_bits).hash(state);
        self.top_k.hash(state);
        self.do_sample.hash(state);
        self.repetition_penalty.map(f32::to_bits).hash(state);
        self.stop.hash(state);
        self.ignore_eos_token.hash(state);
    }
}

impl PartialEq for GenerationParameters {
    fn eq(&self, other: &Self) -> bool {
        self.max_new_tokens == other.max_new_tokens
            && self.temperature == other.temperature // direct comparison of f32
            && self.top_p == other.top_p
            && self.top_k == other.top_k
            && self.do_sample == other.do_sample
            && self.repetition_penalty == other.repetition_penalty
            && self.stop == other.stop
            && self.ignore_eos_token == other.ignore_eos_token
    }
}

impl Eq for GenerationParameters {}

/// One finished generation for one prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub input_length: u32,
    pub generate_length: u32,
}

/// One incremental unit of generated text.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamToken {
    pub text: String,
    /// Prompt token count, if the engine already knows it. Engines that only
    /// resolve the count after the first forward pass leave this empty and
    /// expose it through [`Engine::input_length`] instead.
    pub input_length: Option<u32>,
    /// Marks the last token of the stream.
    pub finished: bool,
}

/// An asynchronous token source, produced by continuous batching engines.
pub type TokenStream = BoxStream<'static, Result<StreamToken>>;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("engine generation failed: {0}")]
    Generation(String),
    #[error("`{}` engine does not support asynchronous token streaming", .0.as_str())]
    AsyncStreamingUnsupported(EngineKind),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Uniform capability set of a text generation engine.
///
/// `generate` covers whole-batch calls and must preserve prompt order in its
/// results. Synchronous kinds stream by filling a [`StreamerSink`] from a
/// blocking context; the continuous batching kind returns a [`TokenStream`]
/// directly.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Generate completions for a batch of prompts, one result per prompt,
    /// in prompt order.
    async fn generate(
        &self,
        prompts: Vec<String>,
        params: &GenerationParameters,
    ) -> Result<Vec<GenerationResult>>;

    /// Obtain a fresh sink/streamer pair for one streaming call.
    fn get_streamer(&self) -> (StreamerSink, TokenStreamer) {
        token_channel(streamer::DEFAULT_CAPACITY)
    }

    /// Generate for one prompt, pushing tokens into `sink` as they are
    /// produced. Blocking; run it on a dedicated thread.
    fn streaming_generate(
        &self,
        prompt: String,
        sink: StreamerSink,
        params: &GenerationParameters,
    ) -> Result<()>;

    /// Streaming through the engine's own asynchronous machinery.
    /// Only continuous batching engines implement this.
    async fn streaming_generate_async(
        &self,
        _prompt: String,
        _params: &GenerationParameters,
    ) -> Result<TokenStream> {
        Err(EngineError::AsyncStreamingUnsupported(self.kind()))
    }

    /// Prompt token count of the most recent generation, once known.
    fn input_length(&self) -> Option<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(params: &GenerationParameters) -> u64 {
        let mut hasher = DefaultHasher::new();
        params.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_parameters_structural_identity() {
        let a = GenerationParameters {
            temperature: Some(0.7),
            max_new_tokens: Some(32),
            ..Default::default()
        };
        let b = GenerationParameters {
            temperature: Some(0.7),
            max_new_tokens: Some(32),
            ..Default::default()
        };
        let c = GenerationParameters {
            temperature: Some(0.8),
            max_new_tokens: Some(32),
            ..Default::default()
        };

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_engine_kind_round_trip() {
        for kind in [
            EngineKind::Sharded,
            EngineKind::ContinuousBatch,
            EngineKind::SingleProcess,
            EngineKind::Multimodal,
        ] {
            assert_eq!(kind.as_str().parse::<EngineKind>(), Ok(kind));
        }
        assert!("vllm".parse::<EngineKind>().is_err());
    }
}
