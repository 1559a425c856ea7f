//! Deterministic in-process engine used by tests and local development.
//!
//! Real engines live in their own processes and are wired in through the
//! [`Engine`] trait; this one echoes its prompts so the dispatch, batching
//! and streaming paths can be exercised without a model.

use crate::{
    Engine, EngineError, EngineKind, GenerationParameters, GenerationResult, Result, StreamToken,
    StreamerSink, TokenStream,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Prompts containing this marker make the whole batch call fail.
pub const FAIL_MARKER: &str = "<fail>";

pub struct MockEngine {
    kind: EngineKind,
    /// Every batch call, in call order, with its prompts in submission order.
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    /// Prompt token count of the most recent generation; 0 while unknown.
    last_input_length: AtomicU32,
    /// Whether stream tokens carry the prompt length themselves or leave it
    /// to be re-queried through `input_length`.
    report_length_in_stream: bool,
    /// Artificial gap between streamed tokens.
    stream_delay: Option<Duration>,
}

impl MockEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            calls: Arc::new(Mutex::new(Vec::new())),
            last_input_length: AtomicU32::new(0),
            report_length_in_stream: true,
            stream_delay: None,
        }
    }

    /// Make stream tokens omit their prompt length, forcing the consumer to
    /// resolve it through [`Engine::input_length`].
    pub fn without_stream_length(mut self) -> Self {
        self.report_length_in_stream = false;
        self
    }

    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = Some(delay);
        self
    }

    /// Batch calls observed so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("mock call log poisoned").clone()
    }

    fn record_call(&self, prompts: &[String]) {
        self.calls
            .lock()
            .expect("mock call log poisoned")
            .push(prompts.to_vec());
    }

    fn completion(prompt: &str) -> String {
        format!("{prompt} and so on")
    }

    fn prompt_length(prompt: &str) -> u32 {
        prompt.split_whitespace().count().max(1) as u32
    }

    fn tokens_for(&self, prompt: &str) -> Vec<StreamToken> {
        let completion = Self::completion(prompt);
        let input_length = self
            .report_length_in_stream
            .then(|| Self::prompt_length(prompt));
        let chunks: Vec<&str> = completion.split_inclusive(' ').collect();
        let last = chunks.len().saturating_sub(1);
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| StreamToken {
                text: chunk.to_string(),
                input_length,
                finished: i == last,
            })
            .collect()
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn generate(
        &self,
        prompts: Vec<String>,
        _params: &GenerationParameters,
    ) -> Result<Vec<GenerationResult>> {
        self.record_call(&prompts);
        if let Some(prompt) = prompts.iter().find(|prompt| prompt.contains(FAIL_MARKER)) {
            return Err(EngineError::Generation(format!(
                "injected failure for prompt {prompt:?}"
            )));
        }
        Ok(prompts
            .iter()
            .map(|prompt| {
                let text = Self::completion(prompt);
                GenerationResult {
                    input_length: Self::prompt_length(prompt),
                    generate_length: text.split_whitespace().count() as u32,
                    text,
                }
            })
            .collect())
    }

    fn streaming_generate(
        &self,
        prompt: String,
        sink: StreamerSink,
        _params: &GenerationParameters,
    ) -> Result<()> {
        if prompt.contains(FAIL_MARKER) {
            return Err(EngineError::Generation(format!(
                "injected failure for prompt {prompt:?}"
            )));
        }
        self.last_input_length
            .store(Self::prompt_length(&prompt), Ordering::SeqCst);
        for token in self.tokens_for(&prompt) {
            if let Some(delay) = self.stream_delay {
                std::thread::sleep(delay);
            }
            if !sink.put(token) {
                // Consumer went away; stop producing.
                break;
            }
        }
        sink.finish();
        Ok(())
    }

    async fn streaming_generate_async(
        &self,
        prompt: String,
        _params: &GenerationParameters,
    ) -> Result<TokenStream> {
        if self.kind != EngineKind::ContinuousBatch {
            return Err(EngineError::AsyncStreamingUnsupported(self.kind));
        }
        if prompt.contains(FAIL_MARKER) {
            return Err(EngineError::Generation(format!(
                "injected failure for prompt {prompt:?}"
            )));
        }
        self.last_input_length
            .store(Self::prompt_length(&prompt), Ordering::SeqCst);
        let tokens = self.tokens_for(&prompt);
        Ok(stream::iter(tokens.into_iter().map(Ok)).boxed())
    }

    fn input_length(&self) -> Option<u32> {
        match self.last_input_length.load(Ordering::SeqCst) {
            0 => None,
            length => Some(length),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_preserves_prompt_order() {
        let engine = MockEngine::new(EngineKind::SingleProcess);
        let results = engine
            .generate(
                vec!["first prompt".to_string(), "second".to_string()],
                &GenerationParameters::default(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].text.starts_with("first prompt"));
        assert!(results[1].text.starts_with("second"));
        assert_eq!(results[0].input_length, 2);
        assert_eq!(results[1].input_length, 1);
    }

    #[tokio::test]
    async fn test_stream_concatenation_matches_generate() {
        let engine = MockEngine::new(EngineKind::SingleProcess);
        let params = GenerationParameters::default();

        let whole = engine
            .generate(vec!["hello there".to_string()], &params)
            .await
            .unwrap()
            .remove(0)
            .text;

        let (sink, mut streamer) = engine.get_streamer();
        engine
            .streaming_generate("hello there".to_string(), sink, &params)
            .unwrap();

        let mut streamed = String::new();
        while let Some(token) = streamer.next().await {
            streamed.push_str(&token.text);
        }
        assert_eq!(streamed, whole);
    }
}
