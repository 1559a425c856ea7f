/// Batching and inference logic
use crate::batcher::Batcher;
use crate::prompt::NormalizedPrompt;
use crate::stream;
use crate::validation::{ValidRequest, Validation, ValidationError};
use crate::{GenerateRequest, ResponseEnvelope};
use futures::future::try_join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use switchboard_backend::{Engine, EngineError, EngineKind};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::instrument;

/// How a validated request reaches the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BatchStrategy {
    /// The engine batches internally; hand requests over one by one
    Continuous,
    /// One caller supplied several prompts; run them as a single batch
    Static,
    /// Single prompt; let the window accumulator group it with its peers
    Dynamic,
}

pub(crate) fn select_strategy(kind: EngineKind, prompt: &NormalizedPrompt) -> BatchStrategy {
    if kind == EngineKind::ContinuousBatch {
        BatchStrategy::Continuous
    } else if prompt.len() > 1 {
        BatchStrategy::Static
    } else {
        BatchStrategy::Dynamic
    }
}

/// Inference struct
#[derive(Clone)]
pub(crate) struct Infer {
    engine: Arc<dyn Engine>,
    validation: Validation,
    batcher: Batcher,
    /// Request limit
    limit_concurrent_requests: Arc<Semaphore>,
}

pub(crate) struct InferResponse {
    pub envelopes: Vec<ResponseEnvelope>,
    /// True when the request carried one prompt and the response should be
    /// a bare object rather than an array
    pub single_input: bool,
}

impl Infer {
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        validation: Validation,
        max_batch_size: usize,
        max_batch_delay: Duration,
        max_concurrent_requests: usize,
    ) -> Self {
        let batcher = Batcher::new(engine.clone(), max_batch_size, max_batch_delay);
        let semaphore = Arc::new(Semaphore::new(max_concurrent_requests));

        Self {
            engine,
            validation,
            batcher,
            limit_concurrent_requests: semaphore,
        }
    }

    /// Run a non-streaming request to completion.
    #[instrument(skip_all)]
    pub(crate) async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<InferResponse, InferError> {
        let _permit = self
            .limit_concurrent_requests
            .clone()
            .try_acquire_owned()
            .map_err(|err| {
                metrics::increment_counter!("switchboard_request_failure", "err" => "overloaded");
                tracing::error!("{err}");
                err
            })?;

        let valid = self.validate(request)?;
        let strategy = select_strategy(self.engine.kind(), &valid.prompt);
        let single_input = !valid.input_was_sequence;
        let parameters = valid.parameters;

        let results = match strategy {
            BatchStrategy::Continuous | BatchStrategy::Static => {
                let prompts = valid.prompt.into_prompts();
                let expected = prompts.len();
                metrics::increment_counter!("switchboard_batch_inference_count", "strategy" => strategy_label(strategy));
                let results = self.engine.generate(prompts, &parameters).await?;
                if results.len() != expected {
                    metrics::increment_counter!("switchboard_request_failure", "err" => "incomplete");
                    tracing::error!("Engine returned {} results for {expected} prompts", results.len());
                    return Err(InferError::IncompleteGeneration);
                }
                results
            }
            BatchStrategy::Dynamic => {
                let submissions = valid
                    .prompt
                    .into_prompts()
                    .into_iter()
                    .map(|prompt| self.batcher.submit(prompt, parameters.clone()));
                try_join_all(submissions).await?
            }
        };

        Ok(InferResponse {
            envelopes: results
                .into_iter()
                .map(ResponseEnvelope::from_result)
                .collect(),
            single_input,
        })
    }

    /// Start a streaming request.
    ///
    /// The permit is returned alongside the stream so the concurrency slot
    /// stays held until the caller drops the response body.
    #[instrument(skip_all)]
    pub(crate) async fn generate_stream(
        &self,
        request: GenerateRequest,
    ) -> Result<
        (
            OwnedSemaphorePermit,
            BoxStream<'static, Result<ResponseEnvelope, InferError>>,
        ),
        InferError,
    > {
        let permit = self
            .limit_concurrent_requests
            .clone()
            .try_acquire_owned()
            .map_err(|err| {
                metrics::increment_counter!("switchboard_request_failure", "err" => "overloaded");
                tracing::error!("{err}");
                err
            })?;

        let valid = self.validate(request)?;
        let parameters = valid.parameters;
        // Validation already rejected multi-prompt streams
        let prompt = valid
            .prompt
            .into_single()
            .ok_or(InferError::IncompleteGeneration)?;

        let tokens: BoxStream<'static, _> =
            if self.engine.kind() == EngineKind::ContinuousBatch {
                let native = self
                    .engine
                    .streaming_generate_async(prompt, &parameters)
                    .await?;
                stream::forward_async(native).boxed()
            } else {
                let (sink, streamer) = self.engine.get_streamer();
                let engine = self.engine.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(err) = engine.streaming_generate(prompt, sink, &parameters) {
                        tracing::error!("{err}");
                    }
                });
                stream::consume_streamer(streamer).boxed()
            };

        let envelopes = stream::envelope_stream(tokens, self.engine.clone()).boxed();
        Ok((permit, envelopes))
    }

    fn validate(&self, request: GenerateRequest) -> Result<ValidRequest, InferError> {
        self.validation.validate(request).map_err(|err| {
            metrics::increment_counter!("switchboard_request_failure", "err" => "validation");
            tracing::error!("{err}");
            InferError::from(err)
        })
    }
}

fn strategy_label(strategy: BatchStrategy) -> &'static str {
    match strategy {
        BatchStrategy::Continuous => "continuous",
        BatchStrategy::Static => "static",
        BatchStrategy::Dynamic => "dynamic",
    }
}

#[derive(Debug, Error)]
pub enum InferError {
    #[error("Request failed during generation: {0}")]
    GenerationError(String),
    #[error("Model is overloaded")]
    Overloaded(#[from] TryAcquireError),
    #[error("Input validation error: {0}")]
    ValidationError(#[from] ValidationError),
    #[error("Incomplete generation")]
    IncompleteGeneration,
}

impl From<EngineError> for InferError {
    fn from(err: EngineError) -> Self {
        InferError::GenerationError(err.to_string())
    }
}

impl InferError {
    pub(crate) fn error_type(&self) -> &str {
        match self {
            InferError::GenerationError(_) => "generation",
            InferError::Overloaded(_) => "overloaded",
            InferError::ValidationError(_) => "validation",
            InferError::IncompleteGeneration => "incomplete_generation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptNormalizer;
    use crate::{TextInput, TextPart};
    use switchboard_backend::mock::MockEngine;
    use switchboard_backend::GenerationParameters;

    fn infer_with_mock(kind: EngineKind) -> (Infer, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new(kind));
        let validation = Validation::new(PromptNormalizer::new(None), kind);
        let infer = Infer::new(
            engine.clone(),
            validation,
            4,
            Duration::from_millis(10),
            16,
        );
        (infer, engine)
    }

    fn request(text: TextInput, stream: bool) -> GenerateRequest {
        GenerateRequest {
            text,
            stream,
            config: GenerationParameters::default(),
        }
    }

    #[test]
    fn test_select_strategy() {
        let single = NormalizedPrompt::Single("hi".to_string());
        let pair = NormalizedPrompt::Sequence(vec!["a".to_string(), "b".to_string()]);
        let one = NormalizedPrompt::Sequence(vec!["a".to_string()]);

        assert_eq!(
            select_strategy(EngineKind::ContinuousBatch, &pair),
            BatchStrategy::Continuous
        );
        assert_eq!(
            select_strategy(EngineKind::SingleProcess, &pair),
            BatchStrategy::Static
        );
        assert_eq!(
            select_strategy(EngineKind::SingleProcess, &single),
            BatchStrategy::Dynamic
        );
        assert_eq!(
            select_strategy(EngineKind::Sharded, &one),
            BatchStrategy::Dynamic
        );
    }

    #[tokio::test]
    async fn test_single_prompt_generation() {
        let (infer, _engine) = infer_with_mock(EngineKind::SingleProcess);

        let response = infer
            .generate(request(TextInput::Single("Hello".to_string()), false))
            .await
            .unwrap();

        assert!(response.single_input);
        assert_eq!(response.envelopes.len(), 1);
        assert!(!response.envelopes[0].generated_text.is_empty());
        assert!(response.envelopes[0].num_input_tokens > 0);
    }

    #[tokio::test]
    async fn test_multi_prompt_generation_preserves_order() {
        let (infer, engine) = infer_with_mock(EngineKind::SingleProcess);

        let text = TextInput::Sequence(vec![
            TextPart::Prompt("first".to_string()),
            TextPart::Prompt("second".to_string()),
        ]);
        let response = infer.generate(request(text, false)).await.unwrap();

        assert!(!response.single_input);
        assert_eq!(response.envelopes[0].generated_text, "first and so on");
        assert_eq!(response.envelopes[1].generated_text, "second and so on");

        // A multi-prompt request goes to the engine as one static batch
        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_concat_matches_generation() {
        let (infer, _engine) = infer_with_mock(EngineKind::SingleProcess);

        let (_permit, stream) = infer
            .generate_stream(request(TextInput::Single("Hello there".to_string()), true))
            .await
            .unwrap();
        let streamed: String = stream
            .map(|envelope| envelope.unwrap().generated_text)
            .collect()
            .await;

        let (infer, _engine) = infer_with_mock(EngineKind::SingleProcess);
        let full = infer
            .generate(request(TextInput::Single("Hello there".to_string()), false))
            .await
            .unwrap();

        assert_eq!(streamed, full.envelopes[0].generated_text);
    }

    #[tokio::test]
    async fn test_streaming_multiple_prompts_is_rejected() {
        let (infer, _engine) = infer_with_mock(EngineKind::SingleProcess);

        let text = TextInput::Sequence(vec![
            TextPart::Prompt("a".to_string()),
            TextPart::Prompt("b".to_string()),
        ]);
        let result = infer.generate_stream(request(text, true)).await;
        assert!(matches!(result, Err(InferError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_continuous_engine_streams_natively() {
        let (infer, _engine) = infer_with_mock(EngineKind::ContinuousBatch);

        let (_permit, stream) = infer
            .generate_stream(request(TextInput::Single("Hello".to_string()), true))
            .await
            .unwrap();
        let streamed: String = stream
            .map(|envelope| envelope.unwrap().generated_text)
            .collect()
            .await;

        assert_eq!(streamed, "Hello and so on");
    }
}
