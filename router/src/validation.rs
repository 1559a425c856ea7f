/// Payload validation logic
use crate::prompt::{NormalizedPrompt, PromptNormalizer};
use crate::{GenerateRequest, TextInput};
use switchboard_backend::{EngineKind, GenerationParameters};
use thiserror::Error;
use tracing::instrument;

#[derive(Clone)]
pub(crate) struct Validation {
    normalizer: PromptNormalizer,
    engine_kind: EngineKind,
}

/// A request that passed all shape and parameter checks.
#[derive(Debug)]
pub(crate) struct ValidRequest {
    pub prompt: NormalizedPrompt,
    pub parameters: GenerationParameters,
    /// Whether the caller supplied `text` as a sequence; the response shape
    /// mirrors the request shape.
    pub input_was_sequence: bool,
}

impl Validation {
    pub(crate) fn new(normalizer: PromptNormalizer, engine_kind: EngineKind) -> Self {
        Self {
            normalizer,
            engine_kind,
        }
    }

    /// Validate a payload and normalize its prompt.
    ///
    /// Everything here runs before any engine call; failures map to a 400.
    #[instrument(skip_all)]
    pub(crate) fn validate(
        &self,
        request: GenerateRequest,
    ) -> Result<ValidRequest, ValidationError> {
        match &request.text {
            TextInput::Single(prompt) if prompt.is_empty() => {
                return Err(ValidationError::EmptyPrompt)
            }
            TextInput::Sequence(parts) if parts.is_empty() => {
                return Err(ValidationError::EmptyPrompt)
            }
            _ => {}
        }

        validate_parameters(&request.config)?;

        let input_was_sequence = matches!(request.text, TextInput::Sequence(_));

        // Continuous batching engines and formatted chat input always work
        // on prompt sequences.
        let return_as_sequence = self.engine_kind == EngineKind::ContinuousBatch
            || self.normalizer.has_chat_template();
        let prompt = self.normalizer.normalize(request.text, return_as_sequence)?;

        if request.stream && prompt.len() > 1 {
            return Err(ValidationError::StreamingWithMultiplePrompts);
        }

        Ok(ValidRequest {
            prompt,
            parameters: request.config,
            input_was_sequence,
        })
    }
}

fn validate_parameters(params: &GenerationParameters) -> Result<(), ValidationError> {
    if let Some(temperature) = params.temperature {
        if temperature < 0.0 {
            return Err(ValidationError::Temperature);
        }
    }

    if let Some(top_p) = params.top_p {
        if top_p <= 0.0 || top_p > 1.0 {
            return Err(ValidationError::TopP);
        }
    }

    if params.max_new_tokens == Some(0) {
        return Err(ValidationError::MaxNewTokens);
    }

    Ok(())
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Empty prompt is not supported.")]
    EmptyPrompt,
    #[error("Invalid prompt format from the request.")]
    InvalidPromptFormat,
    #[error("Streaming response is not supported when multiple prompts are provided.")]
    StreamingWithMultiplePrompts,
    #[error("chat template failed to render: {0}")]
    ChatTemplate(String),
    #[error("`temperature` must be non-negative")]
    Temperature,
    #[error("`top_p` must be > 0.0 and <= 1.0")]
    TopP,
    #[error("`max_new_tokens` must be strictly positive")]
    MaxNewTokens,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TextPart;

    fn validation(engine_kind: EngineKind) -> Validation {
        Validation::new(PromptNormalizer::new(None), engine_kind)
    }

    fn request(text: TextInput, stream: bool) -> GenerateRequest {
        GenerateRequest {
            text,
            stream,
            config: GenerationParameters::default(),
        }
    }

    #[test]
    fn test_empty_prompt_is_rejected() {
        let validation = validation(EngineKind::SingleProcess);
        match validation.validate(request(TextInput::Single(String::new()), false)) {
            Err(ValidationError::EmptyPrompt) => (),
            other => panic!("expected EmptyPrompt, got {other:?}"),
        }
        match validation.validate(request(TextInput::Sequence(vec![]), false)) {
            Err(ValidationError::EmptyPrompt) => (),
            other => panic!("expected EmptyPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_streaming_with_multiple_prompts_is_rejected() {
        let validation = validation(EngineKind::SingleProcess);
        let text = TextInput::Sequence(vec![
            TextPart::Prompt("p1".to_string()),
            TextPart::Prompt("p2".to_string()),
        ]);
        match validation.validate(request(text, true)) {
            Err(ValidationError::StreamingWithMultiplePrompts) => (),
            other => panic!("expected StreamingWithMultiplePrompts, got {other:?}"),
        }
    }

    #[test]
    fn test_streaming_single_prompt_on_continuous_engine_is_accepted() {
        // Continuous engines normalize a single string into a one-element
        // sequence, which still counts as a single prompt for streaming.
        let validation = validation(EngineKind::ContinuousBatch);
        let valid = validation
            .validate(request(TextInput::Single("hello".to_string()), true))
            .unwrap();
        assert_eq!(valid.prompt.len(), 1);
        assert!(!valid.input_was_sequence);
    }

    #[test]
    fn test_parameter_bounds() {
        let validation = validation(EngineKind::SingleProcess);

        let mut req = request(TextInput::Single("hello".to_string()), false);
        req.config.temperature = Some(-0.1);
        assert!(matches!(
            validation.validate(req),
            Err(ValidationError::Temperature)
        ));

        let mut req = request(TextInput::Single("hello".to_string()), false);
        req.config.top_p = Some(1.5);
        assert!(matches!(validation.validate(req), Err(ValidationError::TopP)));

        let mut req = request(TextInput::Single("hello".to_string()), false);
        req.config.max_new_tokens = Some(0);
        assert!(matches!(
            validation.validate(req),
            Err(ValidationError::MaxNewTokens)
        ));

        let mut req = request(TextInput::Single("hello".to_string()), false);
        req.config.top_p = Some(0.9);
        req.config.max_new_tokens = Some(16);
        assert!(validation.validate(req).is_ok());
    }
}
