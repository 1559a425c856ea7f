use crate::infer::InferError;
use crate::ResponseEnvelope;
use futures::Stream;
use std::sync::Arc;
use switchboard_backend::{Engine, StreamToken, TokenStream};

/// Drain a channel-backed streamer into an async stream.
///
/// The sink half lives on whichever thread runs the engine; this side only
/// ever awaits the next token.
pub(crate) fn consume_streamer(
    mut streamer: switchboard_backend::TokenStreamer,
) -> impl Stream<Item = Result<StreamToken, InferError>> {
    async_stream::stream! {
        while let Some(token) = streamer.next().await {
            yield Ok(token);
        }
    }
}

/// Adapt an engine-native token stream, mapping engine errors into infer
/// errors.
pub(crate) fn forward_async(
    mut tokens: TokenStream,
) -> impl Stream<Item = Result<StreamToken, InferError>> {
    async_stream::stream! {
        use futures::StreamExt;
        while let Some(token) = tokens.next().await {
            match token {
                Ok(token) => yield Ok(token),
                Err(err) => {
                    tracing::error!("{err}");
                    yield Err(InferError::GenerationError(err.to_string()));
                }
            }
        }
    }
}

/// Wrap each token into a response envelope.
///
/// The input length may not be known until the engine has tokenized the
/// prompt, so it is resolved lazily from the first token (or the engine)
/// and cached for the rest of the stream.
pub(crate) fn envelope_stream(
    tokens: futures::stream::BoxStream<'static, Result<StreamToken, InferError>>,
    engine: Arc<dyn Engine>,
) -> impl Stream<Item = Result<ResponseEnvelope, InferError>> {
    async_stream::stream! {
        use futures::StreamExt;
        let mut tokens = tokens;
        let mut input_length: Option<u32> = None;
        while let Some(token) = tokens.next().await {
            match token {
                Ok(token) => {
                    let length = *input_length
                        .get_or_insert_with(|| {
                            token
                                .input_length
                                .or_else(|| engine.input_length())
                                .unwrap_or(0)
                        });
                    yield Ok(ResponseEnvelope::from_token(token.text, length));
                }
                Err(err) => yield Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use switchboard_backend::mock::MockEngine;
    use switchboard_backend::{token_channel, EngineKind, GenerationParameters};

    #[tokio::test]
    async fn test_consume_streamer_waits_for_delayed_tokens() {
        let (sink, streamer) = token_channel(8);

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sink.put(StreamToken {
                text: "late".to_string(),
                input_length: Some(1),
                finished: true,
            });
            sink.finish();
        });

        let tokens: Vec<_> = consume_streamer(streamer).collect().await;
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].as_ref().unwrap().text, "late");
    }

    #[tokio::test]
    async fn test_envelope_stream_resolves_input_length_from_engine() {
        // This engine never reports the input length inside the token
        // stream, only through its side channel after tokenization.
        let engine = Arc::new(MockEngine::new(EngineKind::SingleProcess).without_stream_length());
        let (sink, streamer) = engine.get_streamer();
        engine
            .streaming_generate(
                "one two three".to_string(),
                sink,
                &GenerationParameters::default(),
            )
            .unwrap();

        let envelopes: Vec<_> = envelope_stream(consume_streamer(streamer).boxed(), engine)
            .collect()
            .await;
        assert!(!envelopes.is_empty());
        for envelope in envelopes {
            let envelope = envelope.unwrap();
            assert_eq!(envelope.num_input_tokens, 3);
            assert_eq!(envelope.num_generated_tokens, 1);
        }
    }
}
