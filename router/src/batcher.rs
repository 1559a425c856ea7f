use crate::infer::InferError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_backend::{Engine, GenerationParameters, GenerationResult};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info_span, instrument, Instrument, Span};

/// A single prompt waiting in the dynamic batching window.
#[derive(Debug)]
pub(crate) struct Entry {
    /// The prompt to generate from
    pub prompt: String,
    /// Sampling configuration; entries are only batched together when these
    /// compare equal
    pub parameters: GenerationParameters,
    /// Where to send the result back to the waiting request handler
    pub response_tx: oneshot::Sender<Result<GenerationResult, InferError>>,
    /// Span that will live for the entire entry lifetime
    pub span: Span,
    /// Instant when this entry was queued
    pub queue_time: Instant,
}

/// Accumulates single-prompt requests into time/size bounded windows and
/// dispatches each window to the engine as one batch.
#[derive(Clone)]
pub(crate) struct Batcher {
    sender: flume::Sender<Entry>,
}

impl Batcher {
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        max_batch_size: usize,
        max_batch_delay: Duration,
    ) -> Self {
        let (sender, receiver) = flume::unbounded();

        tokio::spawn(batching_task(
            engine,
            max_batch_size,
            max_batch_delay,
            receiver,
        ));

        Self { sender }
    }

    /// Queue one prompt and wait for its result.
    #[instrument(skip_all)]
    pub(crate) async fn submit(
        &self,
        prompt: String,
        parameters: GenerationParameters,
    ) -> Result<GenerationResult, InferError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.sender
            .send(Entry {
                prompt,
                parameters,
                response_tx,
                span: Span::current(),
                queue_time: Instant::now(),
            })
            .map_err(|_| InferError::IncompleteGeneration)?;

        response_rx
            .await
            .map_err(|_| InferError::IncompleteGeneration)?
    }
}

/// Batching logic. Runs for the lifetime of the router.
///
/// Blocks on the first entry, then keeps the window open until either the
/// batch delay elapses or the window is full.
async fn batching_task(
    engine: Arc<dyn Engine>,
    max_batch_size: usize,
    max_batch_delay: Duration,
    receiver: flume::Receiver<Entry>,
) {
    while let Ok(first) = receiver.recv_async().await {
        let deadline = Instant::now() + max_batch_delay;
        let mut entries = vec![first];

        while entries.len() < max_batch_size {
            match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(entry)) => entries.push(entry),
                // Window closed or all senders dropped
                Ok(Err(_)) | Err(_) => break,
            }
        }

        metrics::histogram!("switchboard_batch_next_size", entries.len() as f64);

        let span = info_span!("dynamic_batch", batch_size = entries.len());
        tokio::spawn(dispatch_window(engine.clone(), entries).instrument(span));
    }
}

/// Group a window's entries by configuration, run each group through the
/// engine, and scatter results back to the original callers.
async fn dispatch_window(engine: Arc<dyn Engine>, entries: Vec<Entry>) {
    let mut groups: HashMap<GenerationParameters, (Vec<String>, Vec<usize>)> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let (prompts, indices) = groups.entry(entry.parameters.clone()).or_default();
        prompts.push(entry.prompt.clone());
        indices.push(index);
    }

    let mut results: Vec<Option<Result<GenerationResult, InferError>>> =
        entries.iter().map(|_| None).collect();

    for (parameters, (prompts, indices)) in groups {
        metrics::increment_counter!("switchboard_batch_inference_count", "strategy" => "dynamic");

        match engine.generate(prompts, &parameters).await {
            Ok(outputs) => {
                let mut outputs = outputs.into_iter();
                for &index in &indices {
                    // An engine returning fewer outputs than prompts fails
                    // only the unmatched entries
                    results[index] = Some(match outputs.next() {
                        Some(output) => Ok(output),
                        None => Err(InferError::IncompleteGeneration),
                    });
                }
            }
            Err(err) => {
                tracing::error!("{err}");
                metrics::increment_counter!("switchboard_request_failure", "err" => "generation");
                for &index in &indices {
                    results[index] = Some(Err(InferError::GenerationError(err.to_string())));
                }
            }
        }
    }

    for (entry, result) in entries.into_iter().zip(results) {
        let queue_duration = entry.queue_time.elapsed();
        metrics::histogram!(
            "switchboard_request_queue_duration",
            queue_duration.as_secs_f64()
        );

        let _entered = entry.span.enter();
        let result = result.unwrap_or(Err(InferError::IncompleteGeneration));
        // The caller may have dropped its receiver in the meantime
        let _ = entry.response_tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_backend::mock::{MockEngine, FAIL_MARKER};
    use switchboard_backend::EngineKind;

    fn batcher_with_mock(
        max_batch_size: usize,
        max_batch_delay: Duration,
    ) -> (Batcher, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new(EngineKind::SingleProcess));
        let batcher = Batcher::new(engine.clone(), max_batch_size, max_batch_delay);
        (batcher, engine)
    }

    #[tokio::test]
    async fn test_same_config_requests_share_one_engine_call() {
        let (batcher, engine) = batcher_with_mock(4, Duration::from_millis(200));

        let params = GenerationParameters::default();
        let (left, right) = tokio::join!(
            batcher.submit("alpha".to_string(), params.clone()),
            batcher.submit("beta".to_string(), params),
        );

        assert_eq!(left.unwrap().text, "alpha and so on");
        assert_eq!(right.unwrap().text, "beta and so on");

        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
    }

    #[tokio::test]
    async fn test_differing_configs_split_the_window() {
        let (batcher, engine) = batcher_with_mock(4, Duration::from_millis(200));

        let sampled = GenerationParameters {
            temperature: Some(0.7),
            ..Default::default()
        };
        let (left, right) = tokio::join!(
            batcher.submit("alpha".to_string(), GenerationParameters::default()),
            batcher.submit("beta".to_string(), sampled),
        );

        assert!(left.is_ok());
        assert!(right.is_ok());

        // One window, but two engine calls since the configs differ
        let calls = engine.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.len() == 1));
    }

    #[tokio::test]
    async fn test_group_failure_does_not_poison_other_groups() {
        let (batcher, _engine) = batcher_with_mock(4, Duration::from_millis(200));

        let sampled = GenerationParameters {
            temperature: Some(0.7),
            ..Default::default()
        };
        let (good, bad) = tokio::join!(
            batcher.submit("alpha".to_string(), GenerationParameters::default()),
            batcher.submit(format!("beta {FAIL_MARKER}"), sampled),
        );

        assert_eq!(good.unwrap().text, "alpha and so on");
        assert!(matches!(bad, Err(InferError::GenerationError(_))));
    }

    #[tokio::test]
    async fn test_window_closes_at_size_cap() {
        // Delay is long enough that only the size cap can close the window.
        let (batcher, engine) = batcher_with_mock(2, Duration::from_secs(5));

        let params = GenerationParameters::default();
        let (a, b) = tokio::join!(
            batcher.submit("one".to_string(), params.clone()),
            batcher.submit("two".to_string(), params),
        );

        assert!(a.is_ok());
        assert!(b.is_ok());
        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
    }
}
