use crate::StreamToken;
use thiserror::Error;

pub(crate) const DEFAULT_CAPACITY: usize = 32;

/// Create a sink/streamer pair backed by a bounded queue.
///
/// The producing side blocks once `capacity` tokens are in flight, so a fast
/// engine thread cannot outrun a slow consumer without bound.
pub fn token_channel(capacity: usize) -> (StreamerSink, TokenStreamer) {
    let (tx, rx) = flume::bounded(capacity);
    (StreamerSink { tx }, TokenStreamer { rx, done: false })
}

/// Producing half of a token stream, filled by the engine.
#[derive(Debug)]
pub struct StreamerSink {
    tx: flume::Sender<StreamToken>,
}

impl StreamerSink {
    /// Push one token. Returns `false` when the consumer is gone, which the
    /// engine should treat as a request to stop producing.
    pub fn put(&self, token: StreamToken) -> bool {
        self.tx.send(token).is_ok()
    }

    /// Close the stream. Dropping the sink has the same effect.
    pub fn finish(self) {}
}

/// The next token has not been generated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("next token is not yet available")]
pub struct NotReady;

/// Consuming half of a token stream.
///
/// Once the stream has ended it stays ended; neither `next` nor `try_next`
/// ever produces a token again.
#[derive(Debug)]
pub struct TokenStreamer {
    rx: flume::Receiver<StreamToken>,
    done: bool,
}

impl TokenStreamer {
    /// Wait for the next token without blocking the scheduler.
    /// `None` means the stream has ended.
    pub async fn next(&mut self) -> Option<StreamToken> {
        if self.done {
            return None;
        }
        match self.rx.recv_async().await {
            Ok(token) => {
                if token.finished {
                    self.done = true;
                }
                Some(token)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }

    /// Pollable variant: `Err(NotReady)` signals that no token has been
    /// produced yet, `Ok(None)` that the stream has ended.
    pub fn try_next(&mut self) -> Result<Option<StreamToken>, NotReady> {
        if self.done {
            return Ok(None);
        }
        match self.rx.try_recv() {
            Ok(token) => {
                if token.finished {
                    self.done = true;
                }
                Ok(Some(token))
            }
            Err(flume::TryRecvError::Empty) => Err(NotReady),
            Err(flume::TryRecvError::Disconnected) => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, finished: bool) -> StreamToken {
        StreamToken {
            text: text.to_string(),
            input_length: None,
            finished,
        }
    }

    #[test]
    fn test_try_next_not_ready_then_token() {
        let (sink, mut streamer) = token_channel(4);

        assert_eq!(streamer.try_next(), Err(NotReady));
        assert_eq!(streamer.try_next(), Err(NotReady));
        assert_eq!(streamer.try_next(), Err(NotReady));

        assert!(sink.put(token("hello", false)));
        assert_eq!(streamer.try_next(), Ok(Some(token("hello", false))));
        assert_eq!(streamer.try_next(), Err(NotReady));
    }

    #[test]
    fn test_stream_does_not_restart_after_end() {
        let (sink, mut streamer) = token_channel(4);
        sink.put(token("a", false));
        sink.put(token("b", true));
        // Queued after the end marker; must never be observed.
        sink.put(token("c", false));

        assert_eq!(streamer.try_next(), Ok(Some(token("a", false))));
        assert_eq!(streamer.try_next(), Ok(Some(token("b", true))));
        assert_eq!(streamer.try_next(), Ok(None));
        assert_eq!(streamer.try_next(), Ok(None));
    }

    #[tokio::test]
    async fn test_next_ends_on_disconnect() {
        let (sink, mut streamer) = token_channel(4);
        sink.put(token("only", false));
        drop(sink);

        assert_eq!(streamer.next().await, Some(token("only", false)));
        assert_eq!(streamer.next().await, None);
    }
}
