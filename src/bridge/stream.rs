//! In-process, pull-based stream with cooperative cancellation.

use super::BridgeError;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

type Items<T> = BoxStream<'static, Result<T, BridgeError>>;
type Opener<T> = Box<dyn FnOnce() -> Result<Items<T>, BridgeError> + Send>;

enum Source<T> {
    Pending(Opener<T>),
    Open(Items<T>),
    Finished,
}

/// Consumer half of a stream whose producer is opened on the first pull.
///
/// Stopping before the first [`ValueStream::next`] drops the opener without
/// running it, so no producer subscription is ever created.
pub struct ValueStream<T> {
    source: Source<T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> ValueStream<T> {
    pub fn lazy<F>(open: F) -> Self
    where
        F: FnOnce() -> Result<BoxStream<'static, Result<T, BridgeError>>, BridgeError>
            + Send
            + 'static,
    {
        Self {
            source: Source::Pending(Box::new(open)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_stream(stream: BoxStream<'static, Result<T, BridgeError>>) -> Self {
        Self {
            source: Source::Open(stream),
            cancel: CancellationToken::new(),
        }
    }

    /// Token fired when the consumer stops; producers may watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.source, Source::Finished)
    }

    /// Next value, a terminal error, or `None` once finished or stopped.
    pub async fn next(&mut self) -> Option<Result<T, BridgeError>> {
        if self.cancel.is_cancelled() {
            self.source = Source::Finished;
            return None;
        }
        if let Source::Pending(_) = self.source {
            let Source::Pending(open) = std::mem::replace(&mut self.source, Source::Finished)
            else {
                unreachable!("source checked as pending");
            };
            match open() {
                Ok(stream) => self.source = Source::Open(stream),
                Err(err) => return Some(Err(err)),
            }
        }
        let Source::Open(stream) = &mut self.source else {
            return None;
        };

        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(value)) => Some(Ok(value)),
            Some(Err(err)) => {
                self.source = Source::Finished;
                Some(Err(err))
            }
            None => {
                self.source = Source::Finished;
                None
            }
        }
    }

    /// Cancels the producer and releases its resources. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.source = Source::Finished;
    }
}

impl<T> Drop for ValueStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
