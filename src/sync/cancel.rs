use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Races `operation` against `cancel`, mapping cancellation to [`Error::Aborted`].
pub async fn run_cancellable<F, T>(cancel: Option<&CancellationToken>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if let Some(token) = cancel {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Aborted),
            result = operation => result,
        }
    } else {
        operation.await
    }
}

/// Child of `parent` that also fires once `timeout` elapses.
pub fn deadline_token(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(timeout) => timer.cancel(),
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_aborts_operation() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> =
            run_cancellable(Some(&token), std::future::pending::<Result<()>>()).await;
        assert_eq!(result, Err(Error::Aborted));
    }

    #[tokio::test]
    async fn operation_result_passes_through() {
        let token = CancellationToken::new();
        let result = run_cancellable(Some(&token), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(run_cancellable(None, async { Ok(8) }).await, Ok(8));
    }

    #[tokio::test]
    async fn deadline_token_fires_after_timeout() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, Duration::from_millis(10));
        token.cancelled().await;
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_token_follows_parent() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, Duration::from_secs(60));
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
