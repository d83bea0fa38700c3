//! Per-call cancellation and deadline.
//!
//! Every blocking step of an evaluation runs through [`EvalContext::guard`],
//! so a cancelled token or an expired deadline aborts the step instead of
//! letting it complete.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::Stage;

/// Cancellation signal plus optional deadline for one `evaluate` call.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl EvalContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Fail fast if the context is already done.
    pub fn check(&self, stage: Stage) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled { stage });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded { stage });
            }
        }
        Ok(())
    }

    /// Run `fut`, aborting with `Cancelled`/`DeadlineExceeded` tagged with `stage`.
    pub async fn guard<T, F>(&self, stage: Stage, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(stage)?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Error::Cancelled { stage }),
                _ = tokio::time::sleep_until(deadline) => Err(Error::DeadlineExceeded { stage }),
                res = fut => res,
            },
            None => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Error::Cancelled { stage }),
                res = fut => res,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_passes_through_result() {
        let ctx = EvalContext::background();
        let v = ctx.guard(Stage::Execute, async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_running() {
        let ctx = EvalContext::background();
        ctx.cancel();
        let err = ctx
            .guard(Stage::DedupCheck, async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { stage: Stage::DedupCheck }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_slow_step() {
        let ctx = EvalContext::background().with_timeout(Duration::from_millis(50));
        let err = ctx
            .guard(Stage::PersistOnMatch, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DeadlineExceeded {
                stage: Stage::PersistOnMatch
            }
        ));
    }

    #[tokio::test]
    async fn context_follows_parent_token() {
        let parent = tokio_util::sync::CancellationToken::new();
        let ctx = EvalContext::with_token(parent.child_token());
        assert!(ctx.check(Stage::Execute).is_ok());
        parent.cancel();
        assert!(matches!(
            ctx.check(Stage::Execute),
            Err(Error::Cancelled { stage: Stage::Execute })
        ));
    }
}
