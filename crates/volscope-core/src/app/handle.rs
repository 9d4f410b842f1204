//! PollHandle - poller task の所有権
//!
//! # 学習ポイント
//! - `CancellationToken` + `tokio::select!` で「タイマーだけ止める」のではなく
//!   in-flight の request future ごと drop する
//! - `watch` channel で最新の status を購読（UI の再描画に相当）
//! - handle を drop すると cancel される（view の破棄と同じ寿命）

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::AttemptId;
use crate::error::PollError;

/// Handle to a running poller.
///
/// `T` is the final output, `S` the observable progress.
/// Dropping the handle cancels the poller; a cancelled poller never runs
/// another continuation, including one for a request already in flight.
pub struct PollHandle<T, S> {
    attempt: AttemptId,
    token: CancellationToken,
    progress: watch::Receiver<S>,
    join: Option<JoinHandle<Result<T, PollError>>>,
}

impl<T, S> PollHandle<T, S>
where
    T: Send + 'static,
    S: Clone,
{
    /// Spawn `poll` on the current runtime, bound to a fresh cancellation token.
    pub(crate) fn spawn<F, Fut>(attempt: AttemptId, initial: S, poll: F) -> Self
    where
        F: FnOnce(watch::Sender<S>) -> Fut,
        Fut: Future<Output = Result<T, PollError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (progress_tx, progress) = watch::channel(initial);
        let fut = poll(progress_tx);

        let child = token.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = child.cancelled() => Err(PollError::Cancelled),
                result = fut => result,
            }
        });

        Self {
            attempt,
            token,
            progress,
            join: Some(join),
        }
    }

    /// Attempt id carried by this poller's log span.
    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Latest observed progress.
    pub fn progress(&self) -> S {
        self.progress.borrow().clone()
    }

    /// Receiver that is notified on every progress change.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.progress.clone()
    }

    /// Stop polling. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the poller to reach its outcome.
    pub async fn join(mut self) -> Result<T, PollError> {
        let Some(join) = self.join.take() else {
            return Err(PollError::Cancelled);
        };
        match join.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(PollError::Cancelled),
        }
    }
}

impl<T, S> Drop for PollHandle<T, S> {
    fn drop(&mut self) {
        // join() の future ごと drop された場合もここで止まる
        self.token.cancel();
    }
}
