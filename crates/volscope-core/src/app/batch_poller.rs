//! BatchPoller - 複数 plugin をまとめて実行した batch の polling
//!
//! # 学習ポイント
//! - 集約 status endpoint を 1 tick に 1 回だけ叩く
//! - 全 member が terminal になるまで待つ（一番遅い member に合わせる）
//! - 1 つでも completed があれば成功。結果は「呼び出し順で最初の completed」だけ取得する

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use super::handle::PollHandle;
use super::poller::PollConfig;
use crate::domain::{AnalysisId, BatchProgress, BatchState, JobKey, PluginName, ResultSet};
use crate::error::PollError;
use crate::ports::{AnalysisApi, IdGenerator, SystemClock, UlidGenerator};

/// Result of a batch with at least one completed member.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Final status of every member.
    pub progress: BatchProgress,
    /// Member whose results were fetched.
    pub selected: PluginName,
    pub results: ResultSet,
}

impl BatchOutcome {
    /// All completed members, in the order they were requested.
    pub fn completed(&self) -> Vec<PluginName> {
        self.progress.completed().cloned().collect()
    }
}

#[derive(Clone)]
pub struct BatchPoller {
    api: Arc<dyn AnalysisApi>,
    config: PollConfig,
    ids: Arc<dyn IdGenerator>,
}

impl BatchPoller {
    pub fn new(api: Arc<dyn AnalysisApi>, config: PollConfig) -> Self {
        Self {
            api,
            config,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Start polling the batch of `plugins` (duplicates collapse).
    pub fn spawn(
        &self,
        analysis_id: AnalysisId,
        plugins: impl IntoIterator<Item = PluginName>,
    ) -> PollHandle<BatchOutcome, BatchProgress> {
        let progress = BatchProgress::new(analysis_id, plugins);
        let poller = self.clone();
        let attempt = self.ids.generate_attempt_id();
        let span = info_span!(
            "poll_batch",
            analysis_id = %progress.analysis_id,
            members = progress.members().len(),
            %attempt,
        );
        PollHandle::spawn(attempt, progress.clone(), move |tx| {
            async move { poller.run(progress, tx).await }.instrument(span)
        })
    }

    async fn run(
        self,
        mut progress: BatchProgress,
        tx: watch::Sender<BatchProgress>,
    ) -> Result<BatchOutcome, PollError> {
        if progress.members().is_empty() {
            warn!("empty batch, nothing to poll");
            return Err(PollError::BatchFailed {
                analysis_id: progress.analysis_id,
                members: Vec::new(),
            });
        }

        let mut ticker = self.config.ticker();
        loop {
            ticker.tick().await;

            let report = match self.api.batch_status(&progress.analysis_id).await {
                Ok(report) => report,
                Err(source) => {
                    warn!(error = %source, "batch status query failed, polling stopped");
                    return Err(PollError::Transport {
                        job: progress.analysis_id.to_string(),
                        source,
                    });
                }
            };

            if progress.observe(&report) {
                tx.send_replace(progress.clone());
            }
            let counts = progress.counts();
            debug!(
                running = counts.running,
                completed = counts.completed,
                failed = counts.failed,
                "tick"
            );

            match progress.state() {
                BatchState::Running => {}
                BatchState::Failed => {
                    info!("every batch member failed");
                    return Err(PollError::BatchFailed {
                        analysis_id: progress.analysis_id.clone(),
                        members: progress.members().to_vec(),
                    });
                }
                BatchState::Succeeded => return self.finish(progress).await,
            }
        }
    }

    async fn finish(&self, progress: BatchProgress) -> Result<BatchOutcome, PollError> {
        let selected = match progress.first_completed() {
            Some(plugin) => plugin.clone(),
            None => {
                return Err(PollError::BatchFailed {
                    analysis_id: progress.analysis_id.clone(),
                    members: progress.members().to_vec(),
                });
            }
        };

        let job = JobKey::new(progress.analysis_id.clone(), selected.clone());
        let results = self
            .api
            .fetch_results(&job)
            .await
            .map_err(|source| PollError::Transport {
                job: job.to_string(),
                source,
            })?;

        info!(
            selected = %selected,
            completed = progress.counts().completed,
            rows = results.len(),
            "batch finished"
        );
        Ok(BatchOutcome {
            progress,
            selected,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::JobStatus;
    use crate::impls::{ScriptedAnalysisApi, Step, batch_report};
    use serde_json::json;

    fn analysis() -> AnalysisId {
        AnalysisId::new("a-7")
    }

    fn names(list: &[&str]) -> Vec<PluginName> {
        list.iter().map(|n| PluginName::new(*n)).collect()
    }

    fn poller(api: &ScriptedAnalysisApi) -> BatchPoller {
        BatchPoller::new(Arc::new(api.clone()), PollConfig::default())
    }

    fn rows(plugin: &str) -> ResultSet {
        serde_json::from_value(json!([{ "source": plugin }])).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_selects_first_completed() {
        use JobStatus::*;
        let api = ScriptedAnalysisApi::new();
        api.script_batch(
            analysis(),
            [
                Step::Report(batch_report([("A", Running), ("B", Running), ("C", Running)])),
                Step::Report(batch_report([("A", Completed), ("B", Failed), ("C", Completed)])),
            ],
        );
        api.set_results(JobKey::new(analysis(), PluginName::new("A")), rows("A"));
        api.set_results(JobKey::new(analysis(), PluginName::new("C")), rows("C"));

        let outcome = poller(&api)
            .spawn(analysis(), names(&["A", "B", "C"]))
            .join()
            .await
            .unwrap();

        assert_eq!(outcome.selected, PluginName::new("A"));
        assert_eq!(outcome.completed(), names(&["A", "C"]));
        assert_eq!(outcome.results.rows()[0]["source"], "A");
        assert_eq!(api.fetch_calls(&JobKey::new(analysis(), PluginName::new("A"))), 1);
        assert_eq!(api.fetch_calls(&JobKey::new(analysis(), PluginName::new("C"))), 0);
        assert_eq!(api.batch_status_calls(&analysis()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_failed_is_a_batch_failure() {
        use JobStatus::*;
        let api = ScriptedAnalysisApi::new();
        api.script_batch(analysis(), [Step::Report(batch_report([("A", Failed), ("B", Failed)]))]);

        let err = poller(&api)
            .spawn(analysis(), names(&["A", "B"]))
            .join()
            .await
            .unwrap_err();

        let PollError::BatchFailed { members, .. } = err else {
            panic!("expected BatchFailed, got {err:?}");
        };
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.status == Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_slowest_member() {
        use JobStatus::*;
        let api = ScriptedAnalysisApi::new();
        api.script_batch(
            analysis(),
            [
                Step::Report(batch_report([("A", Completed), ("B", Running)])),
                Step::Report(batch_report([("A", Completed), ("B", Running)])),
                Step::Report(batch_report([("A", Completed), ("B", Completed)])),
            ],
        );
        api.set_results(JobKey::new(analysis(), PluginName::new("A")), rows("A"));

        let start = tokio::time::Instant::now();
        let handle = poller(&api).spawn(analysis(), names(&["A", "B"]));
        let outcome = handle.join().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(outcome.completed(), names(&["A", "B"]));
        assert_eq!(api.batch_status_calls(&analysis()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn member_missing_from_report_counts_as_not_started() {
        use JobStatus::*;
        let api = ScriptedAnalysisApi::new();
        api.script_batch(
            analysis(),
            [
                Step::Report(batch_report([("A", Failed)])),
                Step::Report(batch_report([("A", Failed), ("B", Completed)])),
            ],
        );
        api.set_results(JobKey::new(analysis(), PluginName::new("B")), rows("B"));

        let handle = poller(&api).spawn(analysis(), names(&["A", "B"]));
        let mut rx = handle.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state(), BatchState::Running);

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.selected, PluginName::new("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_halts_batch() {
        let api = ScriptedAnalysisApi::new();
        api.script_batch(analysis(), [Step::TransportError("connection refused".to_string())]);

        let err = poller(&api)
            .spawn(analysis(), names(&["A"]))
            .join()
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Transport { .. }));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.batch_status_calls(&analysis()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_fails_without_polling() {
        let api = ScriptedAnalysisApi::new();
        let err = poller(&api)
            .spawn(analysis(), Vec::new())
            .join()
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::BatchFailed { ref members, .. } if members.is_empty()));
        assert_eq!(api.batch_status_calls(&analysis()), 0);
    }
}
