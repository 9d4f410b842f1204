//! JobPoller - 単一 job（pid 付きも含む）の status polling
//!
//! # フロー
//! 1. interval ごとに status を問い合わせる（最初の問い合わせは 1 interval 後）
//! 2. `completed` → result を 1 回だけ取得して終了
//! 3. `failed` → サーバーのエラーメッセージで終了（result は取得しない）
//! 4. 通信エラー → その場で終了（retry しない）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{Instrument, debug, info, info_span, warn};

use super::handle::PollHandle;
use crate::config::{ClientConfig, DEFAULT_POLL_INTERVAL_MS};
use crate::domain::{JobKey, JobStatus, ResultSet};
use crate::error::PollError;
use crate::ports::{AnalysisApi, IdGenerator, SystemClock, UlidGenerator};

/// Timing shared by every poller variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl From<&ClientConfig> for PollConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            interval: config.poll_interval(),
        }
    }
}

impl PollConfig {
    /// Ticker whose first tick fires one interval from now.
    ///
    /// A slow response delays the following ticks instead of bunching them up,
    /// so one poller never has two status requests in flight.
    pub(crate) fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

/// Spawns single-job pollers against an [`AnalysisApi`].
#[derive(Clone)]
pub struct JobPoller {
    api: Arc<dyn AnalysisApi>,
    config: PollConfig,
    ids: Arc<dyn IdGenerator>,
}

impl JobPoller {
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

    /// Start polling `job`. Progress starts at `not_started`.
    pub fn spawn(&self, job: JobKey) -> PollHandle<ResultSet, JobStatus> {
        let poller = self.clone();
        let attempt = self.ids.generate_attempt_id();
        let span = info_span!("poll_job", %job, %attempt);
        PollHandle::spawn(attempt, JobStatus::NotStarted, move |progress| {
            async move { poller.run(job, progress).await }.instrument(span)
        })
    }

    async fn run(
        self,
        job: JobKey,
        progress: watch::Sender<JobStatus>,
    ) -> Result<ResultSet, PollError> {
        info!(interval_ms = self.config.interval.as_millis() as u64, "polling started");
        let mut ticker = self.config.ticker();
        let mut current = JobStatus::NotStarted;

        loop {
            ticker.tick().await;

            let report = match self.api.job_status(&job).await {
                Ok(report) => report,
                Err(source) => {
                    warn!(error = %source, "status query failed, polling stopped");
                    return Err(PollError::Transport {
                        job: job.to_string(),
                        source,
                    });
                }
            };

            current = current.advance(report.status);
            progress.send_replace(current);
            debug!(status = %current, "tick");

            match current {
                JobStatus::Completed => {
                    let results = self.api.fetch_results(&job).await.map_err(|source| {
                        warn!(error = %source, "result fetch failed");
                        PollError::Transport {
                            job: job.to_string(),
                            source,
                        }
                    })?;
                    info!(rows = results.len(), "job completed");
                    return Ok(results);
                }
                JobStatus::Failed => {
                    info!(error = ?report.error, "job failed");
                    return Err(PollError::JobFailed {
                        job,
                        message: report.error,
                    });
                }
                JobStatus::NotStarted | JobStatus::Running => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnalysisId, Pid, PluginName, StatusReport};
    use crate::impls::{ScriptedAnalysisApi, Step};
    use serde_json::json;

    fn key() -> JobKey {
        JobKey::new(AnalysisId::new("a-1"), PluginName::new("windows.pslist.PsList"))
    }

    fn five_rows() -> ResultSet {
        serde_json::from_value(json!([
            { "PID": 4 }, { "PID": 88 }, { "PID": 300 }, { "PID": 412 }, { "PID": 500 }
        ]))
        .unwrap()
    }

    fn poller(api: &ScriptedAnalysisApi) -> JobPoller {
        JobPoller::new(Arc::new(api.clone()), PollConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn completes_after_three_ticks_and_fetches_once() {
        let api = ScriptedAnalysisApi::new();
        api.script_job_after(key(), 3, StatusReport::new(JobStatus::Completed));
        api.set_results(key(), five_rows());

        let start = Instant::now();
        let handle = poller(&api).spawn(key());
        let rows = handle.join().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(rows.len(), 5);
        assert_eq!(api.status_calls(&key()), 3);
        assert_eq!(api.fetch_calls(&key()), 1);

        // no polling after the terminal state
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.status_calls(&key()), 3);
        assert_eq!(api.fetch_calls(&key()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_surfaces_server_message_without_fetch() {
        let api = ScriptedAnalysisApi::new();
        api.script_job(key(), [Step::Report(StatusReport::failed("volatility exited 1"))]);

        let err = poller(&api).spawn(key()).join().await.unwrap_err();

        assert_eq!(err.user_message(), "volatility exited 1");
        assert_eq!(api.status_calls(&key()), 1);
        assert_eq!(api.fetch_calls(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_failure_message_falls_back_to_generic_text() {
        let api = ScriptedAnalysisApi::new();
        api.script_job(key(), [Step::Report(StatusReport::failed(""))]);

        let err = poller(&api).spawn(key()).join().await.unwrap_err();

        assert_eq!(err.user_message(), crate::error::GENERIC_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_id_comes_from_the_injected_generator() {
        use crate::ports::FixedClock;
        use chrono::{TimeZone, Utc};

        let api = ScriptedAnalysisApi::new();
        api.script_job(key(), [Step::Report(StatusReport::new(JobStatus::Running))]);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(at));
        let poller = poller(&api).with_id_generator(Arc::new(ids));

        let first = poller.spawn(key());
        let second = poller.spawn(key());

        assert_eq!(first.attempt().as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
        assert_ne!(first.attempt(), second.attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_halts_immediately() {
        let api = ScriptedAnalysisApi::new();
        api.script_job(
            key(),
            [
                Step::Report(StatusReport::new(JobStatus::Running)),
                Step::TransportError("connection reset by peer".to_string()),
                Step::Report(StatusReport::new(JobStatus::Completed)),
            ],
        );

        let err = poller(&api).spawn(key()).join().await.unwrap_err();
        assert!(matches!(err, PollError::Transport { .. }));
        assert!(err.to_string().contains("connection reset by peer"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.status_calls(&key()), 2);
        assert_eq!(api.fetch_calls(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_with_zero_rows_is_success() {
        let api = ScriptedAnalysisApi::new();
        api.script_job_after(key(), 1, StatusReport::new(JobStatus::Completed));
        api.set_results(key(), ResultSet::default());

        let rows = poller(&api).spawn(key()).join().await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_result_fetch_is_a_transport_error() {
        let api = ScriptedAnalysisApi::new();
        api.script_job_after(key(), 1, StatusReport::new(JobStatus::Completed));
        // no results registered: the fetch answers 404

        let err = poller(&api).spawn(key()).join().await.unwrap_err();
        assert!(matches!(err, PollError::Transport { .. }));
        assert_eq!(api.fetch_calls(&key()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_in_flight_request() {
        let api = ScriptedAnalysisApi::new().with_latency(Duration::from_secs(5));
        api.script_job_after(key(), 1, StatusReport::new(JobStatus::Completed));
        api.set_results(key(), five_rows());

        let handle = poller(&api).spawn(key());
        // first tick at 2s, its response would land at 7s
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(api.status_calls(&key()), 1);
        handle.cancel();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, PollError::Cancelled));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.status_calls(&key()), 1);
        assert_eq!(api.fetch_calls(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_polling() {
        let api = ScriptedAnalysisApi::new();
        api.script_job(key(), [Step::Report(StatusReport::new(JobStatus::Running))]);

        let handle = poller(&api).spawn(key());
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(api.status_calls(&key()), 2);
        drop(handle);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.status_calls(&key()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_observable_and_pid_is_part_of_the_key() {
        let api = ScriptedAnalysisApi::new();
        let pid_key = key().with_pid(Pid::new(1337));
        api.script_job(
            pid_key.clone(),
            [
                Step::Report(StatusReport::new(JobStatus::Running)),
                Step::Report(StatusReport::new(JobStatus::Running)),
                Step::Report(StatusReport::new(JobStatus::Completed)),
            ],
        );
        api.set_results(pid_key.clone(), five_rows());

        let handle = poller(&api).spawn(pid_key.clone());
        assert_eq!(handle.progress(), JobStatus::NotStarted);

        let mut rx = handle.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), JobStatus::Running);

        handle.join().await.unwrap();
        assert_eq!(*rx.borrow(), JobStatus::Completed);
        assert_eq!(api.status_calls(&key()), 0);
        assert_eq!(api.status_calls(&pid_key), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_injectable() {
        let api = ScriptedAnalysisApi::new();
        api.script_job_after(key(), 2, StatusReport::new(JobStatus::Completed));
        api.set_results(key(), five_rows());

        let poller = JobPoller::new(
            Arc::new(api.clone()),
            PollConfig {
                interval: Duration::from_millis(250),
            },
        );
        let start = Instant::now();
        poller.spawn(key()).join().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
