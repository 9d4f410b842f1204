//! ScriptedAnalysisApi - 開発・テスト用の in-memory サービス
//!
//! # 学習ポイント
//! - status の応答を「台本」（VecDeque）として事前に積んでおく
//! - 最後の 1 ステップは使い切らずに繰り返す（terminal 状態が続く想定）
//! - 呼び出し回数を記録して「terminal 後に poll していない」ことを検証する

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    AnalysisId, BatchRunRequest, BatchStatusReport, JobKey, JobStatus, MemberStatus, PluginName,
    ResultSet, RunRequest, StatusReport,
};
use crate::error::ClientError;
use crate::ports::AnalysisApi;

/// One scripted answer of a status endpoint.
#[derive(Debug, Clone)]
pub enum Step<T> {
    Report(T),
    /// Answer with a transport-level failure (connection dropped etc.).
    TransportError(String),
}

impl<T: Clone> Step<T> {
    fn answer(&self) -> Result<T, ClientError> {
        match self {
            Step::Report(report) => Ok(report.clone()),
            Step::TransportError(msg) => Err(ClientError::Other(msg.clone())),
        }
    }
}

/// Pop the next step, keeping the last one in place.
fn next_step<T: Clone>(script: &mut VecDeque<Step<T>>) -> Option<Step<T>> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

#[derive(Default)]
struct ScriptState {
    jobs: HashMap<JobKey, VecDeque<Step<StatusReport>>>,
    batches: HashMap<AnalysisId, VecDeque<Step<BatchStatusReport>>>,
    results: HashMap<JobKey, ResultSet>,

    runs: Vec<(AnalysisId, RunRequest)>,
    batch_runs: Vec<(AnalysisId, BatchRunRequest)>,

    status_calls: HashMap<JobKey, usize>,
    batch_status_calls: HashMap<AnalysisId, usize>,
    fetch_calls: HashMap<JobKey, usize>,
}

/// In-memory `AnalysisApi` driven by pre-recorded status sequences.
///
/// # 使用例
/// ```ignore
/// let api = ScriptedAnalysisApi::new();
/// api.script_job(key.clone(), [
///     Step::Report(StatusReport::new(JobStatus::Running)),
///     Step::Report(StatusReport::new(JobStatus::Completed)),
/// ]);
/// api.set_results(key, rows);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedAnalysisApi {
    state: Arc<Mutex<ScriptState>>,
    latency: Duration,
}

impl ScriptedAnalysisApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every status and result answer (simulates a slow network).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn script_job(&self, job: JobKey, steps: impl IntoIterator<Item = Step<StatusReport>>) {
        self.lock().jobs.insert(job, steps.into_iter().collect());
    }

    /// Shorthand: `running` for `ticks - 1` polls, then `status`.
    pub fn script_job_after(&self, job: JobKey, ticks: usize, last: StatusReport) {
        let running = Step::Report(StatusReport::new(JobStatus::Running));
        let steps = std::iter::repeat_n(running, ticks.saturating_sub(1))
            .chain(std::iter::once(Step::Report(last)));
        self.script_job(job, steps);
    }

    pub fn script_batch(
        &self,
        analysis_id: AnalysisId,
        steps: impl IntoIterator<Item = Step<BatchStatusReport>>,
    ) {
        self.lock()
            .batches
            .insert(analysis_id, steps.into_iter().collect());
    }

    pub fn set_results(&self, job: JobKey, results: ResultSet) {
        self.lock().results.insert(job, results);
    }

    pub fn status_calls(&self, job: &JobKey) -> usize {
        self.lock().status_calls.get(job).copied().unwrap_or(0)
    }

    pub fn batch_status_calls(&self, analysis_id: &AnalysisId) -> usize {
        self.lock()
            .batch_status_calls
            .get(analysis_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn fetch_calls(&self, job: &JobKey) -> usize {
        self.lock().fetch_calls.get(job).copied().unwrap_or(0)
    }

    pub fn runs(&self) -> Vec<(AnalysisId, RunRequest)> {
        self.lock().runs.clone()
    }

    pub fn batch_runs(&self) -> Vec<(AnalysisId, BatchRunRequest)> {
        self.lock().batch_runs.clone()
    }
}

/// Build an aggregate report from `(plugin, status)` pairs.
pub fn batch_report<'a>(
    entries: impl IntoIterator<Item = (&'a str, JobStatus)>,
) -> BatchStatusReport {
    BatchStatusReport {
        plugins: entries
            .into_iter()
            .map(|(name, status)| (PluginName::new(name), MemberStatus::Bare(status)))
            .collect(),
    }
}

fn not_found(what: String) -> ClientError {
    ClientError::Api {
        status: 404,
        body: format!("{what} not found"),
    }
}

#[async_trait]
impl AnalysisApi for ScriptedAnalysisApi {
    async fn run_plugin(
        &self,
        analysis_id: &AnalysisId,
        request: &RunRequest,
    ) -> Result<(), ClientError> {
        self.lock()
            .runs
            .push((analysis_id.clone(), request.clone()));
        Ok(())
    }

    async fn run_batch(
        &self,
        analysis_id: &AnalysisId,
        request: &BatchRunRequest,
    ) -> Result<(), ClientError> {
        self.lock()
            .batch_runs
            .push((analysis_id.clone(), request.clone()));
        Ok(())
    }

    async fn job_status(&self, job: &JobKey) -> Result<StatusReport, ClientError> {
        let step = {
            let mut state = self.lock();
            *state.status_calls.entry(job.clone()).or_default() += 1;
            state.jobs.get_mut(job).and_then(next_step)
        };
        self.delay().await;
        step.ok_or_else(|| not_found(format!("job {job}")))?
            .answer()
    }

    async fn batch_status(
        &self,
        analysis_id: &AnalysisId,
    ) -> Result<BatchStatusReport, ClientError> {
        let step = {
            let mut state = self.lock();
            *state
                .batch_status_calls
                .entry(analysis_id.clone())
                .or_default() += 1;
            state.batches.get_mut(analysis_id).and_then(next_step)
        };
        self.delay().await;
        step.ok_or_else(|| not_found(format!("analysis {analysis_id}")))?
            .answer()
    }

    async fn fetch_results(&self, job: &JobKey) -> Result<ResultSet, ClientError> {
        let results = {
            let mut state = self.lock();
            *state.fetch_calls.entry(job.clone()).or_default() += 1;
            state.results.get(job).cloned()
        };
        self.delay().await;
        results.ok_or_else(|| not_found(format!("results for {job}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> JobKey {
        JobKey::new(AnalysisId::new("a"), PluginName::new("windows.info.Info"))
    }

    #[tokio::test]
    async fn last_step_repeats() {
        let api = ScriptedAnalysisApi::new();
        api.script_job_after(key(), 2, StatusReport::new(JobStatus::Completed));

        let seen: Vec<JobStatus> = [
            api.job_status(&key()).await.unwrap().status,
            api.job_status(&key()).await.unwrap().status,
            api.job_status(&key()).await.unwrap().status,
        ]
        .to_vec();
        assert_eq!(
            seen,
            vec![JobStatus::Running, JobStatus::Completed, JobStatus::Completed]
        );
        assert_eq!(api.status_calls(&key()), 3);
    }

    #[tokio::test]
    async fn unscripted_job_is_not_found() {
        let api = ScriptedAnalysisApi::new();
        let err = api.job_status(&key()).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn transport_step_surfaces_as_error() {
        let api = ScriptedAnalysisApi::new();
        api.script_job(key(), [Step::TransportError("connection reset".to_string())]);
        let err = api.job_status(&key()).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }
}
