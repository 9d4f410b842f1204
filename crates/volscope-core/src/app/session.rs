//! AnalysisSession - 「run を投げて poll する」までを 1 つにまとめた入口
//!
//! # 使用例
//! ```ignore
//! let session = AnalysisSession::new(api, PollConfig::from(&config));
//! let handle = session.run_and_poll(job, false).await?;
//! let rows = handle.join().await?;
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use super::batch_poller::{BatchOutcome, BatchPoller};
use super::handle::PollHandle;
use super::pid_pollers::PidPollerSet;
use super::poller::{JobPoller, PollConfig};
use crate::domain::{
    AnalysisId, BatchProgress, BatchRunRequest, JobKey, JobStatus, Pid, PluginName, ResultSet,
    RunRequest,
};
use crate::error::SessionError;
use crate::ports::{AnalysisApi, IdGenerator};

#[derive(Clone)]
pub struct AnalysisSession {
    api: Arc<dyn AnalysisApi>,
    jobs: JobPoller,
    batches: BatchPoller,
}

impl AnalysisSession {
    pub fn new(api: Arc<dyn AnalysisApi>, config: PollConfig) -> Self {
        Self {
            jobs: JobPoller::new(api.clone(), config),
            batches: BatchPoller::new(api.clone(), config),
            api,
        }
    }

    pub fn with_id_generator(self, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            jobs: self.jobs.with_id_generator(ids.clone()),
            batches: self.batches.with_id_generator(ids),
            api: self.api,
        }
    }

    /// Submit a single run, then poll it.
    pub async fn run_and_poll(
        &self,
        job: JobKey,
        force: bool,
    ) -> Result<PollHandle<ResultSet, JobStatus>, SessionError> {
        let request = RunRequest {
            plugin: job.plugin.clone(),
            force,
            pid: job.pid,
        };
        self.api.run_plugin(&job.analysis_id, &request).await?;
        info!(%job, force, "run submitted");
        Ok(self.jobs.spawn(job))
    }

    /// Submit a batch run, then poll the aggregate status.
    ///
    /// An empty plugin list is not submitted; the returned poller fails at once.
    pub async fn run_batch_and_poll(
        &self,
        analysis_id: AnalysisId,
        plugins: Vec<PluginName>,
        force: bool,
    ) -> Result<PollHandle<BatchOutcome, BatchProgress>, SessionError> {
        if !plugins.is_empty() {
            let request = BatchRunRequest {
                plugins: plugins.clone(),
                force,
            };
            self.api.run_batch(&analysis_id, &request).await?;
            info!(%analysis_id, members = plugins.len(), force, "batch submitted");
        }
        Ok(self.batches.spawn(analysis_id, plugins))
    }

    /// Fetch results on demand, e.g. for another completed batch member.
    pub async fn fetch_results(&self, job: &JobKey) -> Result<ResultSet, SessionError> {
        Ok(self.api.fetch_results(job).await?)
    }

    pub fn pid_pollers(&self, analysis_id: AnalysisId, pid: Pid) -> PidPollerSet {
        PidPollerSet::new(self.api.clone(), self.jobs.clone(), analysis_id, pid)
    }

    /// Plugins already completed for `analysis_id`, sorted by name.
    ///
    /// Failures are logged at debug and `prior` is returned unchanged.
    pub async fn completed_plugins(
        &self,
        analysis_id: &AnalysisId,
        prior: Vec<PluginName>,
    ) -> Vec<PluginName> {
        match self.api.batch_status(analysis_id).await {
            Ok(report) => {
                let mut done: Vec<PluginName> = report
                    .plugins
                    .iter()
                    .filter(|(_, member)| member.status() == JobStatus::Completed)
                    .map(|(plugin, _)| plugin.clone())
                    .collect();
                done.sort();
                done
            }
            Err(err) => {
                debug!(%analysis_id, error = %err, "completed plugin lookup failed");
                prior
            }
        }
    }
}
