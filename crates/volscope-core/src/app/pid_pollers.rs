//! PidPollerSet - 1 プロセス（pid）に対して複数 plugin を並行に polling
//!
//! # 学習ポイント
//! - plugin ごとに独立した JobPoller を持つ（poller 間の協調・レート制限はしない）
//! - status は plugin 名をキーにした map で見える
//! - まだ terminal でない plugin を再度 start すると拒否（run の二重送信を防ぐ）

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use super::handle::PollHandle;
use super::poller::JobPoller;
use crate::domain::{AnalysisId, JobKey, JobStatus, Pid, PluginName, ResultSet, RunRequest};
use crate::error::{PollError, SessionError};
use crate::ports::AnalysisApi;

/// Concurrent plugin pollers scoped to one process of one analysis.
pub struct PidPollerSet {
    api: Arc<dyn AnalysisApi>,
    poller: JobPoller,
    analysis_id: AnalysisId,
    pid: Pid,
    live: HashMap<PluginName, PollHandle<ResultSet, JobStatus>>,
    // wait() 済みの plugin の最終 status
    settled: BTreeMap<PluginName, JobStatus>,
}

impl PidPollerSet {
    pub(crate) fn new(
        api: Arc<dyn AnalysisApi>,
        poller: JobPoller,
        analysis_id: AnalysisId,
        pid: Pid,
    ) -> Self {
        Self {
            api,
            poller,
            analysis_id,
            pid,
            live: HashMap::new(),
            settled: BTreeMap::new(),
        }
    }

    pub fn analysis_id(&self) -> &AnalysisId {
        &self.analysis_id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn is_running(&self, plugin: &PluginName) -> bool {
        self.live
            .get(plugin)
            .is_some_and(|h| !h.is_finished() && !h.progress().is_terminal())
    }

    /// Submit `plugin` for this pid and start polling it.
    ///
    /// Rejected with [`SessionError::AlreadyRunning`] while an earlier poller
    /// for the same plugin is still active; nothing is submitted in that case.
    pub async fn start(&mut self, plugin: PluginName, force: bool) -> Result<(), SessionError> {
        if self.is_running(&plugin) {
            debug!(%plugin, pid = %self.pid, "duplicate start rejected");
            return Err(SessionError::AlreadyRunning {
                plugin,
                pid: self.pid,
            });
        }

        let request = RunRequest {
            plugin: plugin.clone(),
            force,
            pid: Some(self.pid),
        };
        self.api.run_plugin(&self.analysis_id, &request).await?;
        info!(%plugin, pid = %self.pid, force, "pid-scoped run submitted");

        let job = JobKey::new(self.analysis_id.clone(), plugin.clone()).with_pid(self.pid);
        let handle = self.poller.spawn(job);
        self.settled.remove(&plugin);
        // 古い handle（terminal 済み）はここで drop される
        self.live.insert(plugin, handle);
        Ok(())
    }

    /// Latest status of every plugin started on this pid.
    pub fn statuses(&self) -> BTreeMap<PluginName, JobStatus> {
        let mut out = self.settled.clone();
        out.extend(
            self.live
                .iter()
                .map(|(plugin, handle)| (plugin.clone(), handle.progress())),
        );
        out
    }

    pub fn subscribe(&self, plugin: &PluginName) -> Option<watch::Receiver<JobStatus>> {
        self.live.get(plugin).map(PollHandle::subscribe)
    }

    /// Wait for `plugin`'s poller to finish. `None` if it was never started
    /// (or was already waited on).
    pub async fn wait(&mut self, plugin: &PluginName) -> Option<Result<ResultSet, PollError>> {
        let handle = self.live.remove(plugin)?;
        let progress = handle.subscribe();
        let outcome = handle.join().await;

        let last = *progress.borrow();
        self.settled.insert(plugin.clone(), last);
        Some(outcome)
    }

    pub fn cancel_all(&self) {
        for handle in self.live.values() {
            handle.cancel();
        }
    }
}
