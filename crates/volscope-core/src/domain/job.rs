//! Job identity and batch aggregation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{AnalysisId, Pid, PluginName};
use super::status::{BatchStatusReport, JobStatus};
use crate::observability::StatusCounts;

/// Identity of one plugin execution: `(analysis_id, plugin, pid?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub analysis_id: AnalysisId,
    pub plugin: PluginName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

impl JobKey {
    pub fn new(analysis_id: AnalysisId, plugin: PluginName) -> Self {
        Self {
            analysis_id,
            plugin,
            pid: None,
        }
    }

    /// Scope this job to a single process.
    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.analysis_id, self.plugin)?;
        if let Some(pid) = self.pid {
            write!(f, "@{pid}")?;
        }
        Ok(())
    }
}

/// Aggregate state of a batch (derived from its members).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// At least one member is not terminal yet.
    Running,

    /// Every member is terminal and at least one completed.
    Succeeded,

    /// Every member is terminal and none completed.
    Failed,
}

/// One member of a batch as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub plugin: PluginName,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// In-memory progress of a batch, kept in the order the caller supplied.
///
/// Design: same shape as a job record with its tasks.
/// - members are never reordered (selection is by caller order, not arrival order)
/// - state is derived from member statuses via `state()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub analysis_id: AnalysisId,
    members: Vec<BatchMember>,
}

impl BatchProgress {
    /// Duplicate plugin names collapse into the first occurrence.
    pub fn new(analysis_id: AnalysisId, plugins: impl IntoIterator<Item = PluginName>) -> Self {
        let mut members: Vec<BatchMember> = Vec::new();
        for plugin in plugins {
            if members.iter().any(|m| m.plugin == plugin) {
                continue;
            }
            members.push(BatchMember {
                plugin,
                status: JobStatus::NotStarted,
                error: None,
            });
        }
        Self {
            analysis_id,
            members,
        }
    }

    pub fn members(&self) -> &[BatchMember] {
        &self.members
    }

    pub fn plugins(&self) -> impl Iterator<Item = &PluginName> {
        self.members.iter().map(|m| &m.plugin)
    }

    /// Apply one aggregate status response. Returns whether anything changed.
    pub fn observe(&mut self, report: &BatchStatusReport) -> bool {
        let mut changed = false;
        for member in &mut self.members {
            let Some(entry) = report.plugins.get(&member.plugin) else {
                continue;
            };
            let next = member.status.advance(entry.status());
            if next != member.status {
                member.status = next;
                if next == JobStatus::Failed {
                    member.error = entry.error().map(str::to_string);
                }
                changed = true;
            }
        }
        changed
    }

    /// Every member reached a terminal state.
    ///
    /// An empty batch has nothing to wait for and counts as done.
    pub fn is_done(&self) -> bool {
        self.members.iter().all(|m| m.status.is_terminal())
    }

    pub fn state(&self) -> BatchState {
        if !self.is_done() {
            BatchState::Running
        } else if self.completed().next().is_some() {
            BatchState::Succeeded
        } else {
            BatchState::Failed
        }
    }

    /// Completed members in caller order.
    pub fn completed(&self) -> impl Iterator<Item = &PluginName> {
        self.members
            .iter()
            .filter(|m| m.status == JobStatus::Completed)
            .map(|m| &m.plugin)
    }

    /// Failed members in caller order.
    pub fn failed(&self) -> impl Iterator<Item = &BatchMember> {
        self.members
            .iter()
            .filter(|m| m.status == JobStatus::Failed)
    }

    /// The member whose results are fetched automatically.
    pub fn first_completed(&self) -> Option<&PluginName> {
        self.completed().next()
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_statuses(self.members.iter().map(|m| m.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::{MemberStatus, StatusReport};
    use rstest::rstest;

    fn analysis() -> AnalysisId {
        AnalysisId::new("a-1")
    }

    fn report(entries: &[(&str, JobStatus)]) -> BatchStatusReport {
        BatchStatusReport {
            plugins: entries
                .iter()
                .map(|(name, status)| (PluginName::new(*name), MemberStatus::Bare(*status)))
                .collect(),
        }
    }

    fn progress(names: &[&str]) -> BatchProgress {
        BatchProgress::new(analysis(), names.iter().map(|n| PluginName::new(*n)))
    }

    #[test]
    fn job_key_display_includes_pid() {
        let key = JobKey::new(analysis(), PluginName::new("windows.handles.Handles"))
            .with_pid(Pid::new(4));
        assert_eq!(key.to_string(), "a-1/windows.handles.Handles@4");
    }

    #[test]
    fn new_batch_deduplicates_and_keeps_order() {
        let p = progress(&["b", "a", "b"]);
        let names: Vec<_> = p.plugins().map(PluginName::as_str).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(p.state(), BatchState::Running);
    }

    #[test]
    fn waits_for_slowest_member() {
        let mut p = progress(&["a", "b"]);
        p.observe(&report(&[("a", JobStatus::Completed), ("b", JobStatus::Running)]));
        assert!(!p.is_done());
        assert_eq!(p.state(), BatchState::Running);

        p.observe(&report(&[("a", JobStatus::Completed), ("b", JobStatus::Failed)]));
        assert!(p.is_done());
        assert_eq!(p.state(), BatchState::Succeeded);
    }

    #[rstest]
    #[case::all_completed(&[JobStatus::Completed, JobStatus::Completed], BatchState::Succeeded)]
    #[case::partial(&[JobStatus::Failed, JobStatus::Completed], BatchState::Succeeded)]
    #[case::all_failed(&[JobStatus::Failed, JobStatus::Failed], BatchState::Failed)]
    #[case::one_running(&[JobStatus::Failed, JobStatus::Running], BatchState::Running)]
    #[case::not_started(&[JobStatus::NotStarted, JobStatus::Failed], BatchState::Running)]
    fn aggregate_failure_only_when_all_terminal_and_none_completed(
        #[case] statuses: &[JobStatus],
        #[case] expected: BatchState,
    ) {
        let mut p = progress(&["a", "b"]);
        p.observe(&report(&[("a", statuses[0]), ("b", statuses[1])]));
        assert_eq!(p.state(), expected);
    }

    #[test]
    fn first_completed_follows_caller_order() {
        let mut p = progress(&["c", "a", "b"]);
        p.observe(&report(&[
            ("a", JobStatus::Completed),
            ("b", JobStatus::Failed),
            ("c", JobStatus::Completed),
        ]));
        assert_eq!(p.first_completed().map(PluginName::as_str), Some("c"));
        let completed: Vec<_> = p.completed().map(PluginName::as_str).collect();
        assert_eq!(completed, vec!["c", "a"]);
    }

    #[test]
    fn failed_member_keeps_error_message() {
        let mut p = progress(&["a"]);
        let mut r = BatchStatusReport::default();
        r.plugins.insert(
            PluginName::new("a"),
            MemberStatus::Detailed(StatusReport::failed("volatility exited 1")),
        );

        assert!(p.observe(&r));
        let failed: Vec<_> = p.failed().collect();
        assert_eq!(failed[0].error.as_deref(), Some("volatility exited 1"));
        // same report again is not a change
        assert!(!p.observe(&r));
    }
}
