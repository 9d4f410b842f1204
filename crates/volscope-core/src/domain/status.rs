//! Job status state machine.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::PluginName;

/// Status of one plugin execution as reported by the service.
///
/// State transitions:
/// - NotStarted -> Running -> Completed
/// - NotStarted -> Running -> Failed
///
/// The client only observes these; a re-run starts a new attempt under the
/// same identifier rather than leaving a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::NotStarted => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Fold a new observation into the current status.
    ///
    /// Observations that would move backwards (e.g. a stale `running` arriving
    /// after `completed`) are ignored, and a terminal status never changes.
    pub fn advance(self, observed: JobStatus) -> JobStatus {
        if self.is_terminal() || observed.rank() < self.rank() {
            self
        } else {
            observed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response of the single-job status endpoint: `{status, error?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// One entry of the aggregate status map.
///
/// The service sends either a bare status string or a full `{status, error?}`
/// object per plugin; both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberStatus {
    Bare(JobStatus),
    Detailed(StatusReport),
}

impl MemberStatus {
    pub fn status(&self) -> JobStatus {
        match self {
            MemberStatus::Bare(status) => *status,
            MemberStatus::Detailed(report) => report.status,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            MemberStatus::Bare(_) => None,
            MemberStatus::Detailed(report) => report.error.as_deref(),
        }
    }
}

/// Response of the aggregate status endpoint: `{plugins: {name: status}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    #[serde(default)]
    pub plugins: HashMap<PluginName, MemberStatus>,
}

impl BatchStatusReport {
    pub fn status_of(&self, plugin: &PluginName) -> JobStatus {
        self.plugins
            .get(plugin)
            .map(MemberStatus::status)
            .unwrap_or_default()
    }
}
