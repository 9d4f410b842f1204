use serde::{Deserialize, Serialize};

use crate::domain::JobStatus;

/// Member counts by status, for progress lines and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub not_started: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn from_statuses(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                JobStatus::NotStarted => counts.not_started += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.not_started + self.running + self.completed + self.failed
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }
}
