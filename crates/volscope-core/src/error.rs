use thiserror::Error;

use crate::domain::{AnalysisId, BatchMember, JobKey, Pid, PluginName};

/// Shown when a job fails without an error message from the service.
pub const GENERIC_FAILURE: &str = "plugin execution failed";

/// Server message, or [`GENERIC_FAILURE`] when it is missing or blank.
fn failure_text(message: Option<&str>) -> &str {
    message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(GENERIC_FAILURE)
}

/// Errors from talking to the analysis service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Other(String),
}

/// Why a poller stopped without a result.
///
/// Every variant is terminal for that poller; a new run starts a new poller.
#[derive(Debug, Error)]
pub enum PollError {
    /// Status query or result fetch failed in transport.
    #[error("{job}: {source}")]
    Transport {
        job: String,
        #[source]
        source: ClientError,
    },

    /// The service reported `failed`.
    #[error("{job} failed: {}", failure_text(.message.as_deref()))]
    JobFailed { job: JobKey, message: Option<String> },

    /// Every batch member is terminal and none completed.
    #[error("all {} plugins failed for {analysis_id}", .members.len())]
    BatchFailed {
        analysis_id: AnalysisId,
        members: Vec<BatchMember>,
    },

    /// The owning handle was cancelled or dropped.
    #[error("polling cancelled")]
    Cancelled,
}

/// Errors from session-level operations (submit, then poll).
#[derive(Debug, Error)]
pub enum SessionError {
    /// A poller for this plugin and pid has not reached a terminal state yet.
    #[error("{plugin} is already running for pid {pid}")]
    AlreadyRunning { plugin: PluginName, pid: Pid },

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl PollError {
    /// Message suitable for showing to the analyst.
    pub fn user_message(&self) -> String {
        match self {
            PollError::JobFailed { message, .. } => failure_text(message.as_deref()).to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn job_failure_uses_server_message_or_fallback() {
        let job = JobKey::new(AnalysisId::new("a"), PluginName::new("windows.info.Info"));
        let with_message = PollError::JobFailed {
            job: job.clone(),
            message: Some("volatility exited 1".to_string()),
        };
        let without = PollError::JobFailed { job, message: None };

        assert_eq!(with_message.user_message(), "volatility exited 1");
        assert_eq!(without.user_message(), GENERIC_FAILURE);
        assert_eq!(
            without.to_string(),
            format!("a/windows.info.Info failed: {GENERIC_FAILURE}")
        );
    }

    #[rstest]
    #[case::empty("")]
    #[case::whitespace("  \n")]
    fn blank_server_message_falls_back(#[case] blank: &str) {
        let err = PollError::JobFailed {
            job: JobKey::new(AnalysisId::new("a"), PluginName::new("windows.info.Info")),
            message: Some(blank.to_string()),
        };
        assert_eq!(err.user_message(), GENERIC_FAILURE);
        assert!(err.to_string().ends_with(GENERIC_FAILURE));
    }

    #[test]
    fn transport_error_is_surfaced_verbatim() {
        let err = PollError::Transport {
            job: "a/windows.info.Info".to_string(),
            source: ClientError::Other("connection reset by peer".to_string()),
        };
        assert!(err.user_message().contains("connection reset by peer"));
    }
}
