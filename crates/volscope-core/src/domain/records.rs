//! Records exchanged with the analysis service (projects, plugins, symbols, ...).
//!
//! These are intentionally flexible. Fields the client does not interpret are
//! kept in an `extra` map so nothing the service sends is dropped on display.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::ids::{AnalysisId, Pid, PluginName, SymbolId, SymbolJobId};

pub type Extra = serde_json::Map<String, serde_json::Value>;

/// Cross-plugin correlation for one process, computed server-side.
pub type Correlation = serde_json::Value;

/// Accepts RFC 3339 or a naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` (taken as UTC),
/// optionally suffixed with ` UTC` as plugin output prints it.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let raw = raw.strip_suffix(" UTC").unwrap_or(raw);
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// [`parse_timestamp`] for serde. Anything unparseable becomes `None`
/// rather than failing the whole record.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// Response of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub analysis_id: AnalysisId,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An uploaded dump and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(alias = "analysis_id")]
    pub id: AnalysisId,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Project {
    /// Project name, falling back to the uploaded filename, then the id.
    pub fn display_name(&self) -> String {
        self.project_name
            .clone()
            .or_else(|| self.filename.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Body of `PATCH /uploads/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
}

impl ProjectUpdate {
    pub fn is_empty(&self) -> bool {
        self.project_name.is_none() && self.os_type.is_none()
    }
}

/// Response of `POST /detect-os/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsDetection {
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An available analysis plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: PluginName,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "os_type")]
    pub os: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl PluginInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: PluginName::new(name),
            description: None,
            os: None,
            extra: Extra::new(),
        }
    }
}

/// Body of `POST /analysis/{id}/run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub plugin: PluginName,
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

/// Body of `POST /analysis/{id}/run-batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRunRequest {
    pub plugins: Vec<PluginName>,
    pub force: bool,
}

/// Download format for `GET /analysis/{id}/export/{plugin}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

/// A process the analyst pinned for follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPid {
    pub pid: Pid,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Body of `POST /analysis/{id}/tracked-pids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrackedPid {
    pub pid: Pid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Body of `PATCH /analysis/{id}/tracked-pids/{pid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPidUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A registry hive found in the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryHive {
    #[serde(alias = "hive_offset", alias = "Offset")]
    pub offset: u64,
    #[serde(default, alias = "FileFullPath", alias = "path")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A server-side symbol generation job (vmlinux → ISF).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolJob {
    #[serde(alias = "job_id")]
    pub id: SymbolJobId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl SymbolJob {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed" | "failed" | "error")
        )
    }
}

/// A stored symbol table (ISF).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFile {
    pub id: SymbolId,
    #[serde(default, alias = "filename")]
    pub name: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn project_accepts_naive_and_rfc3339_timestamps() {
        let naive: Project = serde_json::from_value(json!({
            "id": 7,
            "filename": "win10.raw",
            "created_at": "2024-01-01T12:00:00.123456"
        }))
        .unwrap();
        assert_eq!(naive.id.as_str(), "7");
        assert_eq!(
            naive.created_at.map(|t| t.timestamp()),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap().timestamp())
        );
        assert_eq!(naive.display_name(), "win10.raw");

        let bogus: Project = serde_json::from_value(json!({
            "analysis_id": "x",
            "created_at": "yesterday",
            "status": "ready"
        }))
        .unwrap();
        assert!(bogus.created_at.is_none());
        assert_eq!(bogus.extra["status"], "ready");
    }

    #[test]
    fn plugin_style_timestamps_parse() {
        let expected = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(parse_timestamp("2021-03-04 05:06:07.000000 UTC"), Some(expected));
        assert_eq!(parse_timestamp("2021-03-04 05:06:07"), Some(expected));
        assert_eq!(parse_timestamp("2021-03-04T05:06:07+00:00"), Some(expected));
        assert_eq!(parse_timestamp("N/A"), None);
    }

    #[test]
    fn symbol_job_is_finished_on_terminal_status() {
        let job = |status: Option<&str>| SymbolJob {
            id: SymbolJobId::new("j-1"),
            status: status.map(str::to_string),
            error: None,
            extra: Extra::new(),
        };
        assert!(job(Some("completed")).is_finished());
        assert!(job(Some("error")).is_finished());
        assert!(!job(Some("running")).is_finished());
        assert!(!job(None).is_finished());
    }

    #[test]
    fn run_request_omits_pid_when_absent() {
        let body = RunRequest {
            plugin: PluginName::new("windows.pslist.PsList"),
            force: false,
            pid: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({ "plugin": "windows.pslist.PsList", "force": false })
        );
    }

    #[test]
    fn empty_project_update_serializes_to_empty_object() {
        let update = ProjectUpdate::default();
        assert!(update.is_empty());
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({}));
    }

    #[test]
    fn export_format_parses_case_insensitively() {
        assert_eq!("CSV".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
