//! HttpAnalysisClient - REST client for the analysis service (`/api/v1`).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::ClientConfig;
use crate::domain::{
    AnalysisId, BatchRunRequest, BatchStatusReport, Correlation, ExportFormat, JobKey,
    NewTrackedPid, OsDetection, Pid, PluginInfo, PluginName, Project, ProjectUpdate,
    RegistryHive, ResultSet, Row, RunRequest, StatusReport, SymbolFile, SymbolId, SymbolJob,
    SymbolJobId, TrackedPid, TrackedPidUpdate, UploadReceipt,
};
use crate::error::ClientError;
use crate::ports::AnalysisApi;

/// List endpoints answer either with a bare array or with the array wrapped
/// in an object under a resource-named key.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Items(Vec<T>),
    Wrapped {
        #[serde(
            alias = "uploads",
            alias = "projects",
            alias = "plugins",
            alias = "results",
            alias = "data",
            alias = "symbols",
            alias = "hives",
            alias = "keys",
            alias = "tracked_pids"
        )]
        items: Vec<T>,
    },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Items(items) | Listing::Wrapped { items } => items,
        }
    }
}

/// `GET /plugins` entries may be plain names.
#[derive(Deserialize)]
#[serde(untagged)]
enum PluginEntry {
    Name(String),
    Info(PluginInfo),
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Prefer FastAPI-style `{"detail": ...}` over the raw body.
fn error_message(body: String) -> String {
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => body,
    }
}

async fn file_part(path: &Path) -> Result<Part, ClientError> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin")
        .to_string();
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    Ok(Part::stream_with_length(body, len)
        .file_name(name)
        .mime_str("application/octet-stream")?)
}

/// Client for every endpoint the workbench uses.
///
/// Uploads stream the file from disk and are not subject to the request
/// timeout; every other call is.
#[derive(Debug, Clone)]
pub struct HttpAnalysisClient {
    client: Client,
    api_root: Url,
    timeout: Duration,
}

impl HttpAnalysisClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut api_root = Url::parse(config.base_url.trim())
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        api_root
            .path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(config.base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "v1"]);

        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            api_root,
            timeout: config.request_timeout(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.api_root.to_string()))?
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ClientError> {
        let url = self.url(segments)?;
        debug!(%method, %url, "request");
        Ok(self.client.request(method, url).timeout(self.timeout))
    }

    async fn send_raw(&self, request: RequestBuilder) -> Result<Vec<u8>, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body: error_message(body),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let bytes = self.send_raw(request).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_list<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, ClientError> {
        let listing: Listing<T> = self.send(request).await?;
        Ok(listing.into_vec())
    }

    // ----------------------------------------
    // uploads / projects
    // ----------------------------------------

    /// `POST /upload` (multipart `file`, optional `project_name`).
    pub async fn upload(
        &self,
        path: &Path,
        project_name: Option<&str>,
    ) -> Result<UploadReceipt, ClientError> {
        let mut form = Form::new().part("file", file_part(path).await?);
        if let Some(name) = project_name {
            form = form.text("project_name", name.to_string());
        }
        let url = self.url(&["upload"])?;
        debug!(%url, path = %path.display(), "uploading dump");
        self.send(self.client.post(url).multipart(form)).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ClientError> {
        self.send_list(self.request(Method::GET, &["uploads"])?)
            .await
    }

    pub async fn get_project(&self, id: &AnalysisId) -> Result<Project, ClientError> {
        self.send(self.request(Method::GET, &["uploads", id.as_str()])?)
            .await
    }

    pub async fn update_project(
        &self,
        id: &AnalysisId,
        update: &ProjectUpdate,
    ) -> Result<Project, ClientError> {
        let request = self
            .request(Method::PATCH, &["uploads", id.as_str()])?
            .json(update);
        self.send(request).await
    }

    pub async fn detect_os(&self, id: &AnalysisId) -> Result<OsDetection, ClientError> {
        self.send(self.request(Method::POST, &["detect-os", id.as_str()])?)
            .await
    }

    pub async fn list_plugins(&self) -> Result<Vec<PluginInfo>, ClientError> {
        let entries: Vec<PluginEntry> = self
            .send_list(self.request(Method::GET, &["plugins"])?)
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                PluginEntry::Name(name) => PluginInfo::named(name),
                PluginEntry::Info(info) => info,
            })
            .collect())
    }

    // ----------------------------------------
    // results / export / correlation
    // ----------------------------------------

    /// Download link for an export. Never polled.
    pub fn export_url(
        &self,
        id: &AnalysisId,
        plugin: &PluginName,
        format: ExportFormat,
    ) -> Result<Url, ClientError> {
        let mut url = self.url(&["analysis", id.as_str(), "export", plugin.as_str()])?;
        url.query_pairs_mut().append_pair("format", format.as_str());
        Ok(url)
    }

    pub async fn export(
        &self,
        id: &AnalysisId,
        plugin: &PluginName,
        format: ExportFormat,
    ) -> Result<Vec<u8>, ClientError> {
        let url = self.export_url(id, plugin, format)?;
        self.send_raw(self.client.get(url).timeout(self.timeout))
            .await
    }

    pub async fn correlate(&self, id: &AnalysisId, pid: Pid) -> Result<Correlation, ClientError> {
        let pid = pid.to_string();
        self.send(self.request(Method::GET, &["analysis", id.as_str(), "correlate", &pid])?)
            .await
    }

    // ----------------------------------------
    // tracked pids
    // ----------------------------------------

    pub async fn tracked_pids(&self, id: &AnalysisId) -> Result<Vec<TrackedPid>, ClientError> {
        self.send_list(self.request(Method::GET, &["analysis", id.as_str(), "tracked-pids"])?)
            .await
    }

    pub async fn track_pid(
        &self,
        id: &AnalysisId,
        entry: &NewTrackedPid,
    ) -> Result<(), ClientError> {
        let request = self
            .request(Method::POST, &["analysis", id.as_str(), "tracked-pids"])?
            .json(entry);
        self.send_raw(request).await.map(drop)
    }

    pub async fn update_tracked_pid(
        &self,
        id: &AnalysisId,
        pid: Pid,
        update: &TrackedPidUpdate,
    ) -> Result<(), ClientError> {
        let pid = pid.to_string();
        let request = self
            .request(Method::PATCH, &["analysis", id.as_str(), "tracked-pids", &pid])?
            .json(update);
        self.send_raw(request).await.map(drop)
    }

    pub async fn untrack_pid(&self, id: &AnalysisId, pid: Pid) -> Result<(), ClientError> {
        let pid = pid.to_string();
        let request =
            self.request(Method::DELETE, &["analysis", id.as_str(), "tracked-pids", &pid])?;
        self.send_raw(request).await.map(drop)
    }

    // ----------------------------------------
    // registry
    // ----------------------------------------

    pub async fn registry_hives(&self, id: &AnalysisId) -> Result<Vec<RegistryHive>, ClientError> {
        self.send_list(self.request(Method::GET, &["analysis", id.as_str(), "registry", "hives"])?)
            .await
    }

    pub async fn registry_keys(
        &self,
        id: &AnalysisId,
        hive_offset: u64,
        key_path: Option<&str>,
    ) -> Result<ResultSet, ClientError> {
        let mut request = self
            .request(Method::GET, &["analysis", id.as_str(), "registry", "keys"])?
            .query(&[("hive_offset", hive_offset)]);
        if let Some(path) = key_path {
            request = request.query(&[("key_path", path)]);
        }
        let rows: Vec<Row> = self.send_list(request).await?;
        Ok(ResultSet::new(rows))
    }

    // ----------------------------------------
    // symbols
    // ----------------------------------------

    /// `POST /symbols/upload-vmlinux`; ISF generation runs as a server job.
    pub async fn upload_vmlinux(&self, path: &Path) -> Result<SymbolJob, ClientError> {
        let form = Form::new().part("file", file_part(path).await?);
        let url = self.url(&["symbols", "upload-vmlinux"])?;
        self.send(self.client.post(url).multipart(form)).await
    }

    pub async fn symbol_job(&self, job_id: &SymbolJobId) -> Result<SymbolJob, ClientError> {
        self.send(self.request(Method::GET, &["symbols", "job", job_id.as_str()])?)
            .await
    }

    pub async fn list_symbols(&self) -> Result<Vec<SymbolFile>, ClientError> {
        // trailing slash is part of the route
        self.send_list(self.request(Method::GET, &["symbols", ""])?)
            .await
    }

    pub async fn upload_isf(&self, path: &Path) -> Result<(), ClientError> {
        let form = Form::new().part("file", file_part(path).await?);
        let url = self.url(&["symbols", "upload-isf"])?;
        self.send_raw(self.client.post(url).multipart(form))
            .await
            .map(drop)
    }

    pub async fn delete_symbol(&self, id: &SymbolId) -> Result<(), ClientError> {
        self.send_raw(self.request(Method::DELETE, &["symbols", id.as_str()])?)
            .await
            .map(drop)
    }
}

#[async_trait]
impl AnalysisApi for HttpAnalysisClient {
    async fn run_plugin(
        &self,
        analysis_id: &AnalysisId,
        request: &RunRequest,
    ) -> Result<(), ClientError> {
        let request = self
            .request(Method::POST, &["analysis", analysis_id.as_str(), "run"])?
            .json(request);
        self.send_raw(request).await.map(drop)
    }

    async fn run_batch(
        &self,
        analysis_id: &AnalysisId,
        request: &BatchRunRequest,
    ) -> Result<(), ClientError> {
        let request = self
            .request(Method::POST, &["analysis", analysis_id.as_str(), "run-batch"])?
            .json(request);
        self.send_raw(request).await.map(drop)
    }

    async fn job_status(&self, job: &JobKey) -> Result<StatusReport, ClientError> {
        let mut request = self
            .request(Method::GET, &["analysis", job.analysis_id.as_str(), "status"])?
            .query(&[("plugin", job.plugin.as_str())]);
        if let Some(pid) = job.pid {
            request = request.query(&[("pid", pid.get())]);
        }
        self.send(request).await
    }

    async fn batch_status(
        &self,
        analysis_id: &AnalysisId,
    ) -> Result<BatchStatusReport, ClientError> {
        self.send(self.request(Method::GET, &["analysis", analysis_id.as_str(), "status"])?)
            .await
    }

    async fn fetch_results(&self, job: &JobKey) -> Result<ResultSet, ClientError> {
        let mut request = self.request(
            Method::GET,
            &[
                "analysis",
                job.analysis_id.as_str(),
                "results",
                job.plugin.as_str(),
            ],
        )?;
        if let Some(pid) = job.pid {
            request = request.query(&[("pid", pid.get())]);
        }
        let rows: Vec<Row> = self.send_list(request).await?;
        Ok(ResultSet::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpAnalysisClient {
        HttpAnalysisClient::new(&ClientConfig {
            base_url: base.to_string(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn urls_are_rooted_at_api_v1() {
        let c = client("http://localhost:8000/");
        let url = c.url(&["analysis", "a b", "results", "windows.pslist.PsList"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/v1/analysis/a%20b/results/windows.pslist.PsList"
        );
    }

    #[test]
    fn symbol_listing_keeps_trailing_slash() {
        let c = client("https://vol.example/proxy");
        let url = c.url(&["symbols", ""]).unwrap();
        assert_eq!(url.as_str(), "https://vol.example/proxy/api/v1/symbols/");
    }

    #[test]
    fn export_url_carries_format() {
        let c = client("http://localhost:8000");
        let url = c
            .export_url(
                &AnalysisId::new("a1"),
                &PluginName::new("windows.netscan.NetScan"),
                ExportFormat::Csv,
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/v1/analysis/a1/export/windows.netscan.NetScan?format=csv"
        );
    }

    #[test]
    fn error_detail_is_extracted() {
        assert_eq!(
            error_message(r#"{"detail":"Analysis not found"}"#.to_string()),
            "Analysis not found"
        );
        assert_eq!(error_message("Bad Gateway".to_string()), "Bad Gateway");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpAnalysisClient::new(&ClientConfig {
            base_url: "not a url".to_string(),
            ..ClientConfig::default()
        });
        assert!(matches!(err, Err(ClientError::InvalidUrl(_))));
    }
}
