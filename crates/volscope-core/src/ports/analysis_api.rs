//! AnalysisApi port - pollers が依存する最小限のサービス操作
//!
//! 本番は `impls::HttpAnalysisClient`（REST）、テストとデモは
//! `impls::ScriptedAnalysisApi`（in-memory）が実装します。

use async_trait::async_trait;

use crate::domain::{
    AnalysisId, BatchRunRequest, BatchStatusReport, JobKey, ResultSet, RunRequest, StatusReport,
};
use crate::error::ClientError;

/// Job submission and observation.
///
/// # 設計原則
/// - job の状態はサーバーが持つ。client は観測するだけ
/// - どのメソッドも retry しない（失敗は呼び出し側で terminal 扱い）
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    /// `POST /analysis/{id}/run`
    async fn run_plugin(
        &self,
        analysis_id: &AnalysisId,
        request: &RunRequest,
    ) -> Result<(), ClientError>;

    /// `POST /analysis/{id}/run-batch`
    async fn run_batch(
        &self,
        analysis_id: &AnalysisId,
        request: &BatchRunRequest,
    ) -> Result<(), ClientError>;

    /// `GET /analysis/{id}/status?plugin=&pid=`
    async fn job_status(&self, job: &JobKey) -> Result<StatusReport, ClientError>;

    /// `GET /analysis/{id}/status`
    async fn batch_status(&self, analysis_id: &AnalysisId)
    -> Result<BatchStatusReport, ClientError>;

    /// `GET /analysis/{id}/results/{plugin}?pid=`
    async fn fetch_results(&self, job: &JobKey) -> Result<ResultSet, ClientError>;
}
