//! volscope-core
//!
//! Client-side building blocks for a memory-forensics analysis service.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job status, batch, result set, service records）
//! - **ports**: 抽象化レイヤー（AnalysisApi, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（JobPoller, BatchPoller, PidPollerSet, AnalysisSession）
//! - **impls**: 実装（HttpAnalysisClient、開発用の ScriptedAnalysisApi）
//! - **config**: 接続先と poll interval の設定
//! - **error**: エラー型
//! - **observability**: 進捗集計

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
