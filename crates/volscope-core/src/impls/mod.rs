//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **HttpAnalysisClient**: 本番用の REST クライアント（reqwest）
//! - **ScriptedAnalysisApi**: 開発・テスト用の in-memory サービス

pub mod http;
pub mod scripted;

pub use self::http::HttpAnalysisClient;
pub use self::scripted::{ScriptedAnalysisApi, Step, batch_report};
