//! App - アプリケーション層
//!
//! ports（`AnalysisApi`, `IdGenerator`）を組み合わせて polling を実装します。
//!
//! # 主要コンポーネント
//! - **PollHandle**: poller task の所有権（cancel / drop で停止）
//! - **JobPoller**: 単一 job の status polling
//! - **BatchPoller**: batch の集約 status polling
//! - **PidPollerSet**: 1 プロセスに対する plugin ごとの poller 群
//! - **AnalysisSession**: run の送信と polling 開始をまとめた入口

pub mod batch_poller;
pub mod handle;
pub mod pid_pollers;
pub mod poller;
pub mod session;

// 主要な型を再エクスポート
pub use self::batch_poller::{BatchOutcome, BatchPoller};
pub use self::handle::PollHandle;
pub use self::pid_pollers::PidPollerSet;
pub use self::poller::{JobPoller, PollConfig};
pub use self::session::AnalysisSession;
