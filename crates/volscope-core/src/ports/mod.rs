//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。分析サービスへのアクセスと、
//! 時刻・ID 生成を trait にしてテストで差し替えられるようにしています。

pub mod analysis_api;
pub mod clock;
pub mod id_generator;

pub use self::analysis_api::AnalysisApi;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
