//! IdGenerator port - attempt id 生成の抽象化
//!
//! poll 1 回分（= job attempt の観測 1 回分）に ULID を振って、
//! ログの相関に使います。サーバー側の ID とは無関係です。

use ulid::Ulid;

use crate::domain::ids::AttemptId;
use crate::ports::Clock;

/// IdGenerator は attempt id を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数の poller task から使える）
pub trait IdGenerator: Send + Sync {
    fn generate_attempt_id(&self) -> AttemptId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_attempt_id(&self) -> AttemptId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        AttemptId::from(ulid)
    }
}
