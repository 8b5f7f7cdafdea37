//! IdGenerator port - ドキュメント ID の生成
//!
//! endpoint 名（`host-<doc>` / `worker-<doc>`）の元になる ID を作る。
//! callId / streamId は endpoint 内の連番なのでここでは扱わない。

use crate::domain::DocumentId;
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_document_id(&self) -> DocumentId;
}

/// UlidGenerator は Clock の時刻 + 乱数で ULID を作る
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_document_id(&self) -> DocumentId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        DocumentId::from(ulid)
    }
}
