//! Per-engine-kind connection accounting
//!
//! Counts open connections for each engine kind against a fixed ceiling.
//! A slot is reserved before connecting and released if the connect fails.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::EngineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub max: usize,
}

pub struct EnginePools {
    max_per_engine: usize,
    active: Mutex<BTreeMap<EngineKind, usize>>,
}

impl EnginePools {
    pub fn new(max_per_engine: usize) -> Self {
        Self {
            max_per_engine,
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Claims one slot, failing with `PoolExhausted` at the ceiling
    pub async fn reserve(&self, kind: EngineKind) -> EngineResult<()> {
        let mut active = self.active.lock().await;
        let count = active.entry(kind).or_insert(0);
        if *count >= self.max_per_engine {
            return Err(EngineError::pool_exhausted(kind, self.max_per_engine));
        }
        *count += 1;
        Ok(())
    }

    /// Returns one slot. Never goes below zero.
    pub async fn release(&self, kind: EngineKind) {
        let mut active = self.active.lock().await;
        if let Some(count) = active.get_mut(&kind) {
            *count = count.saturating_sub(1);
        }
    }

    /// Stats for every engine kind, including idle ones
    pub async fn stats(&self) -> BTreeMap<EngineKind, PoolStats> {
        let active = self.active.lock().await;
        EngineKind::ALL
            .iter()
            .map(|kind| {
                let stats = PoolStats {
                    active: active.get(kind).copied().unwrap_or(0),
                    max: self.max_per_engine,
                };
                (*kind, stats)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_reservations_past_the_ceiling() {
        let pools = EnginePools::new(2);
        pools.reserve(EngineKind::Embedded).await.expect("first");
        pools.reserve(EngineKind::Embedded).await.expect("second");

        let err = pools.reserve(EngineKind::Embedded).await.expect_err("third");
        assert!(matches!(err, EngineError::PoolExhausted { max: 2, .. }));

        // Other kinds have their own budget
        pools.reserve(EngineKind::Document).await.expect("other kind");
    }

    #[tokio::test]
    async fn release_never_underflows() {
        let pools = EnginePools::new(10);
        pools.release(EngineKind::RelationalA).await;
        assert_eq!(pools.stats().await[&EngineKind::RelationalA].active, 0);

        pools.reserve(EngineKind::RelationalA).await.expect("reserve");
        pools.release(EngineKind::RelationalA).await;
        pools.release(EngineKind::RelationalA).await;
        assert_eq!(pools.stats().await[&EngineKind::RelationalA].active, 0);
    }

    #[tokio::test]
    async fn stats_cover_every_engine_kind() {
        let pools = EnginePools::new(10);
        pools.reserve(EngineKind::RelationalB).await.expect("reserve");

        let stats = pools.stats().await;
        assert_eq!(stats.len(), 4);
        assert_eq!(stats[&EngineKind::RelationalB], PoolStats { active: 1, max: 10 });
        assert_eq!(stats[&EngineKind::Embedded].active, 0);
    }
}
