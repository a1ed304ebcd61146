//! Repository seam over position persistence.
//!
//! The orchestrator only talks to [`PositionStore`]; production wires the
//! SQLite-backed [`crate::db::Database`], tests and dry runs use
//! [`MemoryStore`]. Every update replaces the whole record atomically so
//! concurrent background monitors never observe a half-written position.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::Position;

/// Persistence boundary for positions.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persist a new position. A position only exists after a confirmed
    /// base fill, so insert is always post-confirmation.
    async fn insert(&self, position: &Position) -> Result<()>;

    async fn get(&self, position_id: &str) -> Result<Option<Position>>;

    /// Replace the stored record in one atomic step.
    async fn update(&self, position: &Position) -> Result<()>;

    /// All open (active or partially closed) positions.
    async fn list_active(&self) -> Result<Vec<Position>>;

    /// Open positions for one owner.
    async fn list_active_for(&self, owner_id: &str) -> Result<Vec<Position>>;
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: RwLock<HashMap<String, Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn get(&self, position_id: &str) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(position_id).cloned())
    }

    async fn update(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect())
    }

    async fn list_active_for(&self, owner_id: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open() && p.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionSide, PositionStatus};
    use crate::trading::config::DcaConfig;
    use rust_decimal_macros::dec;

    fn sample_position(owner: &str) -> Position {
        Position::open(
            owner,
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            &DcaConfig::default(),
            &[],
            None,
        )
    }

    #[tokio::test]
    async fn round_trips_positions() {
        let store = MemoryStore::new();
        let position = sample_position("user-1");

        store.insert(&position).await.unwrap();
        let loaded = store.get(&position.id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, "BTCUSDT");
        assert_eq!(loaded.avg_entry, dec!(100));
    }

    #[tokio::test]
    async fn list_active_excludes_closed() {
        let store = MemoryStore::new();
        let mut position = sample_position("user-1");
        store.insert(&position).await.unwrap();

        position.close_remaining(dec!(99), PositionStatus::Cancelled);
        store.update(&position).await.unwrap();

        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn list_active_for_filters_by_owner() {
        let store = MemoryStore::new();
        store.insert(&sample_position("user-1")).await.unwrap();
        store.insert(&sample_position("user-2")).await.unwrap();

        assert_eq!(store.list_active_for("user-1").await.unwrap().len(), 1);
        assert_eq!(store.list_active().await.unwrap().len(), 2);
    }
}
