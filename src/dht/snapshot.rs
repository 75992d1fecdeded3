use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::DhtError;
use super::node::{Node, NodeId};

/// Durable image of a routing table: the owner id and every non-empty
/// bucket with both of its lists, front (most recent) first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub owner_id: NodeId,
    /// Unix seconds.
    pub saved_at: u64,
    pub buckets: Vec<BucketSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub index: usize,
    /// Unix seconds.
    pub last_updated: u64,
    pub active: Vec<Node>,
    pub candidates: Vec<Node>,
}

impl TableSnapshot {
    pub async fn load(path: &Path) -> Result<Self, DhtError> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Writes to a sibling temp file first so a crash mid-write never
    /// leaves a truncated snapshot behind.
    pub async fn save(&self, path: &Path) -> Result<(), DhtError> {
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.buckets.iter().map(|b| b.active.len()).sum()
    }

    pub fn candidate_count(&self) -> usize {
        self.buckets.iter().map(|b| b.candidates.len()).sum()
    }

    pub fn bucket(&self, index: usize) -> Option<&BucketSnapshot> {
        self.buckets.iter().find(|b| b.index == index)
    }
}

pub(crate) fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
