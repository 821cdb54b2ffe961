use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::store::{KvStore, StoreError};
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    Open,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub message_id: String,
    pub account: String,
    pub reason: String,
    pub flagged_at: Timestamp,
    pub status: ReviewStatus,
}

/// Messages held back for a human decision.
pub struct ReviewQueue {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

fn review_key(message_id: &str) -> String {
    format!("review/{}", message_id)
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Opens a review for the message unless one already exists.
    pub async fn submit(&self, message_id: &str, account: &str, reason: &str) -> Result<bool, StoreError> {
        let entry = ReviewEntry {
            message_id: message_id.to_string(),
            account: account.to_string(),
            reason: reason.to_string(),
            flagged_at: self.clock.now_ms(),
            status: ReviewStatus::Open,
        };
        let created = self
            .store
            .compare_and_swap(&review_key(message_id), None, serde_json::to_vec(&entry)?)
            .await?;
        if created {
            info!("Message {} sent to manual review: {}", message_id, reason);
        }
        Ok(created)
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<ReviewEntry>, StoreError> {
        match self.store.get(&review_key(message_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn open(&self) -> Result<Vec<ReviewEntry>, StoreError> {
        let mut out = Vec::new();
        for (_, raw) in self.store.scan_prefix("review/").await? {
            let entry: ReviewEntry = serde_json::from_slice(&raw)?;
            if entry.status == ReviewStatus::Open {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Records the reviewer's decision on an open entry.
    pub async fn decide(&self, message_id: &str, approve: bool) -> Result<bool, StoreError> {
        let key = review_key(message_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut entry: ReviewEntry = serde_json::from_slice(&raw)?;
        if entry.status != ReviewStatus::Open {
            return Ok(false);
        }
        entry.status = if approve {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Rejected
        };
        let decided = self
            .store
            .compare_and_swap(&key, Some(&raw), serde_json::to_vec(&entry)?)
            .await?;
        if decided {
            info!("Review for {} closed: {:?}", message_id, entry.status);
        }
        Ok(decided)
    }
}
