//! Per-account fixed-window rate limiting.
//!
//! Counters live in the shared store and are bumped with compare-and-swap,
//! so every relayer process sees the same window. A second heuristic flags
//! unusual volume or destination spread for manual review rather than
//! rejecting outright.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::store::{KvStore, StoreError};
use crate::types::{ChainId, Timestamp};

pub mod review;

pub use review::{ReviewEntry, ReviewQueue, ReviewStatus};

const CAS_RETRIES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_per_window: u32,
    /// A single transfer above this goes to review.
    pub max_single_amount: u128,
    /// Cumulative amount per window above this goes to review.
    pub max_window_volume: u128,
    /// More distinct destinations than this per window goes to review.
    pub max_destinations_per_window: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 10,
            max_single_amount: u128::MAX,
            max_window_volume: u128::MAX,
            max_destinations_per_window: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub account: String,
    pub window_start: Timestamp,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActivityRecord {
    window_start: Timestamp,
    volume: u128,
    destinations: BTreeSet<ChainId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reset_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Clear,
    Review(String),
}

pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window_ms(&self) -> u64 {
        self.config.window.as_millis() as u64
    }

    /// Counts one request for `account` and reports whether it fits in the
    /// current window.
    pub async fn can_proceed(&self, account: &str, max_per_window: u32) -> Result<RateDecision, StoreError> {
        let key = format!("rate/{}", account);
        let window = self.window_ms();
        for _ in 0..CAS_RETRIES {
            let now = self.clock.now_ms();
            let current = self.store.get(&key).await?;
            let mut record = match &current {
                Some(raw) => serde_json::from_slice::<RateLimitRecord>(raw)?,
                None => RateLimitRecord {
                    account: account.to_string(),
                    window_start: now,
                    count: 0,
                },
            };
            if now.saturating_sub(record.window_start) >= window {
                record.window_start = now;
                record.count = 0;
            }
            let reset_at = record.window_start + window;
            if record.count >= max_per_window {
                debug!("Account {} over quota ({}), resets at {}", account, record.count, reset_at);
                return Ok(RateDecision {
                    allowed: false,
                    reset_at,
                });
            }
            record.count += 1;
            let encoded = serde_json::to_vec(&record)?;
            if self
                .store
                .compare_and_swap(&key, current.as_deref(), encoded)
                .await?
            {
                return Ok(RateDecision {
                    allowed: true,
                    reset_at,
                });
            }
        }
        Err(StoreError::Contention(key))
    }

    /// Records the transfer and checks it against the velocity and
    /// destination heuristics.
    pub async fn flag_suspicious(
        &self,
        account: &str,
        amount: u128,
        dest_chain: ChainId,
    ) -> Result<ReviewVerdict, StoreError> {
        if amount > self.config.max_single_amount {
            warn!("Account {} sent {} in one transfer", account, amount);
            return Ok(ReviewVerdict::Review(format!(
                "amount {} exceeds single transfer ceiling {}",
                amount, self.config.max_single_amount
            )));
        }

        let key = format!("activity/{}", account);
        let window = self.window_ms();
        for _ in 0..CAS_RETRIES {
            let now = self.clock.now_ms();
            let current = self.store.get(&key).await?;
            let mut record = match &current {
                Some(raw) => serde_json::from_slice::<ActivityRecord>(raw)?,
                None => ActivityRecord {
                    window_start: now,
                    volume: 0,
                    destinations: BTreeSet::new(),
                },
            };
            if now.saturating_sub(record.window_start) >= window {
                record = ActivityRecord {
                    window_start: now,
                    volume: 0,
                    destinations: BTreeSet::new(),
                };
            }
            record.volume = record.volume.saturating_add(amount);
            record.destinations.insert(dest_chain);

            let verdict = if record.volume > self.config.max_window_volume {
                ReviewVerdict::Review(format!(
                    "window volume {} exceeds {}",
                    record.volume, self.config.max_window_volume
                ))
            } else if record.destinations.len() > self.config.max_destinations_per_window {
                ReviewVerdict::Review(format!(
                    "{} destination chains in one window",
                    record.destinations.len()
                ))
            } else {
                ReviewVerdict::Clear
            };

            let encoded = serde_json::to_vec(&record)?;
            if self
                .store
                .compare_and_swap(&key, current.as_deref(), encoded)
                .await?
            {
                if let ReviewVerdict::Review(reason) = &verdict {
                    warn!("Account {} flagged: {}", account, reason);
                }
                return Ok(verdict);
            }
        }
        Err(StoreError::Contention(key))
    }
}
