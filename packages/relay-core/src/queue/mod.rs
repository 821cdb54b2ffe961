//! Durable message lifecycle and executed-digest ledger.
//!
//! Key spaces:
//! - `msg/{id}`    message record
//! - `item/{id}`   relay queue item (attempts, retry schedule, digest)
//! - `att/{id}`    serialized attestation
//! - `exec/{hex}`  executed marker, the single commit point for execution
//!
//! A message whose attestation digest has an executed marker naming it reads
//! back as `Executed` even if its own record has not been rewritten yet, so
//! the marker and the status are never observed apart.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::codec::Attestation;
use crate::store::{KvStore, StoreError};
use crate::types::{Digest, FailureReason, Message, MessageStatus, RelayQueueItem, Timestamp};

const CAS_RETRIES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub message_id: String,
    pub executed_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Attempt number `n` (1-based) has been recorded.
    Recorded(u32),
    /// `max_attempts` (the count carried) was already reached; the
    /// message has been failed.
    Exhausted(u32),
}

pub struct RelayQueue {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

fn msg_key(id: &str) -> String {
    format!("msg/{}", id)
}

fn item_key(id: &str) -> String {
    format!("item/{}", id)
}

fn att_key(id: &str) -> String {
    format!("att/{}", id)
}

fn exec_key(digest: &Digest) -> String {
    format!("exec/{}", digest.to_hex())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

impl RelayQueue {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_attempts,
        }
    }

    /// Adds a new `Pending` message. Returns `false` if it is already known.
    ///
    /// The message record is created first and the queue item second, so a
    /// call that failed halfway is completed by calling again.
    pub async fn enqueue(&self, message: &Message) -> Result<bool, StoreError> {
        let mut message = message.clone();
        message.status = MessageStatus::Pending;
        message.failure_reason = None;

        let created = self
            .store
            .compare_and_swap(&msg_key(&message.id), None, encode(&message)?)
            .await?;
        let item = RelayQueueItem::new(message.id.clone(), self.max_attempts);
        let item_created = self
            .store
            .compare_and_swap(&item_key(&message.id), None, encode(&item)?)
            .await?;

        if !created {
            if item_created {
                warn!("Restored missing queue item for {}", message.id);
            }
            debug!("Message {} already queued", message.id);
            return Ok(false);
        }
        info!("Queued message {} (sequence {})", message.id, message.sequence);
        Ok(true)
    }

    /// Loads a message, folding in a committed execution marker. The
    /// marker wins over whatever status the record still carries.
    pub async fn message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let Some(raw) = self.store.get(&msg_key(id)).await? else {
            return Ok(None);
        };
        let mut message: Message = decode(&raw)?;
        if message.status != MessageStatus::Executed && self.executed_by(id).await? {
            message.status = MessageStatus::Executed;
            message.failure_reason = None;
        }
        Ok(Some(message))
    }

    pub async fn item(&self, id: &str) -> Result<Option<RelayQueueItem>, StoreError> {
        match self.store.get(&item_key(id)).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn attestation(&self, id: &str) -> Result<Option<Attestation>, StoreError> {
        match self.store.get(&att_key(id)).await? {
            Some(raw) => Attestation::parse(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Stores the verified attestation and links its digest to the item.
    pub async fn attach_attestation(&self, id: &str, attestation: &Attestation) -> Result<(), StoreError> {
        self.store.put(&att_key(id), attestation.serialize()).await?;
        let digest = attestation.digest();
        self.update_item(id, |item| {
            item.attestation_digest = Some(digest);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Advances a message one step: `Pending -> Attested` or
    /// `Attested -> Relaying`. Returns `false` if another worker got there
    /// first or the message is in any other status.
    pub async fn claim(&self, id: &str) -> Result<bool, StoreError> {
        match self.message(id).await? {
            Some(message) => self.claim_from(id, message.status).await,
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Compare-and-swap claim that only succeeds from `expected`.
    pub async fn claim_from(&self, id: &str, expected: MessageStatus) -> Result<bool, StoreError> {
        let next = match expected {
            MessageStatus::Pending => MessageStatus::Attested,
            MessageStatus::Attested => MessageStatus::Relaying,
            _ => return Ok(false),
        };
        let key = msg_key(id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut message: Message = decode(&raw)?;
        if message.status != expected {
            return Ok(false);
        }
        message.status = next;
        let claimed = self
            .store
            .compare_and_swap(&key, Some(&raw), encode(&message)?)
            .await?;
        if claimed {
            debug!("Claimed {}: {} -> {}", id, expected, next);
        }
        Ok(claimed)
    }

    pub async fn is_executed(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.store.get(&exec_key(digest)).await?.is_some())
    }

    /// Writes the executed marker for `digest`. Returns `false` if the
    /// digest was already executed.
    pub async fn mark_executed(&self, digest: &Digest, message_id: &str) -> Result<bool, StoreError> {
        let record = ExecutionRecord {
            message_id: message_id.to_string(),
            executed_at: self.clock.now_ms(),
        };
        self.store
            .compare_and_swap(&exec_key(digest), None, encode(&record)?)
            .await
    }

    /// Commits a confirmed execution: the marker first (atomic), then the
    /// message record catches up.
    pub async fn commit_executed(&self, id: &str, digest: &Digest) -> Result<bool, StoreError> {
        if !self.mark_executed(digest, id).await? {
            warn!("Digest {} was already executed, not committing {}", digest, id);
            return Ok(false);
        }
        if let Err(e) = self.finalize_executed(id).await {
            // The marker already makes the message read as executed.
            warn!("Executed marker for {} written but record not updated: {}", id, e);
        }
        info!("Message {} executed ({})", id, digest);
        Ok(true)
    }

    /// Brings the record in line with the marker. The transaction is on
    /// chain, so this overrides any status the record reached meanwhile.
    async fn finalize_executed(&self, id: &str) -> Result<(), StoreError> {
        let mut previous = MessageStatus::Executed;
        self.update_message(id, |message| {
            previous = message.status;
            if message.status == MessageStatus::Executed {
                return Ok(false);
            }
            message.status = MessageStatus::Executed;
            message.failure_reason = None;
            Ok(true)
        })
        .await?;
        if previous != MessageStatus::Relaying && previous != MessageStatus::Executed {
            warn!("Message {} was {} when its execution was committed", id, previous);
        }
        Ok(())
    }

    async fn executed_by(&self, id: &str) -> Result<bool, StoreError> {
        let Some(item) = self.item(id).await? else {
            return Ok(false);
        };
        let Some(digest) = item.attestation_digest else {
            return Ok(false);
        };
        match self.store.get(&exec_key(&digest)).await? {
            Some(raw) => Ok(decode::<ExecutionRecord>(&raw)?.message_id == id),
            None => Ok(false),
        }
    }

    /// Counts a submission attempt. Once `max_attempts` is reached the
    /// message is failed instead.
    pub async fn record_attempt(&self, id: &str) -> Result<AttemptOutcome, StoreError> {
        let mut outcome = AttemptOutcome::Exhausted(0);
        self.update_item(id, |item| {
            if item.attempts_exhausted() {
                outcome = AttemptOutcome::Exhausted(item.attempts);
            } else {
                item.attempts += 1;
                outcome = AttemptOutcome::Recorded(item.attempts);
            }
            Ok(())
        })
        .await?;
        if let AttemptOutcome::Exhausted(_) = outcome {
            self.fail(id, FailureReason::MaxAttemptsExceeded).await?;
        }
        Ok(outcome)
    }

    /// Puts a message back in the queue until `until`.
    pub async fn defer(&self, id: &str, until: Timestamp) -> Result<(), StoreError> {
        self.update_item(id, |item| {
            item.next_retry_at = until;
            Ok(())
        })
        .await?;
        debug!("Deferred {} until {}", id, until);
        Ok(())
    }

    /// Moves a non-terminal message to `Failed`. Returns `false` if the
    /// message had already reached a terminal status. A `Relaying` message
    /// belongs to the relayer that claimed it; only that relayer fails it.
    pub async fn fail(&self, id: &str, reason: FailureReason) -> Result<bool, StoreError> {
        self.terminate(id, MessageStatus::Failed, Some(reason)).await
    }

    async fn terminate(
        &self,
        id: &str,
        status: MessageStatus,
        reason: Option<FailureReason>,
    ) -> Result<bool, StoreError> {
        if self.executed_by(id).await? {
            return Ok(false);
        }
        let changed = self
            .update_message(id, |message| {
                if message.status.is_terminal() {
                    return Ok(false);
                }
                // 中继中的消息由持有者收尾，过期清理不能抢走
                if status == MessageStatus::Expired && message.status == MessageStatus::Relaying {
                    return Ok(false);
                }
                message.status = status;
                message.failure_reason = reason.clone();
                Ok(true)
            })
            .await?;
        if changed {
            match &reason {
                Some(reason) => warn!("Message {} -> {}: {}", id, status, reason),
                None => warn!("Message {} -> {}", id, status),
            }
        }
        Ok(changed)
    }

    /// Applies a forward transition, rejecting anything the state machine
    /// does not allow.
    pub async fn transition(&self, id: &str, next: MessageStatus) -> Result<(), StoreError> {
        self.update_message(id, |message| {
            if !message.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id: message.id.clone(),
                    from: message.status,
                    to: next,
                });
            }
            message.status = next;
            Ok(true)
        })
        .await
        .map(|_| ())
    }

    /// Expires every non-terminal message older than `ttl`, except those a
    /// relayer is currently submitting.
    pub async fn expire_stale(&self, ttl: Duration) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let mut expired = Vec::new();
        for message in self.messages().await? {
            if message.status.is_terminal()
                || message.status == MessageStatus::Relaying
                || message.created_at.saturating_add(ttl_ms) > now
            {
                continue;
            }
            if self.terminate(&message.id, MessageStatus::Expired, None).await? {
                expired.push(message.id);
            }
        }
        Ok(expired)
    }

    pub async fn messages(&self) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::new();
        for (key, _) in self.store.scan_prefix("msg/").await? {
            let id = &key["msg/".len()..];
            if let Some(message) = self.message(id).await? {
                out.push(message);
            }
        }
        Ok(out)
    }

    pub async fn pending(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages()
            .await?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .collect())
    }

    /// `Attested` messages whose retry time has come.
    pub async fn due(&self, now: Timestamp) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::new();
        for message in self.messages().await? {
            if message.status != MessageStatus::Attested {
                continue;
            }
            if let Some(item) = self.item(&message.id).await? {
                if item.next_retry_at <= now {
                    out.push(message);
                }
            }
        }
        Ok(out)
    }

    async fn update_message<F>(&self, id: &str, mut f: F) -> Result<bool, StoreError>
    where
        F: FnMut(&mut Message) -> Result<bool, StoreError>,
    {
        self.update(&msg_key(id), |message: &mut Message| f(message)).await
    }

    async fn update_item<F>(&self, id: &str, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&mut RelayQueueItem) -> Result<(), StoreError>,
    {
        self.update(&item_key(id), |item: &mut RelayQueueItem| {
            f(item)?;
            Ok(true)
        })
        .await
        .map(|_| ())
    }

    /// Read-modify-CAS loop. `f` returns whether it changed the record.
    async fn update<T, F>(&self, key: &str, mut f: F) -> Result<bool, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut T) -> Result<bool, StoreError>,
    {
        for _ in 0..CAS_RETRIES {
            let raw = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let mut value: T = decode(&raw)?;
            if !f(&mut value)? {
                return Ok(false);
            }
            if self
                .store
                .compare_and_swap(key, Some(&raw), encode(&value)?)
                .await?
            {
                return Ok(true);
            }
        }
        Err(StoreError::Contention(key.to_string()))
    }
}
