use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::chain_adapter::{AdapterError, AdapterRegistry, ChainAdapter, Submission, TxHash, TxStatus};
use crate::codec::Attestation;
use crate::queue::{AttemptOutcome, RelayQueue};
use crate::rate_limit::{RateLimiter, ReviewQueue, ReviewStatus, ReviewVerdict};
use crate::retry::BackoffPolicy;
use crate::store::StoreError;
use crate::types::{ChainId, FailureReason, Message, MessageStatus, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Attestation does not match message {0}")]
    Mismatch(String),

    #[error("No adapter for destination chain {0}")]
    NoAdapter(ChainId),

    #[error("Permanent failure relaying {message_id}: {source}")]
    Permanent { message_id: String, source: AdapterError },

    #[error("Gave up on {message_id} after {attempts} attempts, last error: {last}")]
    MaxAttemptsExceeded {
        message_id: String,
        attempts: u32,
        last: AdapterError,
    },

    #[error("No attempts left for {message_id} ({attempts} already used)")]
    AttemptsExhausted { message_id: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Executed { attempts: u32, tx: TxHash },
    /// The digest was executed before; nothing was submitted.
    AlreadyExecuted,
    /// Sender over quota; the item is back in the queue until `retry_at`.
    Deferred { retry_at: Timestamp },
    UnderReview(String),
    Rejected,
    /// The message was not `Attested` or another worker claimed it.
    NotClaimed,
}

#[derive(Debug, Clone)]
pub struct RelayerSettings {
    pub backoff: BackoffPolicy,
    /// Budget for one submit-and-confirm attempt.
    pub attempt_timeout: Duration,
    pub confirm_poll_interval: Duration,
}

impl Default for RelayerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            confirm_poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct Relayer {
    queue: Arc<RelayQueue>,
    adapters: AdapterRegistry,
    limiter: Arc<RateLimiter>,
    reviews: Arc<ReviewQueue>,
    settings: RelayerSettings,
}

impl Relayer {
    pub fn new(
        queue: Arc<RelayQueue>,
        adapters: AdapterRegistry,
        limiter: Arc<RateLimiter>,
        reviews: Arc<ReviewQueue>,
        settings: RelayerSettings,
    ) -> Self {
        Self {
            queue,
            adapters,
            limiter,
            reviews,
            settings,
        }
    }

    /// Submits a verified attestation for `message` to its destination chain
    /// and commits the execution once confirmed.
    pub async fn relay(&self, message: &Message, attestation: &Attestation) -> Result<RelayOutcome, RelayError> {
        let id = message.id.as_str();
        // 验证证明与消息一致
        let body = attestation.body();
        if body.emitter_chain != message.source_chain.wire_id()
            || body.emitter_address != message.emitter_address
            || body.sequence != message.sequence
            || body.payload_hash != message.payload_hash()
        {
            return Err(RelayError::Mismatch(id.to_string()));
        }

        let digest = attestation.digest();
        if self.queue.is_executed(&digest).await? {
            info!("Digest {} already executed, skipping {}", digest, id);
            return Ok(RelayOutcome::AlreadyExecuted);
        }

        let current = self
            .queue
            .message(id)
            .await?
            .ok_or_else(|| RelayError::UnknownMessage(id.to_string()))?;
        if current.status != MessageStatus::Attested {
            debug!("Message {} is {}, not relaying", id, current.status);
            return Ok(RelayOutcome::NotClaimed);
        }

        let review = self.reviews.get(id).await?;
        match review.as_ref().map(|entry| entry.status) {
            Some(ReviewStatus::Open) => {
                return Ok(RelayOutcome::UnderReview(
                    review.map(|entry| entry.reason).unwrap_or_default(),
                ));
            }
            Some(ReviewStatus::Rejected) => {
                self.queue
                    .fail(id, FailureReason::Permanent("rejected in review".to_string()))
                    .await?;
                return Ok(RelayOutcome::Rejected);
            }
            Some(ReviewStatus::Approved) | None => {}
        }

        // 检查发送方限流
        let limits = self.limiter.config().max_per_window;
        let decision = self.limiter.can_proceed(&message.sender, limits).await?;
        if !decision.allowed {
            self.queue.defer(id, decision.reset_at).await?;
            info!("Sender {} over quota, {} deferred until {}", message.sender, id, decision.reset_at);
            return Ok(RelayOutcome::Deferred {
                retry_at: decision.reset_at,
            });
        }

        if review.is_none() {
            if let ReviewVerdict::Review(reason) = self
                .limiter
                .flag_suspicious(&message.sender, message.amount, message.dest_chain)
                .await?
            {
                self.reviews.submit(id, &message.sender, &reason).await?;
                return Ok(RelayOutcome::UnderReview(reason));
            }
        }

        if !self.queue.claim_from(id, MessageStatus::Attested).await? {
            debug!("Message {} claimed by another worker", id);
            return Ok(RelayOutcome::NotClaimed);
        }

        let Some(adapter) = self.adapters.get(message.dest_chain) else {
            self.queue
                .fail(
                    id,
                    FailureReason::Permanent(format!("no adapter for {}", message.dest_chain)),
                )
                .await?;
            return Err(RelayError::NoAdapter(message.dest_chain));
        };

        let submission = Submission {
            message_id: id.to_string(),
            dest_chain: message.dest_chain,
            recipient: message.recipient.clone(),
            attestation: attestation.serialize(),
            payload: message.payload.clone(),
        };

        // 重试提交消息
        let backoff = &self.settings.backoff;
        let mut previous: Option<AdapterError> = None;
        loop {
            let attempt = match self.queue.record_attempt(id).await? {
                AttemptOutcome::Recorded(n) => n,
                AttemptOutcome::Exhausted(attempts) => {
                    error!("No attempts left for {} after {}", id, attempts);
                    // 本轮没有出错记录时，说明次数在之前的运行中已用完
                    return Err(match previous {
                        Some(last) => RelayError::MaxAttemptsExceeded {
                            message_id: id.to_string(),
                            attempts,
                            last,
                        },
                        None => RelayError::AttemptsExhausted {
                            message_id: id.to_string(),
                            attempts,
                        },
                    });
                }
            };

            let last = match timeout(
                self.settings.attempt_timeout,
                self.submit_and_confirm(adapter.as_ref(), &submission),
            )
            .await
            {
                Ok(Ok(tx)) => {
                    if self.queue.commit_executed(id, &digest).await? {
                        info!("Relayed {} to {} in {} attempt(s): {}", id, message.dest_chain, attempt, tx);
                        return Ok(RelayOutcome::Executed { attempts: attempt, tx });
                    }
                    return Ok(RelayOutcome::AlreadyExecuted);
                }
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => {
                    error!("Permanent failure relaying {}: {}", id, e);
                    self.queue.fail(id, FailureReason::Permanent(e.to_string())).await?;
                    return Err(RelayError::Permanent {
                        message_id: id.to_string(),
                        source: e,
                    });
                }
                Err(_) => AdapterError::Timeout,
            };

            if !backoff.allows_retry_after(attempt) {
                error!("Max attempts ({}) reached for {}. Last error: {}", attempt, id, last);
                self.queue.fail(id, FailureReason::MaxAttemptsExceeded).await?;
                return Err(RelayError::MaxAttemptsExceeded {
                    message_id: id.to_string(),
                    attempts: attempt,
                    last,
                });
            }

            let delay = backoff.delay(attempt);
            warn!(
                "Retry {}/{} for {} after {:?}. Error: {}",
                attempt, backoff.max_attempts, id, delay, last
            );
            previous = Some(last);
            sleep(delay).await;
        }
    }

    async fn submit_and_confirm(
        &self,
        adapter: &dyn ChainAdapter,
        submission: &Submission,
    ) -> Result<TxHash, AdapterError> {
        let tx = adapter.send_transaction(submission).await?;
        loop {
            match adapter.get_transaction_status(&tx).await? {
                TxStatus::Confirmed => return Ok(tx),
                TxStatus::Pending => sleep(self.settings.confirm_poll_interval).await,
                TxStatus::Dropped => return Err(AdapterError::Dropped),
                TxStatus::Failed => return Err(AdapterError::Reverted(format!("transaction {} failed", tx))),
            }
        }
    }
}
