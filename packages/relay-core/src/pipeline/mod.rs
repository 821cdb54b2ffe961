//! Per-message worker loop.
//!
//! Every pending or due message gets its own task running
//! fetch -> claim -> relay. Tasks share nothing but the queue, so a message
//! stuck waiting for guardians never holds up the ones behind it.

use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

use crate::clock::Clock;
use crate::codec::Attestation;
use crate::fetcher::{AttestationFetcher, FetchError, FetchRequest};
use crate::queue::RelayQueue;
use crate::relayer::{RelayError, RelayOutcome, Relayer};
use crate::types::{FailureReason, Message, MessageStatus};
use crate::Error;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub tick_interval: Duration,
    pub message_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            message_ttl: Duration::from_secs(86_400),
        }
    }
}

pub struct Pipeline {
    queue: Arc<RelayQueue>,
    fetcher: Arc<AttestationFetcher>,
    relayer: Arc<Relayer>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    in_flight: Mutex<HashSet<String>>,
}

impl Pipeline {
    pub fn new(
        queue: Arc<RelayQueue>,
        fetcher: Arc<AttestationFetcher>,
        relayer: Arc<Relayer>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            queue,
            fetcher,
            relayer,
            clock,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Drives one message as far as it can go right now.
    pub async fn process(&self, id: &str) -> Result<RelayOutcome, Error> {
        let message = self
            .queue
            .message(id)
            .await?
            .ok_or_else(|| RelayError::UnknownMessage(id.to_string()))?;

        let attestation = match message.status {
            MessageStatus::Pending => {
                let attestation = self.fetch(&message).await?;
                self.queue.attach_attestation(id, &attestation).await?;
                if !self.queue.claim_from(id, MessageStatus::Pending).await? {
                    debug!("Message {} attested by another worker", id);
                    return Ok(RelayOutcome::NotClaimed);
                }
                attestation
            }
            MessageStatus::Attested => match self.queue.attestation(id).await? {
                Some(attestation) => attestation,
                None => {
                    let attestation = self.fetch(&message).await?;
                    self.queue.attach_attestation(id, &attestation).await?;
                    attestation
                }
            },
            status => {
                debug!("Message {} is {}, nothing to do", id, status);
                return Ok(RelayOutcome::NotClaimed);
            }
        };

        Ok(self.relayer.relay(&message, &attestation).await?)
    }

    async fn fetch(&self, message: &Message) -> Result<Attestation, Error> {
        match self.fetcher.fetch(FetchRequest::from(message)).await {
            Ok(attestation) => Ok(attestation),
            Err(e @ FetchError::AttestationTimeout { .. }) => {
                self.queue.fail(&message.id, FailureReason::AttestationTimeout).await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Expires stale messages and spawns a task for every pending or due
    /// message not already in flight. Returns how many were spawned.
    pub async fn tick(self: &Arc<Self>) -> Result<usize, Error> {
        let expired = self.queue.expire_stale(self.settings.message_ttl).await?;
        if !expired.is_empty() {
            info!("Expired {} stale message(s)", expired.len());
        }

        let now = self.clock.now_ms();
        let mut candidates = self.queue.pending().await?;
        candidates.extend(self.queue.due(now).await?);

        let mut spawned = 0;
        for message in candidates {
            if !self.in_flight.lock().await.insert(message.id.clone()) {
                continue;
            }
            spawned += 1;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                match this.process(&message.id).await {
                    Ok(outcome) => debug!("Message {}: {:?}", message.id, outcome),
                    Err(e) => warn!("Message {} not relayed: {}", message.id, e),
                }
                this.in_flight.lock().await.remove(&message.id);
            });
        }
        Ok(spawned)
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Ticks until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting relay pipeline...");
        let mut ticker = interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Pipeline tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Relay pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::{AdapterRegistry, MockChainAdapter, TxHash, TxStatus};
    use crate::clock::ManualClock;
    use crate::fetcher::{AttestationSource, FetchConfig, SourceError};
    use crate::rate_limit::{RateLimitConfig, RateLimiter, ReviewQueue};
    use crate::relayer::RelayerSettings;
    use crate::retry::BackoffPolicy;
    use crate::store::MemoryStore;
    use crate::test_support::{guardians, signed_attestation, test_body, test_message};
    use crate::types::ChainId;
    use crate::verify::{GuardianSetProvider, GuardianSets};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Serves signed attestations for a fixed set of sequences.
    struct MapSource {
        signed: HashMap<u64, Vec<u8>>,
    }

    #[async_trait]
    impl AttestationSource for MapSource {
        fn name(&self) -> String {
            "map".to_string()
        }

        async fn fetch_signed(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, SourceError> {
            Ok(self.signed.get(&request.sequence).cloned())
        }
    }

    fn pipeline(signed_sequences: &[u64]) -> (Arc<Pipeline>, Arc<RelayQueue>) {
        let (secrets, set) = guardians(0, 4);
        let signed = signed_sequences
            .iter()
            .map(|&seq| (seq, signed_attestation(0, &secrets, &[0, 1, 2], test_body(seq)).serialize()))
            .collect();
        let source: Arc<dyn AttestationSource> = Arc::new(MapSource { signed });

        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = Arc::new(RelayQueue::new(store.clone(), clock.clone(), 3));
        let fetcher = Arc::new(AttestationFetcher::new(
            vec![source],
            Arc::new(GuardianSetProvider::new(GuardianSets::new(set))),
            clock.clone(),
            FetchConfig {
                total_timeout: Duration::from_secs(60),
                poll_interval: Duration::from_secs(5),
                per_source_timeout: Duration::from_secs(1),
            },
        ));

        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(ChainId::Solana);
        adapter
            .expect_send_transaction()
            .returning(|s| Ok(TxHash(format!("tx-{}", s.message_id))));
        adapter
            .expect_get_transaction_status()
            .returning(|_| Ok(TxStatus::Confirmed));
        let mut adapters = AdapterRegistry::new();
        adapters.insert(Arc::new(adapter));

        let relayer = Arc::new(Relayer::new(
            queue.clone(),
            adapters,
            Arc::new(RateLimiter::new(store.clone(), clock.clone(), RateLimitConfig::default())),
            Arc::new(ReviewQueue::new(store, clock.clone())),
            RelayerSettings {
                backoff: BackoffPolicy {
                    max_attempts: 3,
                    ..BackoffPolicy::default()
                },
                ..RelayerSettings::default()
            },
        ));

        let pipeline = Pipeline::new(
            queue.clone(),
            fetcher,
            relayer,
            clock,
            PipelineSettings::default(),
        );
        (Arc::new(pipeline), queue)
    }

    async fn status_of(queue: &RelayQueue, message: &Message) -> MessageStatus {
        queue.message(&message.id).await.unwrap().unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_message_does_not_block_others() {
        let (pipeline, queue) = pipeline(&[7]);
        let stuck = test_message(5, 1_000);
        let ready = test_message(7, 1_000);
        queue.enqueue(&stuck).await.unwrap();
        queue.enqueue(&ready).await.unwrap();

        assert_eq!(pipeline.tick().await.unwrap(), 2);
        for _ in 0..100 {
            if status_of(&queue, &ready).await == MessageStatus::Executed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(status_of(&queue, &ready).await, MessageStatus::Executed);
        assert_eq!(status_of(&queue, &stuck).await, MessageStatus::Pending);

        // Still in flight, so not spawned twice.
        assert_eq!(pipeline.tick().await.unwrap(), 0);
        assert_eq!(pipeline.in_flight().await, 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let read = queue.message(&stuck.id).await.unwrap().unwrap();
        assert_eq!(read.status, MessageStatus::Failed);
        assert_eq!(read.failure_reason, Some(FailureReason::AttestationTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_relays_pending_message() {
        let (pipeline, queue) = pipeline(&[3]);
        let message = test_message(3, 1_000);
        queue.enqueue(&message).await.unwrap();

        let outcome = pipeline.process(&message.id).await.unwrap();
        assert!(matches!(outcome, RelayOutcome::Executed { attempts: 1, .. }));
        assert_eq!(status_of(&queue, &message).await, MessageStatus::Executed);
        assert!(queue.attestation(&message.id).await.unwrap().is_some());

        assert_eq!(
            pipeline.process(&message.id).await.unwrap(),
            RelayOutcome::NotClaimed
        );
        assert!(pipeline.process("2/00/1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (pipeline, queue) = pipeline(&[4]);
        let message = test_message(4, 1_000);
        queue.enqueue(&message).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pipeline.clone().run(rx));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(status_of(&queue, &message).await, MessageStatus::Executed);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
