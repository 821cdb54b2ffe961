//! Cross-chain state reconciliation.
//!
//! A logical key (a treasury balance, a supply counter) is read from every
//! configured chain concurrently and the answers are merged with a
//! [`MergeStrategy`]. Chains that fail are left out of the cycle. A cycle in
//! which nobody answered keeps the previous snapshot.

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::chain_adapter::{AdapterError, AdapterRegistry, BalanceQuery};
use crate::clock::Clock;
use crate::types::{ChainId, Timestamp};

pub mod strategy;
pub mod watch;

pub use strategy::{merge, MergeStrategy};
pub use watch::{WatchCallback, WatchHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("No chains configured for {0}")]
    NoChains(String),

    #[error("No chain responded for {0}")]
    NoChainResponded(String),

    #[error("No authoritative value for {key}: {chain} did not respond")]
    NoAuthoritativeValue { key: String, chain: ChainId },
}

/// One chain's view of a key at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState<T> {
    pub chain: ChainId,
    pub data: T,
    pub block_number: u64,
    pub block_hash: String,
    pub observed_at: Timestamp,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossChainState<T> {
    pub key: String,
    pub data: T,
    pub chain_states: BTreeMap<ChainId, ChainState<T>>,
    pub last_sync: Timestamp,
    pub strategy: MergeStrategy,
}

#[async_trait]
pub trait StateFetcher<T>: Send + Sync {
    async fn fetch(&self, chain: ChainId, key: &str) -> Result<ChainState<T>, AdapterError>;
}

pub struct Reconciler<T> {
    fetcher: Arc<dyn StateFetcher<T>>,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<String, CrossChainState<T>>>,
    watches: Mutex<HashMap<String, Arc<watch::WatchLoop<T>>>>,
    next_subscriber: AtomicU64,
}

impl<T> Reconciler<T>
where
    T: Clone + Eq + Send + Sync + 'static,
{
    pub fn new(fetcher: Arc<dyn StateFetcher<T>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            fetcher,
            clock,
            cache: RwLock::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
        }
    }

    /// Runs one fetch-and-merge cycle for `key` and caches the result.
    pub async fn sync_state(
        &self,
        key: &str,
        chains: &[ChainId],
        strategy: MergeStrategy,
    ) -> Result<CrossChainState<T>, ReconcileError> {
        if chains.is_empty() {
            return Err(ReconcileError::NoChains(key.to_string()));
        }

        let results = join_all(chains.iter().map(|&chain| async move {
            (chain, self.fetcher.fetch(chain, key).await)
        }))
        .await;

        let mut chain_states = BTreeMap::new();
        for (chain, result) in results {
            match result {
                Ok(mut state) => {
                    state.chain = chain;
                    chain_states.insert(chain, state);
                }
                Err(e) => warn!("Fetching {} from {} failed: {}", key, chain, e),
            }
        }

        let mut cache = self.cache.write().await;
        let previous = cache.get(key);

        if chain_states.is_empty() {
            warn!("No chain responded for {}, keeping previous state", key);
            return previous
                .cloned()
                .ok_or_else(|| ReconcileError::NoChainResponded(key.to_string()));
        }

        let Some(data) = merge(strategy, chains, &chain_states) else {
            return previous.cloned().ok_or_else(|| ReconcileError::NoAuthoritativeValue {
                key: key.to_string(),
                chain: chains[0],
            });
        };

        let last_sync = previous
            .map_or(0, |p| p.last_sync)
            .max(self.clock.now_ms());
        let state = CrossChainState {
            key: key.to_string(),
            data,
            chain_states,
            last_sync,
            strategy,
        };
        debug!(
            "Synced {} from {}/{} chains ({})",
            key,
            state.chain_states.len(),
            chains.len(),
            strategy
        );
        cache.insert(key.to_string(), state.clone());
        Ok(state)
    }

    pub async fn cached(&self, key: &str) -> Option<CrossChainState<T>> {
        self.cache.read().await.get(key).cloned()
    }
}

/// Reads balances through the chain adapters. The key is the account
/// address.
pub struct BalanceFetcher {
    adapters: AdapterRegistry,
    clock: Arc<dyn Clock>,
    token: Option<String>,
}

impl BalanceFetcher {
    pub fn new(adapters: AdapterRegistry, clock: Arc<dyn Clock>, token: Option<String>) -> Self {
        Self { adapters, clock, token }
    }
}

#[async_trait]
impl StateFetcher<u128> for BalanceFetcher {
    async fn fetch(&self, chain: ChainId, key: &str) -> Result<ChainState<u128>, AdapterError> {
        let adapter = self
            .adapters
            .get(chain)
            .ok_or_else(|| AdapterError::InvalidTarget(format!("no adapter for {}", chain)))?;
        let reading = adapter
            .get_balance(&BalanceQuery {
                address: key.to_string(),
                token: self.token.clone(),
            })
            .await?;
        Ok(ChainState {
            chain,
            data: reading.amount,
            block_number: reading.block_number,
            block_hash: reading.block_hash,
            observed_at: self.clock.now_ms(),
            confirmed: reading.confirmed,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain_adapter::{BalanceReading, MockChainAdapter};
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Per-chain canned answers with optional latency.
    pub(crate) struct FakeFetcher {
        pub values: std::sync::Mutex<HashMap<ChainId, Option<u64>>>,
        pub delays: HashMap<ChainId, Duration>,
        pub calls: AtomicUsize,
    }

    impl FakeFetcher {
        pub(crate) fn new(values: &[(ChainId, Option<u64>)]) -> Self {
            Self {
                values: std::sync::Mutex::new(values.iter().copied().collect()),
                delays: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn set(&self, chain: ChainId, value: Option<u64>) {
            self.values.lock().unwrap().insert(chain, value);
        }
    }

    #[async_trait]
    impl StateFetcher<u64> for FakeFetcher {
        async fn fetch(&self, chain: ChainId, _key: &str) -> Result<ChainState<u64>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&chain) {
                tokio::time::sleep(*delay).await;
            }
            let value = self.values.lock().unwrap().get(&chain).copied().flatten();
            match value {
                Some(data) => Ok(ChainState {
                    chain,
                    data,
                    block_number: 10,
                    block_hash: format!("0x{:02x}", chain.wire_id()),
                    observed_at: chain.wire_id() as u64,
                    confirmed: true,
                }),
                None => Err(AdapterError::Timeout),
            }
        }
    }

    const ABC: [ChainId; 3] = [ChainId::Ethereum, ChainId::Solana, ChainId::Sui];

    fn reconciler(fetcher: FakeFetcher, clock: Arc<ManualClock>) -> (Reconciler<u64>, Arc<FakeFetcher>) {
        let fetcher = Arc::new(fetcher);
        (Reconciler::new(fetcher.clone(), clock), fetcher)
    }

    #[tokio::test]
    async fn test_consensus_example() {
        let (reconciler, _) = reconciler(
            FakeFetcher::new(&[
                (ChainId::Ethereum, Some(100)),
                (ChainId::Solana, Some(100)),
                (ChainId::Sui, Some(200)),
            ]),
            Arc::new(ManualClock::new(5)),
        );
        let state = reconciler
            .sync_state("treasury", &ABC, MergeStrategy::Consensus)
            .await
            .unwrap();
        assert_eq!(state.data, 100);
        assert_eq!(state.chain_states.len(), 3);
        assert_eq!(state.last_sync, 5);
        assert_eq!(reconciler.cached("treasury").await, Some(state));
    }

    fn delayed(values: &[(ChainId, Option<u64>)], delay_ms: impl Fn(u64) -> u64) -> FakeFetcher {
        let mut fetcher = FakeFetcher::new(values);
        fetcher.delays = ABC
            .iter()
            .zip(0u64..)
            .map(|(&chain, i)| (chain, Duration::from_millis(delay_ms(i))))
            .collect();
        fetcher
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_order_does_not_matter() {
        let values = [
            (ChainId::Ethereum, Some(7)),
            (ChainId::Solana, Some(9)),
            (ChainId::Sui, Some(7)),
        ];
        let clock = Arc::new(ManualClock::new(0));
        for strategy in [MergeStrategy::Latest, MergeStrategy::Consensus, MergeStrategy::PrimaryChain] {
            let mut merged = Vec::new();
            for fetcher in [
                FakeFetcher::new(&values),
                delayed(&values, |i| 10 * i),
                delayed(&values, |i| 100 - 10 * i),
            ] {
                let (reconciler, _) = reconciler(fetcher, clock.clone());
                merged.push(reconciler.sync_state("k", &ABC, strategy).await.unwrap());
            }
            assert_eq!(merged[0], merged[1]);
            assert_eq!(merged[1], merged[2]);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_absorbed() {
        let (reconciler, _) = reconciler(
            FakeFetcher::new(&[
                (ChainId::Ethereum, None),
                (ChainId::Solana, Some(3)),
                (ChainId::Sui, Some(4)),
            ]),
            Arc::new(ManualClock::new(0)),
        );
        let state = reconciler
            .sync_state("k", &ABC, MergeStrategy::Latest)
            .await
            .unwrap();
        assert_eq!(state.data, 4);
        assert!(!state.chain_states.contains_key(&ChainId::Ethereum));
    }

    #[tokio::test]
    async fn test_total_failure_keeps_previous_snapshot() {
        let clock = Arc::new(ManualClock::new(100));
        let (reconciler, fetcher) = reconciler(
            FakeFetcher::new(&[(ChainId::Ethereum, None), (ChainId::Solana, None)]),
            clock.clone(),
        );
        let chains = [ChainId::Ethereum, ChainId::Solana];
        assert_eq!(
            reconciler.sync_state("k", &chains, MergeStrategy::Latest).await,
            Err(ReconcileError::NoChainResponded("k".to_string()))
        );

        fetcher.set(ChainId::Solana, Some(42));
        let good = reconciler
            .sync_state("k", &chains, MergeStrategy::Latest)
            .await
            .unwrap();

        fetcher.set(ChainId::Solana, None);
        clock.set(500);
        let kept = reconciler
            .sync_state("k", &chains, MergeStrategy::Latest)
            .await
            .unwrap();
        assert_eq!(kept, good);
        assert_eq!(kept.last_sync, 100);
    }

    #[tokio::test]
    async fn test_primary_chain_must_answer() {
        let (reconciler, fetcher) = reconciler(
            FakeFetcher::new(&[(ChainId::Sui, None), (ChainId::Solana, Some(1))]),
            Arc::new(ManualClock::new(0)),
        );
        let chains = [ChainId::Sui, ChainId::Solana];
        assert!(matches!(
            reconciler.sync_state("k", &chains, MergeStrategy::PrimaryChain).await,
            Err(ReconcileError::NoAuthoritativeValue {
                chain: ChainId::Sui,
                ..
            })
        ));

        fetcher.set(ChainId::Sui, Some(8));
        let state = reconciler
            .sync_state("k", &chains, MergeStrategy::PrimaryChain)
            .await
            .unwrap();
        assert_eq!(state.data, 8);

        fetcher.set(ChainId::Sui, None);
        let kept = reconciler
            .sync_state("k", &chains, MergeStrategy::PrimaryChain)
            .await
            .unwrap();
        assert_eq!(kept, state);
        assert_eq!(
            reconciler.sync_state("k", &[], MergeStrategy::Latest).await,
            Err(ReconcileError::NoChains("k".to_string()))
        );
    }

    #[tokio::test]
    async fn test_balance_fetcher_reads_adapter() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(ChainId::Base);
        adapter
            .expect_get_balance()
            .withf(|q| q.address == "0xtreasury" && q.token.as_deref() == Some("usdc"))
            .returning(|_| {
                Ok(BalanceReading {
                    amount: 1_000,
                    block_number: 77,
                    block_hash: "0xbeef".to_string(),
                    confirmed: true,
                })
            });
        let mut adapters = AdapterRegistry::new();
        adapters.insert(Arc::new(adapter));
        let fetcher = BalanceFetcher::new(adapters, Arc::new(ManualClock::new(9)), Some("usdc".to_string()));

        let state = fetcher.fetch(ChainId::Base, "0xtreasury").await.unwrap();
        assert_eq!(state.data, 1_000);
        assert_eq!(state.block_number, 77);
        assert_eq!(state.observed_at, 9);
        assert!(matches!(
            fetcher.fetch(ChainId::Solana, "0xtreasury").await,
            Err(AdapterError::InvalidTarget(_))
        ));
    }
}
