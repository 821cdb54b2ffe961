use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::chain_adapter::{AdapterError, ChainAdapter, LogFilter, RawEvent};
use crate::clock::Clock;
use crate::queue::RelayQueue;
use crate::store::StoreError;
use crate::types::{ChainId, EmitterAddress, Message};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Watches one source chain for outbound messages and queues them.
pub struct EmitterObserver {
    chain: ChainId,
    adapter: Arc<dyn ChainAdapter>,
    queue: Arc<RelayQueue>,
    clock: Arc<dyn Clock>,
    destinations: BTreeSet<ChainId>,
    filter: LogFilter,
    last_sequence: HashMap<EmitterAddress, u64>,
}

impl EmitterObserver {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        queue: Arc<RelayQueue>,
        clock: Arc<dyn Clock>,
        destinations: impl IntoIterator<Item = ChainId>,
        emitters: Vec<EmitterAddress>,
    ) -> Self {
        Self {
            chain: adapter.chain(),
            adapter,
            queue,
            clock,
            destinations: destinations.into_iter().collect(),
            filter: LogFilter {
                emitters,
                from_block: 0,
            },
            last_sequence: HashMap::new(),
        }
    }

    /// Turns an event into a queued message. Returns `None` when the event
    /// is dropped or was already queued.
    pub async fn handle_event(&mut self, event: RawEvent) -> Result<Option<Message>, StoreError> {
        if !self.filter.emitters.is_empty() && !self.filter.emitters.contains(&event.emitter_address) {
            debug!("Ignoring event from unwatched emitter {}", event.emitter_address);
            return Ok(None);
        }

        if let Some(&last) = self.last_sequence.get(&event.emitter_address) {
            if event.sequence <= last {
                warn!(
                    "Dropping {} event from {} with sequence {} (last seen {})",
                    self.chain, event.emitter_address, event.sequence, last
                );
                return Ok(None);
            }
        }
        let (emitter, sequence, block) = (event.emitter_address, event.sequence, event.block_number);

        let Some(dest_chain) = ChainId::from_wire_id(event.dest_chain).filter(|c| self.destinations.contains(c))
        else {
            warn!(
                "Dropping {}/{}/{}: destination chain {} is not configured",
                self.chain, emitter, sequence, event.dest_chain
            );
            self.mark_seen(emitter, sequence, block);
            return Ok(None);
        };

        let message = Message::new(
            self.chain,
            dest_chain,
            event.emitter_address,
            event.sequence,
            event.sender,
            event.recipient,
            event.payload,
            event.amount,
            self.clock.now_ms(),
        );
        // 入队失败时不推进序号，重投的同一事件还能被接收
        let queued = self.queue.enqueue(&message).await?;
        self.mark_seen(emitter, sequence, block);
        Ok(queued.then_some(message))
    }

    fn mark_seen(&mut self, emitter: EmitterAddress, sequence: u64, block: u64) {
        self.last_sequence.insert(emitter, sequence);
        self.filter.from_block = self.filter.from_block.max(block);
    }

    /// Follows the log stream until `shutdown` fires. When the stream ends
    /// or cannot be opened the observer subscribes again from the highest
    /// block it has handled. Only a permanent subscribe error is returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AdapterError> {
        info!("Observing {} for {} emitter(s)", self.chain, self.filter.emitters.len());
        loop {
            let mut events = match self.adapter.subscribe_logs(&self.filter).await {
                Ok(events) => events,
                Err(e) if e.is_transient() => {
                    warn!("Subscribing to {} failed: {}", self.chain, e);
                    if !pause(&mut shutdown).await {
                        info!("Observer for {} stopped", self.chain);
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!("Subscribed to {} from block {}", self.chain, self.filter.from_block);

            loop {
                tokio::select! {
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            if let Err(e) = self.handle_event(event).await {
                                error!("Failed to queue {} event: {}", self.chain, e);
                            }
                        }
                        Some(Err(e)) => warn!("Log stream error on {}: {}", self.chain, e),
                        None => {
                            warn!(
                                "Log stream for {} ended, resubscribing from block {}",
                                self.chain, self.filter.from_block
                            );
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Observer for {} stopped", self.chain);
                            return Ok(());
                        }
                    }
                }
            }

            if !pause(&mut shutdown).await {
                info!("Observer for {} stopped", self.chain);
                return Ok(());
            }
        }
    }
}

/// Waits before subscribing again. Returns `false` if shutdown fired first.
async fn pause(shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = sleep(RESUBSCRIBE_DELAY) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::MockChainAdapter;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::test_support::{FlakyStore, EMITTER};
    use crate::types::MessageStatus;
    use std::sync::Mutex;

    fn event(sequence: u64, dest_chain: u16) -> RawEvent {
        RawEvent {
            emitter_address: EMITTER,
            sequence,
            dest_chain,
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            payload: vec![sequence as u8],
            amount: 10,
            block_number: 100 + sequence,
        }
    }

    fn ethereum(events: Vec<Result<RawEvent, AdapterError>>) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(ChainId::Ethereum);
        adapter
            .expect_subscribe_logs()
            .returning(move |_| Ok(futures::stream::iter(events.clone()).boxed()));
        adapter
    }

    fn queue() -> Arc<RelayQueue> {
        Arc::new(RelayQueue::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            3,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_queues_valid_events_in_order() {
        let events = vec![
            Ok(event(1, ChainId::Solana.wire_id())),
            Ok(event(1, ChainId::Solana.wire_id())),
            Err(AdapterError::Network("reset".to_string())),
            Ok(event(3, 999)),
            Ok(event(2, ChainId::Solana.wire_id())),
            Ok(event(4, ChainId::Solana.wire_id())),
        ];
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let seen = subscriptions.clone();
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(ChainId::Ethereum);
        adapter.expect_subscribe_logs().returning(move |filter| {
            let mut seen = seen.lock().unwrap();
            seen.push(filter.from_block);
            if seen.len() == 1 {
                Ok(futures::stream::iter(events.clone()).boxed())
            } else {
                Ok(futures::stream::pending().boxed())
            }
        });
        let queue = queue();
        let observer = EmitterObserver::new(
            Arc::new(adapter),
            queue.clone(),
            Arc::new(ManualClock::new(7)),
            [ChainId::Solana],
            vec![EMITTER],
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(observer.run(rx));
        sleep(Duration::from_secs(2)).await;

        // The ended stream is replaced by one starting at the last handled block.
        assert_eq!(*subscriptions.lock().unwrap(), vec![0, 104]);
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let mut sequences: Vec<u64> = queue.pending().await.unwrap().iter().map(|m| m.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 4]);

        let id = Message::make_id(ChainId::Ethereum, &EMITTER, 4);
        let message = queue.message(&id).await.unwrap().unwrap();
        assert_eq!(message.dest_chain, ChainId::Solana);
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.created_at, 7);
        assert_eq!(message.payload, vec![4]);
    }

    #[tokio::test]
    async fn test_unregistered_destination_and_emitter_are_dropped() {
        let queue = queue();
        let mut observer = EmitterObserver::new(
            Arc::new(ethereum(vec![])),
            queue.clone(),
            Arc::new(ManualClock::new(0)),
            [ChainId::Solana],
            vec![EMITTER],
        );

        assert!(observer
            .handle_event(event(1, ChainId::Sui.wire_id()))
            .await
            .unwrap()
            .is_none());

        let mut stranger = event(2, ChainId::Solana.wire_id());
        stranger.emitter_address = EmitterAddress([0x99; 32]);
        assert!(observer.handle_event(stranger).await.unwrap().is_none());

        let queued = observer
            .handle_event(event(2, ChainId::Solana.wire_id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.sequence, 2);
        assert_eq!(queue.messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_enqueue_accepts_redelivery() {
        let store = Arc::new(FlakyStore::default());
        let queue = Arc::new(RelayQueue::new(store.clone(), Arc::new(ManualClock::new(0)), 3));
        let mut observer = EmitterObserver::new(
            Arc::new(ethereum(vec![])),
            queue.clone(),
            Arc::new(ManualClock::new(0)),
            [ChainId::Solana],
            vec![EMITTER],
        );

        store.fail_next_write("msg/");
        assert!(observer.handle_event(event(1, ChainId::Solana.wire_id())).await.is_err());
        assert!(queue.messages().await.unwrap().is_empty());

        let queued = observer
            .handle_event(event(1, ChainId::Solana.wire_id()))
            .await
            .unwrap();
        assert_eq!(queued.map(|m| m.sequence), Some(1));
        assert_eq!(queue.messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_subscribe_error_is_returned() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(ChainId::Ethereum);
        adapter
            .expect_subscribe_logs()
            .times(1)
            .returning(|_| Err(AdapterError::InvalidTarget("no log support".to_string())));
        let observer = EmitterObserver::new(
            Arc::new(adapter),
            queue(),
            Arc::new(ManualClock::new(0)),
            [ChainId::Solana],
            vec![],
        );

        let (_tx, rx) = watch::channel(false);
        assert!(observer.run(rx).await.is_err());
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_chain().return_const(ChainId::Ethereum);
        adapter
            .expect_subscribe_logs()
            .returning(|_| Ok(futures::stream::pending().boxed()));
        let observer = EmitterObserver::new(
            Arc::new(adapter),
            queue(),
            Arc::new(ManualClock::new(0)),
            [ChainId::Solana],
            vec![],
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(observer.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
