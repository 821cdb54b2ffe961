use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

use super::{CrossChainState, MergeStrategy, Reconciler};
use crate::types::{ChainId, Timestamp};

pub type WatchCallback<T> = Arc<dyn Fn(CrossChainState<T>) + Send + Sync>;

#[derive(Clone)]
struct Subscriber<T> {
    id: u64,
    callback: WatchCallback<T>,
    disposed: Arc<AtomicBool>,
    gate: Arc<Mutex<()>>,
}

/// The polling loop shared by every subscriber to one key.
pub(crate) struct WatchLoop<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    stop: watch::Sender<bool>,
}

/// Subscription returned by [`Reconciler::watch_state`].
pub struct WatchHandle<T> {
    reconciler: Weak<Reconciler<T>>,
    key: String,
    id: u64,
    disposed: Arc<AtomicBool>,
    gate: Arc<Mutex<()>>,
}

impl<T> WatchHandle<T>
where
    T: Clone + Eq + Send + Sync + 'static,
{
    /// Stops deliveries to this subscriber, including one whose cycle is
    /// already running. A callback that has already started finishes before
    /// `dispose` returns. The loop ends with its last subscriber.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.gate.lock().await);
        if let Some(reconciler) = self.reconciler.upgrade() {
            reconciler.unsubscribe(&self.key, self.id).await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl<T> Reconciler<T>
where
    T: Clone + Eq + Send + Sync + 'static,
{
    /// Delivers a fresh `CrossChainState` for `key` every `period`.
    ///
    /// All watchers of a key share one loop, started by the first of them
    /// with its `chains`, `strategy` and `period`. Deliveries run on that
    /// loop one at a time, in non-decreasing `last_sync` order.
    pub async fn watch_state(
        self: &Arc<Self>,
        key: &str,
        chains: Vec<ChainId>,
        strategy: MergeStrategy,
        period: Duration,
        callback: WatchCallback<T>,
    ) -> WatchHandle<T> {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let disposed = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Mutex::new(()));

        let mut watches = self.watches.lock().await;
        let watch = watches
            .entry(key.to_string())
            .or_insert_with(|| self.spawn_loop(key.to_string(), chains, strategy, period))
            .clone();
        watch.subscribers.lock().await.push(Subscriber {
            id,
            callback,
            disposed: disposed.clone(),
            gate: gate.clone(),
        });
        debug!("Subscriber {} watching {}", id, key);

        WatchHandle {
            reconciler: Arc::downgrade(self),
            key: key.to_string(),
            id,
            disposed,
            gate,
        }
    }

    /// Number of keys with a running loop.
    pub async fn watched_keys(&self) -> usize {
        self.watches.lock().await.len()
    }

    async fn unsubscribe(&self, key: &str, id: u64) {
        let mut watches = self.watches.lock().await;
        let Some(watch) = watches.get(key).cloned() else {
            return;
        };
        let mut subscribers = watch.subscribers.lock().await;
        subscribers.retain(|s| s.id != id);
        if subscribers.is_empty() {
            let _ = watch.stop.send(true);
            watches.remove(key);
            info!("Stopped watching {}", key);
        }
    }

    fn spawn_loop(
        self: &Arc<Self>,
        key: String,
        chains: Vec<ChainId>,
        strategy: MergeStrategy,
        period: Duration,
    ) -> Arc<WatchLoop<T>> {
        let (stop, mut stopped) = watch::channel(false);
        let shared = Arc::new(WatchLoop {
            subscribers: Mutex::new(Vec::new()),
            stop,
        });
        let weak = Arc::downgrade(self);
        let watch = shared.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_delivered: Timestamp = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(reconciler) = weak.upgrade() else {
                    break;
                };
                let result = reconciler.sync_state(&key, &chains, strategy).await;
                drop(reconciler);

                let state = match result {
                    Ok(state) if state.last_sync >= last_delivered => state,
                    Ok(state) => {
                        debug!("Dropping out-of-order sync for {} at {}", key, state.last_sync);
                        continue;
                    }
                    Err(e) => {
                        warn!("Sync of {} failed: {}", key, e);
                        continue;
                    }
                };
                last_delivered = state.last_sync;

                let subscribers = watch.subscribers.lock().await.clone();
                for subscriber in subscribers {
                    // 持锁回调，dispose 会等待正在执行的回调结束
                    let _delivering = subscriber.gate.lock().await;
                    if !subscriber.disposed.load(Ordering::SeqCst) {
                        (subscriber.callback)(state.clone());
                    }
                }
            }
            debug!("Watch loop for {} exited", key);
        });

        shared
    }
}
