// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-key async mutual exclusion.
//!
//! Every [`KeyLock::acquire`] pushes an entry for its key and waits on the
//! entries that were already queued for that key when it arrived. Holders of a
//! key are therefore unblocked in arrival order, while unrelated keys never
//! wait on each other.

use parking_lot::Mutex as ParkingMutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{LockConfig, ReleasePolicy};
use crate::signal::{CompletionSignal, wait_all};

/// Bound for types usable as lock keys.
pub trait LockKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> LockKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// One outstanding acquisition of a key.
struct LockEntry {
    id: u64,
    signal: CompletionSignal,
}

struct KeyLockInner<K> {
    queue: ParkingMutex<HashMap<K, VecDeque<LockEntry>>>,
    next_id: AtomicU64,
    hold_warning: Duration,
    release_policy: ReleasePolicy,
}

/// Async mutex keyed by resource identifier.
///
/// Cloning is cheap; clones share the same queue.
pub struct KeyLock<K> {
    inner: Arc<KeyLockInner<K>>,
}

impl<K> Clone for KeyLock<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: LockKey> Default for KeyLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: LockKey> KeyLock<K> {
    pub fn new() -> Self {
        Self::with_config(&LockConfig::default())
    }

    pub fn with_config(config: &LockConfig) -> Self {
        Self {
            inner: Arc::new(KeyLockInner {
                queue: ParkingMutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                hold_warning: config.hold_warning(),
                release_policy: config.release_policy,
            }),
        }
    }

    /// True if at least one unreleased entry exists for `key`.
    ///
    /// The answer may be stale as soon as it is returned.
    pub fn has(&self, key: &K) -> bool {
        self.inner.queue.lock().contains_key(key)
    }

    /// Number of unreleased entries across all keys, waiters included.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Acquire exclusive access to `key`.
    ///
    /// Waits for every entry queued for `key` at the moment of the call;
    /// entries queued afterwards are not waited on. The returned guard gives
    /// the key back on [`KeyLockGuard::release`] or when dropped.
    pub async fn acquire(&self, key: K) -> KeyLockGuard<K> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = CompletionSignal::new();

        let dependents: Vec<CompletionSignal> = {
            let mut queue = self.inner.queue.lock();
            let entries = queue.entry(key.clone()).or_default();
            let dependents = entries.iter().map(|e| e.signal.clone()).collect();
            entries.push_back(LockEntry {
                id,
                signal: signal.clone(),
            });
            dependents
        };

        // Created before waiting so a dropped acquire still gives its slot back
        let mut guard = KeyLockGuard {
            lock: self.clone(),
            key,
            id,
            signal,
            released: Arc::new(AtomicBool::new(false)),
            timer: None,
        };

        if !dependents.is_empty() {
            tracing::trace!(key = ?guard.key, id, waiting_on = dependents.len(), "waiting for key");
            wait_all(dependents).await;
        }

        guard.timer = self.spawn_hold_timer(&guard);
        tracing::trace!(key = ?guard.key, id, "key acquired");
        guard
    }

    /// Wrap `func` so every call runs under the lock for its key, using the
    /// configured [`ReleasePolicy`].
    pub fn wrap<F>(&self, func: F) -> KeyLocked<K, F> {
        self.wrap_with(func, self.inner.release_policy)
    }

    /// Like [`wrap`](Self::wrap) with an explicit release policy.
    pub fn wrap_with<F>(&self, func: F, policy: ReleasePolicy) -> KeyLocked<K, F> {
        KeyLocked {
            lock: self.clone(),
            func,
            policy,
        }
    }

    fn spawn_hold_timer(&self, guard: &KeyLockGuard<K>) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::trace!(key = ?guard.key, "no tokio runtime; hold-time warning disabled");
            return None;
        };

        let hold_warning = self.inner.hold_warning;
        let released = Arc::clone(&guard.released);
        let key = guard.key.clone();

        Some(handle.spawn(async move {
            tokio::time::sleep(hold_warning).await;
            if !released.load(Ordering::Acquire) {
                tracing::warn!(
                    key = ?key,
                    held_for_ms = hold_warning.as_millis() as u64,
                    "Lock<{key:?}> has been held for more than {hold_warning:?}"
                );
            }
        }))
    }

    fn remove_entry(&self, key: &K, id: u64) {
        let mut queue = self.inner.queue.lock();
        if let Some(entries) = queue.get_mut(key) {
            if let Some(position) = entries.iter().position(|e| e.id == id) {
                entries.remove(position);
            }
            if entries.is_empty() {
                queue.remove(key);
            }
        }
    }
}

/// Proof of holding a key; the release handle returned by [`KeyLock::acquire`].
pub struct KeyLockGuard<K: LockKey> {
    lock: KeyLock<K>,
    key: K,
    id: u64,
    signal: CompletionSignal,
    released: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl<K: LockKey> KeyLockGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Give the key back, unblocking the next waiter.
    pub fn release(self) {
        drop(self);
    }

    fn release_inner(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.lock.remove_entry(&self.key, self.id);
        self.signal.set();
        tracing::trace!(key = ?self.key, id = self.id, "key released");
    }
}

impl<K: LockKey> Drop for KeyLockGuard<K> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: LockKey> Debug for KeyLockGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// A function whose calls are serialized per key. Built by [`KeyLock::wrap`].
pub struct KeyLocked<K, F> {
    lock: KeyLock<K>,
    func: F,
    policy: ReleasePolicy,
}

impl<K: LockKey, F> KeyLocked<K, F> {
    pub fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    /// Acquire `key`, invoke the wrapped function with it, then release
    /// according to the policy.
    pub async fn call<Fut>(&self, key: K) -> Fut::Output
    where
        F: Fn(K) -> Fut,
        Fut: Future,
    {
        let guard = self.lock.acquire(key.clone()).await;
        match self.policy {
            ReleasePolicy::OnSettle => {
                let output = (self.func)(key).await;
                guard.release();
                output
            }
            ReleasePolicy::OnInvoke => {
                let pending = (self.func)(key);
                guard.release();
                pending.await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::yield_now;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    #[tokio::test]
    async fn test_has_tracks_acquire_and_release() {
        let lock = KeyLock::new();
        assert!(!lock.has(&"f"));

        let guard = lock.acquire("f").await;
        assert!(lock.has(&"f"));
        assert_eq!(lock.len(), 1);

        guard.release();
        assert!(!lock.has(&"f"));
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_first_release() {
        let lock = KeyLock::new();
        let first = lock.acquire("f").await;

        let mut second = Box::pin(lock.acquire("f"));
        assert!(futures::poll!(&mut second).is_pending());
        assert_eq!(lock.len(), 2);

        first.release();
        assert!(lock.has(&"f"));
        let second = second.await;
        assert_eq!(second.key(), &"f");
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_wait() {
        let lock = KeyLock::new();
        let _a = lock.acquire("a").await;
        let b = lock.acquire("b").now_or_never();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let lock = KeyLock::new();
        {
            let _guard = lock.acquire(7u32).await;
            assert!(lock.has(&7));
        }
        assert!(!lock.has(&7));
        assert!(lock.acquire(7).now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_block_later_waiters() {
        let lock = KeyLock::new();
        let first = lock.acquire("k").await;

        let mut abandoned = Box::pin(lock.acquire("k"));
        assert!(futures::poll!(&mut abandoned).is_pending());
        drop(abandoned);
        assert_eq!(lock.len(), 1);

        let mut third = Box::pin(lock.acquire("k"));
        assert!(futures::poll!(&mut third).is_pending());

        first.release();
        yield_now().await;
        assert!(futures::poll!(&mut third).is_ready());
    }

    #[tokio::test]
    async fn test_wrap_on_settle_serializes() {
        let lock = KeyLock::<&'static str>::new();
        let probe = lock.clone();
        let locked = lock.wrap(move |key: &'static str| {
            let probe = probe.clone();
            async move {
                yield_now().await;
                probe.has(&key)
            }
        });

        assert_eq!(locked.policy(), ReleasePolicy::OnSettle);
        assert!(locked.call("x").await);
        assert!(!lock.has(&"x"));
    }

    #[tokio::test]
    async fn test_wrap_on_invoke_releases_before_work() {
        let lock = KeyLock::<&'static str>::new();
        let probe = lock.clone();
        let locked = lock.wrap_with(
            move |key: &'static str| {
                let probe = probe.clone();
                async move { probe.has(&key) }
            },
            ReleasePolicy::OnInvoke,
        );

        // The work runs after the lock has already been given back
        assert!(!locked.call("x").await);
    }

    #[tokio::test]
    async fn test_wrap_uses_configured_policy() {
        let config = LockConfig {
            release_policy: ReleasePolicy::OnInvoke,
            ..Default::default()
        };
        let lock = KeyLock::<u8>::with_config(&config);
        let locked = lock.wrap(|_key: u8| async {});
        assert_eq!(locked.policy(), ReleasePolicy::OnInvoke);
    }

    async fn settle() {
        for _ in 0..4 {
            yield_now().await;
        }
    }

    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_timer_warns_while_held() {
        let counter = WarnCounter::default();
        let _subscriber =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

        let config = LockConfig {
            hold_warning_ms: 100,
            ..Default::default()
        };
        let lock = KeyLock::with_config(&config);
        let guard = lock.acquire("slow").await;
        settle().await;

        tokio::time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // Warning is diagnostic only
        assert!(lock.has(&"slow"));
        guard.release();
        assert!(!lock.has(&"slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_timer_stays_silent_after_release() {
        let counter = WarnCounter::default();
        let _subscriber =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

        let lock = KeyLock::new();
        let guard = lock.acquire("t").await;
        let released = Arc::clone(&guard.released);
        guard.release();
        assert!(released.load(Ordering::Acquire));

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_acquire_without_runtime() {
        let lock = KeyLock::new();
        let guard = lock.acquire("r").now_or_never().unwrap();
        assert!(guard.timer.is_none());
        guard.release();
        assert!(!lock.has(&"r"));
    }
}
