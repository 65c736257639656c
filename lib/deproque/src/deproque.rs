// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Admission-controlled execution queue.
//!
//! A [`Deproque`] decouples submitting work from starting it. Every
//! submission is offered to a caller-supplied [`Decider`] together with the
//! argument tuples currently executing and currently pending. Admitted work
//! runs straight away; everything else is buffered and re-offered each time an
//! executing item settles.
//!
//! Admission is not FIFO: a poll pass scans the pending list in order and
//! admits every item the decider approves, so starvation avoidance is up to
//! the decider. Within one pass each admission is visible to the next
//! decider call, which lets a decider enforce cumulative limits such as a
//! concurrency cap.
//!
//! ```rust,ignore
//! // At most one write per path at a time.
//! let queue = Deproque::new(
//!     |(path, contents): (PathBuf, String)| async move { tokio::fs::write(path, contents).await },
//!     |args: &(PathBuf, String), executing: &[(PathBuf, String)], _pending: &[(PathBuf, String)]| {
//!         executing.iter().all(|other| other.0 != args.0)
//!     },
//! );
//! queue.add((path, contents)).await?;
//! ```

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::sync::Arc;

use crate::signal::CompletionSignal;

/// Admission predicate.
///
/// Evaluated at submission time, where `pending` does not yet contain the
/// candidate, and again on every poll, where it does. Runs under the queue's
/// internal mutex; implementations must not call back into the same
/// [`Deproque`].
pub trait Decider<A>: Send + Sync {
    fn admit(&self, args: &A, executing: &[A], pending: &[A]) -> bool;
}

impl<A, F> Decider<A> for F
where
    F: Fn(&A, &[A], &[A]) -> bool + Send + Sync,
{
    fn admit(&self, args: &A, executing: &[A], pending: &[A]) -> bool {
        self(args, executing, pending)
    }
}

/// Admits at most `limit` concurrently executing items, ignoring arguments.
pub fn max_concurrency<A>(limit: usize) -> impl Decider<A> {
    move |_: &A, executing: &[A], _: &[A]| executing.len() < limit
}

type ExecutorFn<A, T, E> = dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// Argument tuples kept in a plain slice for the decider, with per-item
/// bookkeeping stored alongside at the same index.
struct Ledger<A, M> {
    args: Vec<A>,
    meta: Vec<M>,
}

impl<A, M> Ledger<A, M> {
    fn new() -> Self {
        Self {
            args: Vec::new(),
            meta: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.args.len()
    }

    fn push(&mut self, args: A, meta: M) {
        self.args.push(args);
        self.meta.push(meta);
    }

    fn remove(&mut self, index: usize) -> (A, M) {
        (self.args.remove(index), self.meta.remove(index))
    }

    fn position(&self, pred: impl Fn(&M) -> bool) -> Option<usize> {
        self.meta.iter().position(pred)
    }
}

/// A submission that could not be admitted yet.
struct PendingItem {
    id: u64,
    admitted: CompletionSignal,
}

struct QueueState<A> {
    executing: Ledger<A, u64>,
    pending: Ledger<A, PendingItem>,
    next_id: u64,
}

impl<A> QueueState<A> {
    fn remove(&mut self, id: u64) -> Option<Stage> {
        if let Some(index) = self.executing.position(|item| *item == id) {
            self.executing.remove(index);
            return Some(Stage::Executing);
        }
        if let Some(index) = self.pending.position(|item| item.id == id) {
            self.pending.remove(index);
            return Some(Stage::Pending);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    Executing,
}

struct DeproqueInner<A, T, E> {
    state: ParkingMutex<QueueState<A>>,
    executor: Box<ExecutorFn<A, T, E>>,
    decider: Box<dyn Decider<A>>,
}

impl<A, T, E> DeproqueInner<A, T, E> {
    /// One pass over the pending list. Returns the number of admissions.
    fn poll_locked(&self, state: &mut QueueState<A>) -> usize {
        let mut admitted = 0;
        let mut index = 0;

        // An admitted item is removed at `index`, so the next candidate
        // shifts into the same position and the index is not advanced.
        while index < state.pending.len() {
            let admit = self.decider.admit(
                &state.pending.args[index],
                &state.executing.args,
                &state.pending.args,
            );
            if !admit {
                index += 1;
                continue;
            }

            let (args, item) = state.pending.remove(index);
            state.executing.push(args, item.id);
            item.admitted.set();
            admitted += 1;
            tracing::trace!(id = item.id, "pending item admitted");
        }

        admitted
    }

    fn settle(&self, id: u64) {
        let mut state = self.state.lock();
        match state.remove(id) {
            Some(Stage::Executing) => {
                tracing::trace!(id, "item settled");
                self.poll_locked(&mut state);
            }
            Some(Stage::Pending) => {
                tracing::debug!(id, "pending item abandoned before admission");
                self.poll_locked(&mut state);
            }
            None => {}
        }
    }
}

/// Dependency/admission-controlled execution queue.
///
/// Cloning is cheap; clones share the same executing and pending sets.
pub struct Deproque<A, T, E> {
    inner: Arc<DeproqueInner<A, T, E>>,
}

impl<A, T, E> Clone for Deproque<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> Deproque<A, T, E>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a queue from an executor and an admission predicate.
    pub fn new<F, Fut, D>(executor: F, decider: D) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        D: Decider<A> + 'static,
    {
        Self {
            inner: Arc::new(DeproqueInner {
                state: ParkingMutex::new(QueueState {
                    executing: Ledger::new(),
                    pending: Ledger::new(),
                    next_id: 0,
                }),
                executor: Box::new(move |args| executor(args).boxed()),
                decider: Box::new(decider),
            }),
        }
    }

    /// Submit `args` and wait for the executor's outcome.
    ///
    /// If the decider admits `args` right away the executor starts
    /// immediately; otherwise the item waits in the pending list until a
    /// later poll admits it. Either way the result is exactly what the
    /// executor returned for these arguments.
    ///
    /// Dropping the returned future withdraws a pending item, or frees the
    /// executing slot of a running one.
    pub async fn add(&self, args: A) -> Result<T, E> {
        let (id, admission) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            if self
                .inner
                .decider
                .admit(&args, &state.executing.args, &state.pending.args)
            {
                state.executing.push(args.clone(), id);
                (id, None)
            } else {
                let admitted = CompletionSignal::new();
                state.pending.push(
                    args.clone(),
                    PendingItem {
                        id,
                        admitted: admitted.clone(),
                    },
                );
                (id, Some(admitted))
            }
        };

        let _settle = SettleGuard {
            inner: Arc::clone(&self.inner),
            id,
        };

        match admission {
            None => tracing::trace!(id, "admitted on submission"),
            Some(admitted) => {
                tracing::trace!(id, "deferred");
                admitted.wait().await;
            }
        }

        self.start(id, args).await
    }

    /// Run the executor for an item that already sits in the executing set.
    /// The caller's [`SettleGuard`] removes it and re-polls afterwards.
    async fn start(&self, id: u64, args: A) -> Result<T, E> {
        let result = (self.inner.executor)(args).await;
        if result.is_err() {
            tracing::debug!(id, "executor failed");
        }
        result
    }

    /// Re-offer every pending item to the decider once, in list order.
    ///
    /// Returns how many items were admitted. Settling items poll on their
    /// own; calling this by hand is only needed when the decider depends on
    /// state outside the queue.
    pub fn poll(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.poll_locked(&mut state)
    }
}

impl<A, T, E> Deproque<A, T, E> {
    /// Number of admitted items that have not settled.
    pub fn executing_len(&self) -> usize {
        self.inner.state.lock().executing.len()
    }

    /// Number of submitted items not yet admitted.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.executing.len() == 0 && state.pending.len() == 0
    }

    /// Copy of the argument tuples currently executing.
    pub fn executing(&self) -> Vec<A>
    where
        A: Clone,
    {
        self.inner.state.lock().executing.args.clone()
    }

    /// Copy of the argument tuples currently pending, in scan order.
    pub fn pending(&self) -> Vec<A>
    where
        A: Clone,
    {
        self.inner.state.lock().pending.args.clone()
    }
}

/// Takes the item out of whichever set holds it and re-polls.
///
/// Runs when `add` finishes, fails, or is dropped mid-way.
struct SettleGuard<A, T, E> {
    inner: Arc<DeproqueInner<A, T, E>>,
    id: u64,
}

impl<A, T, E> Drop for SettleGuard<A, T, E> {
    fn drop(&mut self) {
        self.inner.settle(self.id);
    }
}
