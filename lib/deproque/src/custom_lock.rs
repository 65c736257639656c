// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lock with a caller-defined conflict relation.
//!
//! [`CustomLock`] generalizes [`KeyLock`](crate::KeyLock): instead of key
//! equality, a [`ConflictFilter`] picks which in-flight tasks a new call has
//! to wait for. This can express range overlaps, partial orders, or any other
//! relation over the argument type.

use parking_lot::Mutex as ParkingMutex;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::signal::{CompletionSignal, wait_all};

/// View of an in-flight task handed to conflict filters.
pub struct QueuedTask<A> {
    inner: Arc<TaskInner<A>>,
}

struct TaskInner<A> {
    id: u64,
    arg: A,
    signal: CompletionSignal,
}

impl<A> Clone for QueuedTask<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> QueuedTask<A> {
    fn new(id: u64, arg: A) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id,
                arg,
                signal: CompletionSignal::new(),
            }),
        }
    }

    /// Submission-ordered identifier, unique within its lock.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn arg(&self) -> &A {
        &self.inner.arg
    }

    pub(crate) fn signal(&self) -> &CompletionSignal {
        &self.inner.signal
    }
}

impl<A: Debug> Debug for QueuedTask<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.inner.id)
            .field("arg", &self.inner.arg)
            .finish()
    }
}

/// Computes the subset of in-flight tasks a new argument must wait for.
///
/// Called under the lock's internal mutex; implementations must not call back
/// into the same [`CustomLock`].
pub trait ConflictFilter<A>: Send + Sync {
    fn dependents(&self, arg: &A, queued: &[QueuedTask<A>]) -> Vec<QueuedTask<A>>;
}

impl<A, F> ConflictFilter<A> for F
where
    F: Fn(&A, &[QueuedTask<A>]) -> Vec<QueuedTask<A>> + Send + Sync,
{
    fn dependents(&self, arg: &A, queued: &[QueuedTask<A>]) -> Vec<QueuedTask<A>> {
        self(arg, queued)
    }
}

/// Wait for every queued task: calls run one at a time in submission order.
pub fn all_queued<A>() -> impl ConflictFilter<A> {
    |_: &A, queued: &[QueuedTask<A>]| queued.to_vec()
}

/// Wait for queued tasks whose argument conflicts with the new one.
pub fn conflicting<A, P>(predicate: P) -> impl ConflictFilter<A>
where
    P: Fn(&A, &A) -> bool + Send + Sync,
{
    move |arg: &A, queued: &[QueuedTask<A>]| {
        queued
            .iter()
            .filter(|task| predicate(arg, task.arg()))
            .cloned()
            .collect()
    }
}

struct CustomLockInner<A> {
    queue: ParkingMutex<Vec<QueuedTask<A>>>,
    next_id: AtomicU64,
}

/// Lock whose notion of conflict is supplied per accessor.
///
/// Cloning is cheap; clones share the same queue.
pub struct CustomLock<A> {
    inner: Arc<CustomLockInner<A>>,
}

impl<A> Clone for CustomLock<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> Default for CustomLock<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> CustomLock<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CustomLockInner {
                queue: ParkingMutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Number of in-flight tasks, waiting or running.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Bind an executor and a conflict filter to this lock.
    ///
    /// Accessors created from the same lock see each other's tasks.
    pub fn add_accessor<F, C>(&self, executor: F, filter: C) -> Accessor<A, F, C>
    where
        C: ConflictFilter<A>,
    {
        Accessor {
            lock: self.clone(),
            executor,
            filter,
        }
    }

    fn enqueue(
        &self,
        arg: A,
        filter: &impl ConflictFilter<A>,
    ) -> (QueuedTask<A>, Vec<QueuedTask<A>>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.inner.queue.lock();
        let dependents = filter.dependents(&arg, &queue);
        let task = QueuedTask::new(id, arg);
        queue.push(task.clone());
        (task, dependents)
    }

    fn remove(&self, task: &QueuedTask<A>) {
        let mut queue = self.inner.queue.lock();
        if let Some(position) = queue.iter().position(|t| t.id() == task.id()) {
            queue.remove(position);
        }
    }
}

/// Removes the task and sets its signal however the call ends.
struct TaskSettle<A> {
    lock: CustomLock<A>,
    task: QueuedTask<A>,
}

impl<A> Drop for TaskSettle<A> {
    fn drop(&mut self) {
        self.lock.remove(&self.task);
        self.task.signal().set();
    }
}

/// An executor bound to a [`CustomLock`]. Built by [`CustomLock::add_accessor`].
pub struct Accessor<A, F, C> {
    lock: CustomLock<A>,
    executor: F,
    filter: C,
}

impl<A, F, C> Accessor<A, F, C>
where
    A: Clone,
    C: ConflictFilter<A>,
{
    /// Run the executor for `arg` once every conflicting in-flight task has
    /// finished.
    ///
    /// The executor's error is returned as-is; tasks waiting on this one are
    /// released regardless of the outcome.
    pub async fn call<Fut, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (task, dependents) = self.lock.enqueue(arg.clone(), &self.filter);
        let id = task.id();
        let _settle = TaskSettle {
            lock: self.lock.clone(),
            task,
        };

        if !dependents.is_empty() {
            tracing::trace!(id, waiting_on = dependents.len(), "waiting for conflicting tasks");
            let signals: Vec<CompletionSignal> =
                dependents.iter().map(|t| t.signal().clone()).collect();
            wait_all(signals).await;
        }

        let result = (self.executor)(arg).await;
        if result.is_err() {
            tracing::debug!(id, "custom lock executor failed");
        }
        result
    }
}
