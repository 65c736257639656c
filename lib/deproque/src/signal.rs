// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-shot completion signals.
//!
//! A [`CompletionSignal`] starts un-set, is set exactly once, and from then on
//! satisfies every current and future waiter. It carries no failure state: a
//! holder that fails still just sets its signal, so dependents only ever
//! observe success.

use parking_lot::Mutex as ParkingMutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

/// Cloneable handle to a shared one-shot signal.
#[derive(Clone, Default)]
pub struct CompletionSignal {
    state: Arc<SignalState>,
}

#[derive(Default)]
struct SignalState {
    // Flag and wakers live under one lock to prevent lost wakeups
    inner: ParkingMutex<SignalInner>,
    // Lock-free mirror of `inner.set` for `is_set` and the poll fast path
    set: AtomicBool,
}

#[derive(Default)]
struct SignalInner {
    set: bool,
    wakers: Vec<Waker>,
}

impl CompletionSignal {
    /// Create an un-set signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake all waiters.
    ///
    /// Returns `true` for the call that performed the transition; any later
    /// call is a no-op returning `false`.
    pub fn set(&self) -> bool {
        let wakers = {
            let mut inner = self.state.inner.lock();
            if inner.set {
                return false;
            }
            inner.set = true;
            self.state.set.store(true, Ordering::Release);
            std::mem::take(&mut inner.wakers)
        };

        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Non-blocking check.
    pub fn is_set(&self) -> bool {
        self.state.set.load(Ordering::Acquire)
    }

    /// Future resolving once the signal is set.
    pub fn wait(&self) -> SignalAwaiter {
        SignalAwaiter {
            state: Arc::clone(&self.state),
        }
    }

    /// True if both handles refer to the same signal.
    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &CompletionSignal) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Future that waits for a [`CompletionSignal`].
///
/// Safe to poll repeatedly (e.g. from `tokio::select!`); wakers are
/// de-duplicated so the waiter list does not grow across polls.
pub struct SignalAwaiter {
    state: Arc<SignalState>,
}

impl Future for SignalAwaiter {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.set.load(Ordering::Acquire) {
            return Poll::Ready(());
        }

        let mut inner = self.state.inner.lock();
        if inner.set {
            return Poll::Ready(());
        }

        let waker = cx.waker();
        if let Some(existing) = inner.wakers.iter_mut().find(|w| w.will_wake(waker)) {
            existing.clone_from(waker);
        } else {
            inner.wakers.push(waker.clone());
        }

        Poll::Pending
    }
}

/// Wait until every signal in `signals` is set.
///
/// Signals never fail, so waiting on them one after another is equivalent to
/// waiting on all of them at once.
pub async fn wait_all<I>(signals: I)
where
    I: IntoIterator<Item = CompletionSignal>,
{
    for signal in signals {
        signal.wait().await;
    }
}
