// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process coordination for concurrent async operations.
//!
//! Three primitives keep overlapping operations on a shared resource from
//! corrupting it, without serializing work on unrelated resources:
//!
//! - [`KeyLock`]: per-key async mutex. Holders of one key are unblocked in
//!   arrival order; different keys never wait on each other.
//! - [`CustomLock`]: the same idea with a caller-supplied
//!   [`ConflictFilter`] in place of key equality.
//! - [`Deproque`]: an execution queue that admits work through a
//!   caller-supplied [`Decider`], buffering whatever is not admitted and
//!   re-offering it whenever running work settles.
//!
//! All three build on [`CompletionSignal`], a one-shot signal that is set
//! exactly once and never carries a failure: an operation that fails still
//! releases everything waiting on it, and only its own caller sees the error.

pub mod config;
pub mod custom_lock;
pub mod deproque;
pub mod key_lock;
pub mod logging;
pub mod signal;

pub use config::{ConfigError, LockConfig, ReleasePolicy};
pub use custom_lock::{Accessor, ConflictFilter, CustomLock, QueuedTask, all_queued, conflicting};
pub use deproque::{Decider, Deproque, max_concurrency};
pub use key_lock::{KeyLock, KeyLockGuard, KeyLocked, LockKey};
pub use signal::{CompletionSignal, SignalAwaiter, wait_all};
