// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use deproque::{CustomLock, QueuedTask, all_queued, conflicting};

type Journal = Arc<Mutex<Vec<String>>>;

#[tokio::test]
async fn accessors_sharing_a_lock_run_one_at_a_time() -> Result<()> {
    let lock = CustomLock::<u32>::new();
    let journal: Journal = Arc::default();

    let slow = {
        let journal = Arc::clone(&journal);
        lock.add_accessor(
            move |n: u32| {
                let journal = Arc::clone(&journal);
                async move {
                    journal.lock().push(format!("slow start {n}"));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    journal.lock().push(format!("slow end {n}"));
                    Ok::<_, String>(n)
                }
            },
            all_queued(),
        )
    };
    let failing = {
        let journal = Arc::clone(&journal);
        lock.add_accessor(
            move |n: u32| {
                let journal = Arc::clone(&journal);
                async move {
                    journal.lock().push(format!("failing start {n}"));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    journal.lock().push(format!("failing end {n}"));
                    Err::<u32, _>(format!("rejected {n}"))
                }
            },
            all_queued(),
        )
    };

    let (first, second, third) = tokio::join!(slow.call(1), failing.call(2), slow.call(3));
    assert_eq!(first, Ok(1));
    assert_eq!(second, Err("rejected 2".to_string()));
    assert_eq!(third, Ok(3));

    // A failed call still lets the next one through
    assert_eq!(
        *journal.lock(),
        vec![
            "slow start 1",
            "slow end 1",
            "failing start 2",
            "failing end 2",
            "slow start 3",
            "slow end 3",
        ]
    );
    assert!(lock.is_empty());
    Ok(())
}

#[tokio::test]
async fn filter_limits_waiting_to_conflicts() -> Result<()> {
    let lock = CustomLock::<(String, u32)>::new();
    let journal: Journal = Arc::default();

    let accessor = {
        let journal = Arc::clone(&journal);
        lock.add_accessor(
            move |(name, millis): (String, u32)| {
                let journal = Arc::clone(&journal);
                async move {
                    tokio::time::sleep(Duration::from_millis(millis.into())).await;
                    journal.lock().push(name);
                    Ok::<_, String>(())
                }
            },
            conflicting(|a: &(String, u32), b: &(String, u32)| a.0.starts_with(&b.0[..1])),
        )
    };

    let (a, b, c) = tokio::join!(
        accessor.call(("x1".to_string(), 20)),
        accessor.call(("y1".to_string(), 1)),
        accessor.call(("x2".to_string(), 1)),
    );
    a.map_err(anyhow::Error::msg)?;
    b.map_err(anyhow::Error::msg)?;
    c.map_err(anyhow::Error::msg)?;

    // y1 is unrelated and finishes first; x2 waits behind x1
    assert_eq!(*journal.lock(), vec!["y1", "x1", "x2"]);
    Ok(())
}

#[tokio::test]
async fn filter_receives_tasks_in_submission_order() -> Result<()> {
    let lock = CustomLock::<u32>::new();
    let snapshots = Arc::new(Mutex::new(Vec::new()));

    let accessor = {
        let snapshots = Arc::clone(&snapshots);
        lock.add_accessor(
            |_: u32| async {
                tokio::task::yield_now().await;
                Ok::<_, String>(())
            },
            move |_: &u32, queued: &[QueuedTask<u32>]| {
                snapshots
                    .lock()
                    .push(queued.iter().map(|t| *t.arg()).collect::<Vec<_>>());
                queued.to_vec()
            },
        )
    };

    let (a, b, c) = tokio::join!(accessor.call(10), accessor.call(20), accessor.call(30));
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(
        *snapshots.lock(),
        vec![vec![], vec![10], vec![10, 20]]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_calls_never_overlap() -> Result<()> {
    let lock = CustomLock::<u32>::new();
    let running = Arc::new(Mutex::new((0usize, 0usize)));

    let accessor = {
        let running = Arc::clone(&running);
        Arc::new(lock.add_accessor(
            move |n: u32| {
                let running = Arc::clone(&running);
                async move {
                    {
                        let mut running = running.lock();
                        running.0 += 1;
                        running.1 = running.1.max(running.0);
                    }
                    tokio::task::yield_now().await;
                    running.lock().0 -= 1;
                    Ok::<_, String>(n)
                }
            },
            all_queued(),
        ))
    };

    let handles: Vec<_> = (0..100u32)
        .map(|n| {
            let accessor = Arc::clone(&accessor);
            tokio::spawn(async move { accessor.call(n).await })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await?, Ok(n as u32));
    }

    assert_eq!(running.lock().1, 1);
    assert!(lock.is_empty());
    Ok(())
}
