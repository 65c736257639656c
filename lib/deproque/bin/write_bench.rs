// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Concurrent writes to the same file can interleave and leave it holding
//! something other than the last write. This benchmark issues a shuffled
//! burst of writes against a set of files, once per guarding strategy, and
//! reports throughput and how many files ended up with unexpected contents.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::future::try_join_all;
use rand::Rng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::time::Instant;

use deproque::{CustomLock, Deproque, KeyLock, LockConfig, conflicting};

type WriteArgs = (PathBuf, String);

/// Subdirectory of the chosen root that the benchmark owns.
const SCRATCH_SUBDIR: &str = "writes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    /// Plain `tokio::fs::write` with no coordination
    Unguarded,
    /// Deproque admitting one write per path at a time
    Deproque,
    /// KeyLock acquired per path
    Keylock,
    /// CustomLock with a same-path conflict filter
    Customlock,
}

#[derive(Parser)]
struct Args {
    /// Number of distinct target files
    #[clap(long, default_value_t = 100)]
    files: usize,

    /// Writes issued per file
    #[clap(long, default_value_t = 10)]
    duplicates: usize,

    /// Average size of each write, in characters
    #[clap(long, default_value_t = 100)]
    average_size: usize,

    /// Root under which a `writes` scratch subdirectory is created, wiped
    /// before each strategy and removed at the end. Nothing else under the
    /// root is touched. A temporary root is used when omitted
    #[clap(long)]
    dir: Option<PathBuf>,

    /// Strategies to run (all by default)
    #[clap(long, value_enum, value_delimiter = ',')]
    strategies: Vec<Strategy>,
}

struct Workload {
    order: Vec<usize>,
    contents: Vec<String>,
}

impl Workload {
    fn generate(files: usize, duplicates: usize, average_size: usize) -> Self {
        let mut rng = rand::rng();
        let total = files * duplicates;

        let contents = (0..total)
            .map(|_| {
                let len = rng.random_range(0..average_size.max(1) * 2);
                (0..len)
                    .map(|_| char::from(rng.random_range(b'a'..=b'z')))
                    .collect()
            })
            .collect();

        let mut order: Vec<usize> = (0..total).map(|i| i % files).collect();
        order.shuffle(&mut rng);

        Self { order, contents }
    }

    /// Contents of the last write submitted for `file`.
    fn expected(&self, file: usize) -> Option<&str> {
        self.order
            .iter()
            .rposition(|&f| f == file)
            .map(|i| self.contents[i].as_str())
    }

    fn jobs(&self, dir: &Path) -> Vec<WriteArgs> {
        self.order
            .iter()
            .zip(&self.contents)
            .map(|(file, contents)| (dir.join(file.to_string()), contents.clone()))
            .collect()
    }
}

struct Outcome {
    strategy: Strategy,
    elapsed_ms: f64,
    mismatches: usize,
}

async fn write((path, contents): WriteArgs) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await
}

async fn run(strategy: Strategy, jobs: Vec<WriteArgs>) -> Result<()> {
    match strategy {
        Strategy::Unguarded => {
            try_join_all(jobs.into_iter().map(write)).await?;
        }
        Strategy::Deproque => {
            let queue = Deproque::new(
                write,
                |args: &WriteArgs, executing: &[WriteArgs], _: &[WriteArgs]| {
                    executing.iter().all(|other| other.0 != args.0)
                },
            );
            try_join_all(jobs.into_iter().map(|job| queue.add(job))).await?;
        }
        Strategy::Keylock => {
            let lock = KeyLock::with_config(&LockConfig::from_env()?);
            try_join_all(jobs.into_iter().map(|job| {
                let lock = lock.clone();
                async move {
                    let guard = lock.acquire(job.0.clone()).await;
                    let result = write(job).await;
                    guard.release();
                    result
                }
            }))
            .await?;
        }
        Strategy::Customlock => {
            let lock = CustomLock::<WriteArgs>::new();
            let accessor = lock.add_accessor(
                write,
                conflicting(|a: &WriteArgs, b: &WriteArgs| a.0 == b.0),
            );
            try_join_all(jobs.into_iter().map(|job| accessor.call(job))).await?;
        }
    }
    Ok(())
}

async fn count_mismatches(dir: &Path, workload: &Workload, files: usize) -> Result<usize> {
    let mut mismatches = 0;
    for file in 0..files {
        let Some(expected) = workload.expected(file) else {
            continue;
        };
        let path = dir.join(file.to_string());
        let actual = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if actual != expected {
            tracing::debug!(file, "contents differ from last submitted write");
            mismatches += 1;
        }
    }
    Ok(mismatches)
}

fn scratch_dir(root: &Path) -> PathBuf {
    root.join(SCRATCH_SUBDIR)
}

async fn remove_scratch(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("removing {}", dir.display()))?;
    }
    Ok(())
}

async fn reset_dir(dir: &Path) -> Result<()> {
    remove_scratch(dir).await?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    deproque::logging::init();
    let args = Args::parse();

    let strategies = if args.strategies.is_empty() {
        Strategy::value_variants().to_vec()
    } else {
        args.strategies.clone()
    };

    let scratch = tempfile::tempdir()?;
    let root = args.dir.as_deref().unwrap_or(scratch.path());
    let dir = scratch_dir(root);

    println!(
        "Performing test over {} files with an average file size of {} and {} duplicate writes per file.",
        args.files, args.average_size, args.duplicates
    );

    let workload = Workload::generate(args.files, args.duplicates, args.average_size);
    let total = args.files * args.duplicates;
    let mut outcomes = Vec::with_capacity(strategies.len());

    for strategy in strategies {
        reset_dir(&dir).await?;
        let jobs = workload.jobs(&dir);

        let start = Instant::now();
        run(strategy, jobs).await?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let mismatches = count_mismatches(&dir, &workload, args.files).await?;
        tracing::info!(?strategy, elapsed_ms, mismatches, "strategy finished");
        outcomes.push(Outcome {
            strategy,
            elapsed_ms,
            mismatches,
        });
    }

    remove_scratch(&dir).await?;

    outcomes.sort_by(|a, b| a.elapsed_ms.total_cmp(&b.elapsed_ms));
    let width = outcomes
        .iter()
        .map(|o| format!("{:?}", o.strategy).len())
        .max()
        .unwrap_or(0);

    for outcome in &outcomes {
        let name = format!("[{:?}]", outcome.strategy);
        println!(
            "{:<width$} {:.3} op/ms with {} errors ({}%)",
            name,
            total as f64 / outcome.elapsed_ms.max(f64::EPSILON),
            outcome.mismatches,
            outcome.mismatches * 100 / args.files.max(1),
            width = width + 2,
        );
    }

    Ok(())
}
