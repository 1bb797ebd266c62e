use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rivet_mvcc::{MvccConfig, MvccError, Partition, ScopedWriteTransaction, Timestamp};

#[derive(Parser, Debug)]
#[command(name = "rivet-mvcc", about = "Drive a concurrent workload against one MVCC partition")]
struct Args {
    /// Optional JSON config file; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of writer threads.
    #[arg(long, default_value_t = 4)]
    writers: usize,

    /// Transactions each writer runs.
    #[arg(long, default_value_t = 1_000)]
    txns_per_writer: usize,

    /// Number of reader threads waiting for clean snapshots.
    #[arg(long, default_value_t = 2)]
    readers: usize,

    /// Fraction of writer transactions that abort instead of committing.
    #[arg(long, default_value_t = 0.1)]
    abort_ratio: f64,

    /// Seed for the per-writer random generators.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

#[derive(Debug, Default, Serialize)]
struct WorkloadSummary {
    partition: String,
    duration_ms: u128,
    committed: u64,
    aborted: u64,
    clean_snapshots: u64,
    reader_timeouts: u64,
    final_snapshot: String,
    max_safe_time: Timestamp,
}

fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.abort_ratio) {
        bail!("--abort-ratio must be within [0, 1], got {}", args.abort_ratio);
    }

    let config = match &args.config {
        Some(path) => MvccConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MvccConfig::default(),
    };
    info!("starting rivet-mvcc workload with config {:?}", config);

    let partition = Partition::new(config).context("building partition")?;
    let summary = run_workload(&partition, &args)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_workload(partition: &Partition, args: &Args) -> Result<WorkloadSummary> {
    let manager = partition.manager();
    let committed = AtomicU64::new(0);
    let aborted = AtomicU64::new(0);
    let clean_snapshots = AtomicU64::new(0);
    let reader_timeouts = AtomicU64::new(0);
    let writers_done = AtomicU64::new(0);
    let started = Instant::now();

    thread::scope(|scope| -> Result<()> {
        for writer in 0..args.writers {
            let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(writer as u64));
            let (committed, aborted, writers_done) = (&committed, &aborted, &writers_done);
            scope.spawn(move || {
                for _ in 0..args.txns_per_writer {
                    let mut txn = ScopedWriteTransaction::new(manager.as_ref());
                    if rng.gen_bool(args.abort_ratio) {
                        // Leaving the scope aborts the reservation.
                        aborted.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    txn.start_applying();
                    txn.commit();
                    committed.fetch_add(1, Ordering::Relaxed);
                }
                writers_done.fetch_add(1, Ordering::Release);
            });
        }

        let mut readers = Vec::with_capacity(args.readers);
        for reader in 0..args.readers {
            let (clean_snapshots, reader_timeouts, writers_done) =
                (&clean_snapshots, &reader_timeouts, &writers_done);
            readers.push(scope.spawn(move || -> Result<()> {
                let mut last_watermark = Timestamp::MIN;
                while writers_done.load(Ordering::Acquire) < args.writers as u64 {
                    let target = partition.clock().now();
                    let deadline = Instant::now() + Duration::from_millis(50);
                    match manager.wait_for_clean_snapshot_at(target, deadline) {
                        Ok(snapshot) => {
                            let watermark = snapshot.all_committed_before();
                            if watermark < last_watermark || watermark <= target {
                                bail!(
                                    "reader {reader} observed watermark {watermark} after {last_watermark} (target {target})"
                                );
                            }
                            last_watermark = watermark;
                            clean_snapshots.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(MvccError::TimedOut { .. }) => {
                            reader_timeouts.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                debug!(reader, %last_watermark, "reader finished");
                Ok(())
            }));
        }

        for reader in readers {
            match reader.join() {
                Ok(result) => result?,
                Err(_) => bail!("reader thread panicked"),
            }
        }
        Ok(())
    })?;

    let snapshot = manager.take_snapshot();
    Ok(WorkloadSummary {
        partition: partition.config().partition_id.clone(),
        duration_ms: started.elapsed().as_millis(),
        committed: committed.into_inner(),
        aborted: aborted.into_inner(),
        clean_snapshots: clean_snapshots.into_inner(),
        reader_timeouts: reader_timeouts.into_inner(),
        final_snapshot: snapshot.to_string(),
        max_safe_time: manager.max_safe_time_to_read_at(),
    })
}
