// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use quota_reservation::{
    MemoryQuotaLedger, QuotaKey, QuotaReservation, QuotaReservationManager, SequencedTaskRunner,
    StorageType, UsageCacheQuotaBackend,
};
use serde::Serialize;
use usage_cache::{UsageCache, UsageRecord, USAGE_FILE_NAME};

#[derive(Parser)]
#[command(
    name = "fileapi-quota",
    version = env!("BUILT_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Reserve, track and reconcile storage quota for file writers."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the usage cache record of an origin.
    Usage(Target),
    /// Run one writer session against an origin and print a summary.
    Write(WriteArgs),
    /// List the usage caches whose usage has to be recounted.
    Check {
        /// Directory holding the per-origin storage.
        #[arg(long)]
        data_dir: PathBuf,
    },
}

#[derive(Args)]
struct Target {
    /// Directory holding the per-origin storage.
    #[arg(long)]
    data_dir: PathBuf,
    /// Origin owning the storage, e.g. "https://example.com".
    #[arg(long)]
    origin: String,
    /// temporary, persistent or syncable.
    #[arg(long = "type", default_value = "temporary")]
    storage_type: StorageType,
}

#[derive(Args)]
struct WriteArgs {
    #[command(flatten)]
    target: Target,
    /// File name inside the origin directory.
    #[arg(long)]
    file: String,
    /// Quota ceiling of the origin, in bytes.
    #[arg(long)]
    quota: i64,
    /// Size to keep the reservation refreshed to, in bytes.
    #[arg(long)]
    reserve: i64,
    /// Positional write ending at this offset. May be repeated.
    #[arg(long = "offset")]
    offsets: Vec<i64>,
    /// Append of this many bytes. May be repeated.
    #[arg(long = "append")]
    appends: Vec<i64>,
    /// Close the file like a crashed client, without reporting the writes.
    #[arg(long)]
    crash: bool,
}

#[derive(Debug, Serialize)]
struct WriteSummary {
    file: PathBuf,
    file_size: u64,
    remaining_quota: i64,
    denied_writes: usize,
    ledger_usage: i64,
    usage_cache: UsageRecord,
}

#[derive(Debug, Serialize)]
struct RecountEntry {
    path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<UsageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn refresh(
    runner: &SequencedTaskRunner,
    reservation: &Rc<QuotaReservation>,
    size: i64,
) -> anyhow::Result<()> {
    let outcome = Rc::new(RefCell::new(None));
    let o = outcome.clone();
    reservation
        .refresh_reservation(size, move |result| *o.borrow_mut() = Some(result))
        .context("Failed to start reservation refresh")?;
    runner.run_until_idle();

    let result = outcome.borrow_mut().take();
    result
        .ok_or_else(|| anyhow!("Reservation refresh never completed"))?
        .context("Failed to refresh reservation")
}

// Makes sure `growth` bytes fit in the reservation, refreshing it if they
// don't. Returns whether the write may go ahead.
fn ensure_quota(
    runner: &SequencedTaskRunner,
    reservation: &Rc<QuotaReservation>,
    growth: i64,
    reserve: i64,
) -> anyhow::Result<bool> {
    if growth <= reservation.remaining_quota() {
        return Ok(true);
    }
    refresh(runner, reservation, reserve.max(growth))?;
    Ok(growth <= reservation.remaining_quota())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize report")?
    );
    Ok(())
}

fn usage(target: &Target) -> anyhow::Result<UsageRecord> {
    let key = QuotaKey::new(&target.origin, target.storage_type);
    let path = UsageCacheQuotaBackend::usage_cache_path(&target.data_dir, &key);
    UsageCache::new()
        .read_record(&path)
        .with_context(|| format!("Failed to read usage of {key}"))
}

fn write(args: &WriteArgs) -> anyhow::Result<WriteSummary> {
    let data_dir = &args.target.data_dir;
    let key = QuotaKey::new(&args.target.origin, args.target.storage_type);
    let usage_path = UsageCacheQuotaBackend::usage_cache_path(data_dir, &key);

    let mut usage_cache = UsageCache::new();
    let initial_usage = if usage_cache.exists(&usage_path) {
        usage_cache
            .get_usage(&usage_path)
            .context("Failed to read initial usage")?
    } else {
        0
    };

    let runner = SequencedTaskRunner::new();
    let ledger = Rc::new(MemoryQuotaLedger::new(args.quota));
    ledger.set_usage(&key, initial_usage);
    let backend = UsageCacheQuotaBackend::new(runner.clone(), data_dir, ledger.clone());
    let manager = QuotaReservationManager::new(Box::new(backend));

    let reservation = manager.create_reservation(&key.origin, key.storage_type);
    refresh(&runner, &reservation, args.reserve)?;
    info!(
        "Reserved {} bytes for {}",
        reservation.remaining_quota(),
        key
    );

    let path = UsageCacheQuotaBackend::directory_for(data_dir, &key).join(&args.file);
    let handle = reservation.get_open_file_handle(&path);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let file_len = |path: &Path| -> anyhow::Result<u64> {
        Ok(fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len())
    };

    let mut denied_writes = 0;
    for &offset in &args.offsets {
        let growth = (offset - handle.max_written_offset()).max(0);
        if !ensure_quota(&runner, &reservation, growth, args.reserve)? {
            warn!("Write up to offset {offset} exceeds the quota of {key}");
            denied_writes += 1;
            continue;
        }
        let offset = u64::try_from(offset).context("Negative write offset")?;
        if file_len(&path)? < offset {
            file.set_len(offset).context("Failed to extend file")?;
        }
        if !args.crash {
            handle.update_max_written_offset(offset as i64);
        }
    }
    for &amount in &args.appends {
        if !ensure_quota(&runner, &reservation, amount, args.reserve)? {
            warn!("Append of {amount} bytes exceeds the quota of {key}");
            denied_writes += 1;
            continue;
        }
        let amount = u64::try_from(amount).context("Negative append amount")?;
        file.set_len(file_len(&path)? + amount)
            .context("Failed to extend file")?;
        if !args.crash {
            handle.add_append_mode_write_amount(amount as i64);
        }
    }

    if args.crash {
        warn!("Dropping {} as a crashed client", path.display());
        reservation.on_client_crash();
    }
    drop(file);
    drop(handle);
    let remaining_quota = reservation.remaining_quota();
    drop(reservation);
    drop(manager);
    runner.run_until_idle();

    Ok(WriteSummary {
        file_size: file_len(&path)?,
        file: path,
        remaining_quota,
        denied_writes,
        ledger_usage: ledger.usage(&key),
        usage_cache: usage_cache
            .read_record(&usage_path)
            .context("Failed to read final usage")?,
    })
}

fn check(data_dir: &Path) -> anyhow::Result<Vec<RecountEntry>> {
    let mut usage_cache = UsageCache::new();
    let mut entries = Vec::new();

    let origins = fs::read_dir(data_dir)
        .with_context(|| format!("Failed to list {}", data_dir.display()))?;
    for origin in origins {
        let origin = origin.context("Failed to read directory entry")?.path();
        if !origin.is_dir() {
            continue;
        }
        let types = fs::read_dir(&origin)
            .with_context(|| format!("Failed to list {}", origin.display()))?;
        for storage in types {
            let path = storage
                .context("Failed to read directory entry")?
                .path()
                .join(USAGE_FILE_NAME);
            if !path.is_file() {
                continue;
            }
            match usage_cache.read_record(&path) {
                Ok(record) if !record.needs_recount() => {}
                Ok(record) => entries.push(RecountEntry {
                    path,
                    record: Some(record),
                    error: None,
                }),
                Err(e) => entries.push(RecountEntry {
                    path,
                    record: None,
                    error: Some(e.to_string()),
                }),
            }
        }
    }
    usage_cache.close_cache_files();

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Usage(target) => print_json(&usage(&target)?),
        Command::Write(args) => print_json(&write(&args)?),
        Command::Check { data_dir } => print_json(&check(&data_dir)?),
    }
}

fn main() {
    env_logger::init();

    let exit_code = match run(Cli::parse()) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:?}");
            eprintln!("Error: {e:?}");
            1
        }
    };
    process::exit(exit_code);
}
