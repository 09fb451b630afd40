//! TierDB CLI - drive a database directory from the shell

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::{thread_rng, Rng};
use std::fs::File;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tierdb_core::{
    ColumnFamilyHandle, CompactRangeOptions, Db, FlushOptions, Options, ReadOptions,
    WriteOptions,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{Cli, Commands};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_options(path: Option<&Path>) -> Result<Options> {
    let Some(path) = path else {
        return Ok(Options::default());
    };
    let file = File::open(path).with_context(|| format!("opening options file {:?}", path))?;
    let options: Options = serde_json::from_reader(file)
        .with_context(|| format!("parsing options file {:?}", path))?;
    debug!(?options, "Loaded options");
    Ok(options)
}

fn column_family(db: &Db, name: &str) -> Result<ColumnFamilyHandle> {
    match db.column_family(name) {
        Some(handle) => Ok(handle),
        None => bail!("column family {:?} does not exist", name),
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let options = load_options(cli.options.as_deref())?;
    let db = Db::open(options, &cli.database)
        .with_context(|| format!("opening database {:?}", cli.database))?;
    let cf = column_family(&db, &cli.cf)?;

    match cli.command {
        Commands::Put { key, value, sync } => {
            let w = WriteOptions { sync, ..Default::default() };
            db.put_cf(&w, &cf, key.as_bytes(), value.as_bytes())?;
        }
        Commands::Get { key } => match db.get_cf(&ReadOptions::default(), &cf, key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => bail!("key {:?} not found", key),
        },
        Commands::Delete { key, sync } => {
            let w = WriteOptions { sync, ..Default::default() };
            db.delete_cf(&w, &cf, key.as_bytes())?;
        }
        Commands::Scan { start, prefix, limit } => {
            scan(&db, &cf, start.or_else(|| prefix.clone()), prefix, limit)?;
        }
        Commands::Flush => {
            db.flush_cf(&FlushOptions::default(), &cf)?;
            info!("Flushed column family {:?}", cf.name());
        }
        Commands::Compact { begin, end, target_level } => {
            let opts = CompactRangeOptions {
                change_level: target_level.is_some(),
                target_level,
                ..Default::default()
            };
            let start = Instant::now();
            db.compact_range_cf(
                &opts,
                &cf,
                begin.as_deref().map(str::as_bytes),
                end.as_deref().map(str::as_bytes),
            )?;
            info!("Compaction finished in {:?}", start.elapsed());
        }
        Commands::Stats => stats(&db, &cf),
        Commands::Bench { num, value_size, threads, reads } => {
            bench(Arc::new(db), cf, num, value_size, threads.max(1), reads)?;
        }
    }
    Ok(())
}

fn scan(
    db: &Db,
    cf: &ColumnFamilyHandle,
    start: Option<String>,
    prefix: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut iter = db.iter_cf(&ReadOptions::default(), cf)?;
    match &start {
        Some(start) => iter.seek(start.as_bytes())?,
        None => iter.seek_to_first()?,
    }
    let mut shown = 0;
    while iter.valid() && shown < limit {
        if let Some(prefix) = &prefix {
            if !iter.key().starts_with(prefix.as_bytes()) {
                break;
            }
        }
        println!(
            "{} => {}",
            String::from_utf8_lossy(iter.key()),
            String::from_utf8_lossy(iter.value())
        );
        shown += 1;
        iter.next()?;
    }
    iter.status()?;
    println!("({} entries)", shown);
    Ok(())
}

fn stats(db: &Db, cf: &ColumnFamilyHandle) {
    println!("Database: {:?}", db.path());
    println!("Column family: {}", cf.name());
    println!("Last sequence: {}", db.latest_sequence_number());
    for name in [
        "tierdb.num-immutable-mem-table",
        "tierdb.cur-size-active-mem-table",
        "tierdb.background-errors",
        "tierdb.block-cache-usage",
    ] {
        if let Some(value) = db.property_cf(cf, name) {
            println!("{}: {}", name, value);
        }
    }
    if let Some(levels) = db.property_cf(cf, "tierdb.levelstats") {
        println!("{}", levels);
    }
    let families: Vec<String> = db
        .column_families()
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    println!("Column families: {}", families.join(", "));
}

fn bench(
    db: Arc<Db>,
    cf: ColumnFamilyHandle,
    num: usize,
    value_size: usize,
    threads: usize,
    reads: usize,
) -> Result<()> {
    info!(num, value_size, threads, "Starting write phase");
    let start = Instant::now();
    let per_thread = (num + threads - 1) / threads;
    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let db = Arc::clone(&db);
            let cf = cf.clone();
            thread::spawn(move || -> tierdb_core::Result<()> {
                let mut rng = thread_rng();
                let w = WriteOptions::default();
                let mut value = vec![0u8; value_size];
                let first = t * per_thread;
                for i in first..(first + per_thread).min(num) {
                    rng.fill(&mut value[..]);
                    db.put_cf(&w, &cf, bench_key(i).as_bytes(), &value)?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("bench writer panicked"),
        }
    }
    let elapsed = start.elapsed();
    println!(
        "write: {} ops in {:?} ({:.0} ops/s)",
        num,
        elapsed,
        num as f64 / elapsed.as_secs_f64()
    );

    db.flush_cf(&FlushOptions::default(), &cf)?;

    let r = ReadOptions::default();
    let mut rng = thread_rng();
    let mut found = 0usize;
    let start = Instant::now();
    for _ in 0..reads {
        let i = rng.gen_range(0..num.max(1));
        if db.get_cf(&r, &cf, bench_key(i).as_bytes())?.is_some() {
            found += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "read: {} ops in {:?} ({:.0} ops/s, {} found)",
        reads,
        elapsed,
        reads as f64 / elapsed.as_secs_f64(),
        found
    );
    if let Some(levels) = db.property_cf(&cf, "tierdb.levelstats") {
        println!("{}", levels);
    }
    Ok(())
}

fn bench_key(i: usize) -> String {
    format!("bench{:012}", i)
}
