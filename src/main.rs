// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! sensorstore — tiered sensor telemetry storage daemon
//!
//! Usage:
//!   sensorstore run      --config config.toml
//!   sensorstore status   --config config.toml
//!   sensorstore validate --config config.toml

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensorstore::api;
use sensorstore::config::Config;
use sensorstore::engine::Engine;
use sensorstore::source::ALL_SOURCES;
use sensorstore::spool::file as spool_file;
use sensorstore::spool::journal::Journal;

#[derive(Parser)]
#[command(name = "sensorstore", about = "Tiered sensor telemetry storage engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the storage daemon: tick loop, diagnostics API, shutdown flush.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print an engine status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Scan and validate every spool file on disk.
    Validate {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_daemon(config).await,
        Command::Status { config } => run_status(config),
        Command::Validate { config } => run_validate(config),
    }
}

fn load_config(path: &PathBuf) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    }
}

fn start_engine(cfg: &Config) -> (Arc<Engine>, Vec<Arc<sensorstore::sensor::SensorHandle>>) {
    let engine = match Engine::new(cfg.engine.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "Failed to initialise engine");
            std::process::exit(1);
        }
    };

    let mut handles = Vec::new();
    for entry in &cfg.sensors {
        let sensor_cfg = sensorstore::sensor::SensorConfig { id: entry.id, kind: entry.kind };
        let handle = match engine.configure_sensor(entry.source, sensor_cfg) {
            Ok(h) => h,
            Err(e) => {
                error!(source = %entry.source, sensor = entry.id, error = %e,
                    "Sensor configuration failed");
                continue;
            }
        };
        if cfg.engine.spool.is_some() {
            match engine.recover_sensor(&handle) {
                Ok(report) => {
                    if report.files_recovered > 0 {
                        info!(source = %entry.source, sensor = entry.id,
                            files = report.files_recovered, records = report.records_recovered,
                            "Recovered spooled data");
                    }
                }
                Err(e) => {
                    warn!(source = %entry.source, sensor = entry.id, error = %e,
                        "Recovery failed, continuing without disk history");
                }
            }
        }
        if let Err(e) = engine.activate_sensor(&handle) {
            error!(source = %entry.source, sensor = entry.id, error = %e, "Activation failed");
            continue;
        }
        handles.push(handle);
    }
    (engine, handles)
}

async fn run_daemon(config_path: PathBuf) {
    let cfg = load_config(&config_path);
    info!(
        sensors = cfg.sensors.len(),
        pool_bytes = cfg.engine.pool_bytes,
        tiered = cfg.engine.spool.is_some(),
        "Starting sensorstore"
    );

    let (engine, handles) = start_engine(&cfg);

    if cfg.api.enabled {
        let state = Arc::new(api::AppState { engine: engine.clone() });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    // The tick runs on its own thread: the spool machine does blocking
    // disk I/O that must not stall the async runtime.
    let stop = Arc::new(AtomicBool::new(false));
    let tick_engine = engine.clone();
    let tick_stop = stop.clone();
    let ticker = std::thread::spawn(move || {
        while !tick_stop.load(Ordering::Acquire) {
            tick_engine.tick(Utc::now().timestamp_millis() as u64);
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down…"),
        Err(e) => error!(error = %e, "Signal error"),
    }

    stop.store(true, Ordering::Release);
    engine.begin_shutdown();
    let deadline_ms = cfg
        .engine
        .spool
        .as_ref()
        .map_or(0, |s| s.emergency_deadline_ms);
    if deadline_ms > 0 {
        for handle in &handles {
            match engine.shutdown_sensor(handle, deadline_ms) {
                Ok(written) if written > 0 => {
                    info!(source = %handle.source, sensor = handle.config.id, sectors = written,
                        "Emergency flush");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(source = %handle.source, sensor = handle.config.id, error = %e,
                        "Emergency flush failed");
                }
            }
        }
    }
    if ticker.join().is_err() {
        warn!("Tick thread panicked during shutdown");
    }
    info!("sensorstore stopped");
}

fn run_status(config_path: PathBuf) {
    let cfg = load_config(&config_path);
    let (engine, _handles) = start_engine(&cfg);
    let stats = engine.stats();

    println!("=== sensorstore status ===");
    println!("Pool sectors : {} ({} free, {}% used)", stats.pool_capacity, stats.pool_free, stats.pool_used_pct);
    println!("Sensors      : {}", stats.sensors);
    println!("UTC          : {}", if stats.utc_available { "available" } else { "not yet synced" });
    if stats.sources.is_empty() {
        println!("Disk tier    : disabled (RAM-only profile)");
    } else {
        println!("{:<12} {:<10} {:<8} {:<12} {:<10} {:<8}", "Source", "Phase", "Files", "Bytes", "Spooled", "Lost");
        println!("{}", "-".repeat(64));
        for view in &stats.sources {
            println!(
                "{:<12} {:<10} {:<8} {:<12} {:<10} {:<8}",
                view.source.to_string(),
                format!("{:?}", view.phase).to_lowercase(),
                view.tracked_files,
                view.disk_bytes,
                view.stats.sectors_spooled,
                view.stats.records_lost,
            );
        }
    }
    for handle in engine.sensors() {
        let snap = handle.snapshot();
        println!(
            "  {}/{}: {} in RAM, {} on disk, {} dropped{}",
            snap.source,
            snap.id,
            snap.total_records,
            snap.total_disk_records,
            snap.dropped_records,
            if snap.quarantined { "  [QUARANTINED]" } else { "" },
        );
    }
}

fn run_validate(config_path: PathBuf) {
    let cfg = load_config(&config_path);
    let Some(spool) = &cfg.engine.spool else {
        println!("No disk tier configured; nothing to validate.");
        return;
    };

    match Journal::open(&spool.base_path) {
        Ok(journal) => {
            let open = journal.uncommitted().count();
            if open > 0 {
                println!("journal.log: {open} uncommitted spool writes (will be settled at recovery)");
            } else {
                println!("journal.log: clean");
            }
        }
        Err(e) => println!("journal.log: unreadable ({e})"),
    }

    let mut total_files = 0usize;
    let mut total_records = 0u64;
    let mut bad_files = 0usize;
    for source in ALL_SOURCES {
        let dir = spool.base_path.join(source.dir_name());
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((sensor_id, sequence, is_tmp)) = spool_file::parse_spool_file_name(&name)
            else {
                continue;
            };
            if is_tmp {
                println!("{source}/{name}: interrupted write (deleted at next recovery)");
                continue;
            }
            total_files += 1;
            match spool_file::scan_spool_file(&entry.path()) {
                Ok(scanned) if scanned.records.is_empty() => {
                    bad_files += 1;
                    println!("{source}/{name}: INVALID (no readable records)");
                }
                Ok(scanned) => {
                    total_records += scanned.record_total() as u64;
                    let suffix = if scanned.truncated { "  [torn tail]" } else { "" };
                    println!(
                        "{source}/{name}: sensor {sensor_id} seq {sequence}, {} sectors, {} records{suffix}",
                        scanned.records.len(),
                        scanned.record_total(),
                    );
                }
                Err(e) => {
                    bad_files += 1;
                    println!("{source}/{name}: unreadable ({e})");
                }
            }
        }
    }
    println!("\n{total_files} files, {total_records} records, {bad_files} invalid");
}
