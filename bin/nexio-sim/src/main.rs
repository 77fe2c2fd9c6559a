#![allow(clippy::result_large_err)]
//! Nexio Sim
//!
//! Builds a nexus over a set of child URIs, runs a write/read workload,
//! optionally adds a child and waits for its rebuild, takes a snapshot
//! across the replicas and prints the resulting nexus status as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use chrono::Utc;
use clap::Parser;
use nexio_common::{NexusConfig, SnapshotParams};
use nexio_device::UriDeviceFactory;
use nexio_nexus::{
    MetricsCollector, Nexus, NexusManager, PrometheusExporter, RebuildState, SnapshotDescriptor,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "nexio-sim", about = "Nexio nexus workload driver")]
struct Args {
    /// Child URIs (defaults to two memory devices)
    children: Vec<String>,

    /// Nexus configuration file (JSON)
    #[arg(long, env = "NEXIO_CONFIG")]
    config: Option<PathBuf>,

    /// Nexus name
    #[arg(long, default_value = "nexus0")]
    name: String,

    /// Nexus size in MiB
    #[arg(long, default_value_t = 64)]
    size_mb: u64,

    /// Number of I/O channels (overrides the configuration file)
    #[arg(long, env = "NEXIO_IO_CHANNELS")]
    io_channels: Option<usize>,

    /// Number of 4 KiB writes in the workload
    #[arg(long, default_value_t = 256)]
    writes: u64,

    /// Child URI to add after the workload; it is rebuilt from the others
    #[arg(long)]
    add_child: Option<String>,

    /// Snapshot name; no snapshot is taken when unset
    #[arg(long)]
    snapshot: Option<String>,

    /// Also print Prometheus metrics
    #[arg(long)]
    metrics: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

const IO_SIZE: u64 = 4096;

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Nexio sim");

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut config = match args.config {
        Some(ref path) => NexusConfig::from_json_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => NexusConfig::default(),
    };
    if let Some(io_channels) = args.io_channels {
        config.io_channels = io_channels;
    }
    config.validate().context("validate config")?;

    let children = if args.children.is_empty() {
        (0..2)
            .map(|i| format!("malloc:///{}-c{i}?size_mb={}", args.name, args.size_mb))
            .collect()
    } else {
        args.children.clone()
    };
    let size_bytes = args
        .size_mb
        .checked_mul(1024 * 1024)
        .with_context(|| format!("--size-mb {} is too large", args.size_mb))?;

    // ── Nexus ─────────────────────────────────────────────────────────────────
    let manager = NexusManager::new(Arc::new(UriDeviceFactory::new()));
    let nexus = manager
        .create_nexus(&args.name, size_bytes, &children, config)
        .await
        .context("create nexus")?;
    info!("{:?}: status {:?}", nexus, nexus.status());

    // ── Workload ──────────────────────────────────────────────────────────────
    run_workload(&nexus, args.writes).await?;

    if let Some(ref uri) = args.add_child {
        add_and_rebuild(&nexus, uri).await?;
    }

    if let Some(ref name) = args.snapshot {
        take_snapshot(&nexus, name).await?;
    }

    // ── Report ────────────────────────────────────────────────────────────────
    let info = nexus.info();
    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("serialize nexus info")?
    );
    if args.metrics {
        let collector = MetricsCollector::new();
        collector.update_nexus(&nexus);
        print!("{}", PrometheusExporter::default().export(&collector));
    }

    manager.shutdown().await;
    info!("Nexio sim finished");
    Ok(())
}

/// Offset of the `i`th write, spread over the nexus
fn offset_of(i: u64, size_bytes: u64) -> u64 {
    let slots = size_bytes / IO_SIZE;
    (i.wrapping_mul(7919) % slots) * IO_SIZE
}

fn payload(i: u64) -> Bytes {
    Bytes::from(vec![(i % 251) as u8 + 1; IO_SIZE as usize])
}

async fn run_workload(nexus: &Nexus, writes: u64) -> Result<()> {
    let started = Instant::now();
    for i in 0..writes {
        nexus
            .write(offset_of(i, nexus.size_bytes()), payload(i))
            .await
            .with_context(|| format!("write {i}"))?;
    }
    nexus.flush().await.context("flush")?;
    info!(
        "{:?}: {} writes in {:?}",
        nexus,
        writes,
        started.elapsed()
    );

    // Later writes to a colliding offset win
    let mut last = std::collections::HashMap::new();
    for i in 0..writes {
        last.insert(offset_of(i, nexus.size_bytes()), i);
    }
    for (offset, i) in last {
        let data = nexus
            .read(offset, IO_SIZE)
            .await
            .with_context(|| format!("read at {offset}"))?;
        ensure!(data == payload(i), "data mismatch at offset {offset}");
    }
    info!("{:?}: workload verified", nexus);
    Ok(())
}

async fn add_and_rebuild(nexus: &Arc<Nexus>, uri: &str) -> Result<()> {
    let status = nexus
        .add_child(uri)
        .await
        .with_context(|| format!("add child {uri}"))?;
    info!("{:?}: added {} ({:?})", nexus, uri, status);

    let Some(job) = nexus.rebuild_job(uri) else {
        // Already retired, or never started
        return match nexus.rebuild_state(uri) {
            Ok(RebuildState::Completed) => Ok(()),
            Ok(state) => bail!("rebuild of {uri} ended {state}"),
            Err(e) => {
                warn!("{:?}: no rebuild for {}: {}", nexus, uri, e);
                Ok(())
            }
        };
    };
    let state = job.wait().await;
    let stats = job.stats();
    info!(
        "{:?}: rebuild of {} {}: {} transferred, {} skipped, {} replayed",
        nexus,
        uri,
        state,
        stats.segments_transferred,
        stats.segments_skipped,
        stats.segments_replayed
    );
    if state != RebuildState::Completed {
        bail!(
            "rebuild of {uri} ended {state}: {}",
            job.error().unwrap_or_default()
        );
    }
    Ok(())
}

async fn take_snapshot(nexus: &Nexus, name: &str) -> Result<()> {
    let txn_id = uuid::Uuid::new_v4().to_string();
    let descriptors: Vec<_> = nexus
        .children()
        .into_iter()
        .map(|child| SnapshotDescriptor {
            skip: !child.state.is_read_eligible(),
            params: SnapshotParams {
                name: name.to_string(),
                entity_id: nexus.name().to_string(),
                txn_id: txn_id.clone(),
                snapshot_uuid: uuid::Uuid::new_v4().to_string(),
                create_time: Utc::now(),
            },
            child_uri: child.uri,
        })
        .collect();

    let result = nexus
        .create_snapshot(&descriptors)
        .await
        .with_context(|| format!("snapshot {name}"))?;
    info!(
        "{:?}: snapshot {} taken on {} replicas",
        nexus, name, result.replicas
    );
    Ok(())
}
