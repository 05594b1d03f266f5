//! Fastpath Node
//!
//! Loopback deployment of the packet engine: launches the configured
//! coprocessor devices in-process, builds a generate -> filter -> digest ->
//! verify graph and drives it until the generator runs dry.

mod elements;

use anyhow::Context;
use elements::{DigestKernel, DigestOffload, LengthFilter, PacketGen, SinkCounters, VerifySink};
use fastpath_common::{FastpathConfig, VDeviceConfig};
use fastpath_graph::{ComputeContext, ElementGraph};
use fastpath_offload::{describe_metrics, DeviceManager};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const BATCHES: usize = 1024;
const BATCH_SIZE: usize = 32;
const FLOWS: u64 = 64;
const MIN_PACKET_LEN: usize = 20;
const MAX_TASK_AGE: Duration = Duration::from_micros(200);
const MAX_ITERATIONS: u64 = 10_000_000;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Fastpath Node v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("FASTPATH_CONFIG").unwrap_or_else(|_| "/etc/fastpath/node.json".into());
    let mut config = FastpathConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "config not loaded, using defaults");
        FastpathConfig::default()
    });
    if config.devices.is_empty() {
        config.devices.push(VDeviceConfig::default());
    }
    config.validate().context("invalid configuration")?;

    describe_metrics();
    let mut devices =
        DeviceManager::launch_all(&config.devices, Arc::new(DigestKernel)).context("failed to launch devices")?;
    let device = &config.devices[0];
    let link = devices
        .link(device.device_id)
        .with_context(|| format!("no link to device {}", device.device_id))?;

    let min_batches = (device.offload_batch_size as usize).div_ceil(BATCH_SIZE);
    let counters = Arc::new(SinkCounters::default());

    let mut graph = ElementGraph::new(&config.graph);
    let gen = graph.add_element(PacketGen::new(BATCHES, BATCH_SIZE, FLOWS))?;
    let filter = graph.add_element(LengthFilter::new(MIN_PACKET_LEN))?;
    let digest = graph.add_element(DigestOffload::new(link, min_batches, MAX_TASK_AGE, counters.clone()))?;
    let sink = graph.add_element(VerifySink::new(counters.clone()))?;
    graph.link_element(filter, 0, gen, 0)?;
    graph.link_element(digest, 0, filter, 0)?;
    graph.link_element(sink, 0, digest, 0)?;
    graph.validate()?;

    let started = Instant::now();
    let mut ctx = ComputeContext::new(graph, config.driver.clone());
    let iterations = ctx.run_until(
        |g| g.stats().batches_admitted == BATCHES as u64 && g.is_idle(),
        MAX_ITERATIONS,
    );
    let elapsed = started.elapsed();

    let graph_stats = *ctx.graph().stats();
    let device_stats = devices.stats(device.device_id).unwrap_or_default();
    let packets = counters.packets.get();
    let summary = serde_json::json!({
        "iterations": iterations,
        "elapsed_us": elapsed.as_micros() as u64,
        "graph": {
            "batches_admitted": graph_stats.batches_admitted,
            "tasks_dispatched": graph_stats.tasks_dispatched,
            "tasks_deferred": graph_stats.tasks_deferred,
            "tasks_failed": graph_stats.tasks_failed,
            "packets_dropped": graph_stats.packets_dropped,
        },
        "sink": {
            "packets": packets,
            "bytes": counters.bytes.get(),
            "digest_mismatches": counters.mismatches.get(),
            "lost_packets": counters.lost_packets.get(),
            "mean_latency_ns": if packets > 0 { counters.latency_ns.get() / packets } else { 0 },
        },
        "device": {
            "batches": device_stats.total_batches_processed,
            "packets": device_stats.total_packets_processed,
            "mean_process_us": device_stats.mean_process_us,
            "mean_transfer_us": device_stats.mean_transfer_us,
            "mpps": device_stats.packet_rate_mpps(),
        },
    });
    tracing::info!("run complete: {}", serde_json::to_string_pretty(&summary)?);

    drop(ctx);
    devices.shutdown();

    if counters.mismatches.get() > 0 {
        anyhow::bail!("{} packets carried a wrong digest", counters.mismatches.get());
    }
    if counters.lost_packets.get() > 0 {
        anyhow::bail!("{} packets lost their device results", counters.lost_packets.get());
    }
    if graph_stats.tasks_failed > 0 {
        anyhow::bail!("{} offload tasks failed", graph_stats.tasks_failed);
    }
    Ok(())
}
