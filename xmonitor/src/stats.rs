//! Responder statistics, summed over CPUs.

use anyhow::{Context, Result};
use aya::maps::{MapData, PerCpuArray};
use log::{info, warn};
use std::time::Duration;
use xmonitor_common::ResponderStats;

pub fn read(map: &PerCpuArray<MapData, ResponderStats>) -> Result<ResponderStats> {
    let per_cpu = map.get(&0, 0).context("Failed to read STATS")?;
    Ok(sum(per_cpu.iter()))
}

pub fn sum<'a>(per_cpu: impl IntoIterator<Item = &'a ResponderStats>) -> ResponderStats {
    per_cpu
        .into_iter()
        .fold(ResponderStats::default(), |mut total, cpu| {
            total.merge(cpu);
            total
        })
}

pub fn summary(stats: &ResponderStats) -> String {
    format!(
        "probes={} tx={} drop={} abort={} pass={} (overflow={}) blocks={} bytes={} \
         acquire_failures={} truncated={} mean={}ns other_frames={}",
        stats.probes,
        stats.transmitted,
        stats.dropped,
        stats.aborted,
        stats.passed,
        stats.overflows,
        stats.blocks,
        stats.payload_bytes,
        stats.acquire_failures,
        stats.truncated,
        stats.mean_probe_ns(),
        stats.frames.saturating_sub(stats.probes),
    )
}

pub fn log(map: &PerCpuArray<MapData, ResponderStats>) {
    match read(map) {
        Ok(stats) => info!("Stats: {}", summary(&stats)),
        Err(e) => warn!("{:#}", e),
    }
}

/// Log the statistics every `period` until the task is dropped.
pub async fn report(map: &PerCpuArray<MapData, ResponderStats>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        log(map);
    }
}
