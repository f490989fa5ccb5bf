//! Host counter refresher.
//!
//! Samples procfs into the fixed block layouts and writes them into the
//! single-slot `HOST_*` maps read by the direct strategy.

use anyhow::{anyhow, Context, Result};
use aya::maps::{Array, MapData};
use aya::{Ebpf, Pod};
use log::warn;
use nix::time::{clock_gettime, ClockId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xmonitor_common::{
    CpuMetrics, DiskMetrics, Ipv4Metrics, MemoryMetrics, MetricCategory, TransportMetrics,
};

/// CLOCK_MONOTONIC in nanoseconds, the clock `bpf_ktime_get_ns` reads.
pub fn monotonic_ns() -> Result<u64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).context("clock_gettime failed")?;
    Ok(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
}

/// Aggregate `cpu` line of `/proc/stat`.
pub fn parse_stat(text: &str) -> Result<CpuMetrics> {
    let line = text
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| anyhow!("no aggregate cpu line"))?;
    let mut v = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>().unwrap_or(0));
    let mut next = || v.next().unwrap_or(0);
    Ok(CpuMetrics {
        sampled_at_ns: 0,
        user: next(),
        nice: next(),
        system: next(),
        idle: next(),
        iowait: next(),
        irq: next(),
        softirq: next(),
        steal: next(),
        guest: next(),
        guest_nice: next(),
    })
}

/// Whether `name` is a partition of `disk`: `sda1` of `sda`, or `nvme0n1p1`
/// of `nvme0n1` when the disk name already ends in a digit.
fn is_partition_of(name: &str, disk: &str) -> bool {
    let Some(suffix) = name.strip_prefix(disk) else {
        return false;
    };
    let number = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        match suffix.strip_prefix('p') {
            Some(number) => number,
            None => return false,
        }
    } else {
        suffix
    };
    !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
}

/// Devices whose I/O is already counted on the disks beneath them.
fn is_virtual(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// `/proc/diskstats`, summed over whole physical disks.
///
/// Loop, ram and stacked (device-mapper, md) devices are skipped, as are
/// partitions of a listed disk.
pub fn parse_diskstats(text: &str) -> DiskMetrics {
    let rows: Vec<(&str, Vec<u64>)> = text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().skip(2);
            let name = fields.next()?;
            let values = fields.map(|f| f.parse().unwrap_or(0)).collect();
            Some((name, values))
        })
        .filter(|(name, _)| !is_virtual(name))
        .collect();

    let mut disk = DiskMetrics::default();
    for (name, values) in &rows {
        let is_partition = rows.iter().any(|(other, _)| is_partition_of(name, other));
        if is_partition {
            continue;
        }
        let at = |i: usize| values.get(i).copied().unwrap_or(0);
        disk.reads += at(0);
        disk.reads_merged += at(1);
        disk.sectors_read += at(2);
        disk.read_ms += at(3);
        disk.writes += at(4);
        disk.writes_merged += at(5);
        disk.sectors_written += at(6);
        disk.write_ms += at(7);
        disk.in_flight += at(8);
        disk.io_ms += at(9);
        disk.weighted_io_ms += at(10);
    }
    disk
}

/// `/proc/meminfo`, in kB.
pub fn parse_meminfo(text: &str) -> MemoryMetrics {
    let values: HashMap<&str, u64> = text
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key, value))
        })
        .collect();
    let get = |key: &str| values.get(key).copied().unwrap_or(0);
    MemoryMetrics {
        sampled_at_ns: 0,
        total: get("MemTotal"),
        free: get("MemFree"),
        available: get("MemAvailable"),
        buffers: get("Buffers"),
        cached: get("Cached"),
        swap_total: get("SwapTotal"),
        swap_free: get("SwapFree"),
        dirty: get("Dirty"),
        writeback: get("Writeback"),
        shmem: get("Shmem"),
        slab: get("Slab"),
    }
}

/// `/proc/net/snmp`: header and value lines come in pairs per protocol.
fn snmp_table(text: &str) -> HashMap<(&str, &str), u64> {
    let mut table = HashMap::new();
    let lines: Vec<&str> = text.lines().collect();
    for pair in lines.chunks(2) {
        let [header, values] = pair else { continue };
        let (Some((proto, names)), Some((proto2, values))) =
            (header.split_once(':'), values.split_once(':'))
        else {
            continue;
        };
        if proto != proto2 {
            continue;
        }
        for (name, value) in names.split_whitespace().zip(values.split_whitespace()) {
            // Some counters (Tcp MaxConn) are signed; those read as zero.
            table.insert((proto, name), value.parse().unwrap_or(0));
        }
    }
    table
}

pub fn parse_snmp(text: &str) -> (Ipv4Metrics, TransportMetrics) {
    let table = snmp_table(text);
    let ip = |name| table.get(&("Ip", name)).copied().unwrap_or(0);
    let tcp = |name| table.get(&("Tcp", name)).copied().unwrap_or(0);
    let udp = |name| table.get(&("Udp", name)).copied().unwrap_or(0);

    let ipv4 = Ipv4Metrics {
        sampled_at_ns: 0,
        in_receives: ip("InReceives"),
        in_hdr_errors: ip("InHdrErrors"),
        in_addr_errors: ip("InAddrErrors"),
        forw_datagrams: ip("ForwDatagrams"),
        in_unknown_protos: ip("InUnknownProtos"),
        in_discards: ip("InDiscards"),
        in_delivers: ip("InDelivers"),
        out_requests: ip("OutRequests"),
        out_discards: ip("OutDiscards"),
        out_no_routes: ip("OutNoRoutes"),
    };
    let transport = TransportMetrics {
        sampled_at_ns: 0,
        tcp_active_opens: tcp("ActiveOpens"),
        tcp_passive_opens: tcp("PassiveOpens"),
        tcp_attempt_fails: tcp("AttemptFails"),
        tcp_estab_resets: tcp("EstabResets"),
        tcp_curr_estab: tcp("CurrEstab"),
        tcp_in_segs: tcp("InSegs"),
        tcp_out_segs: tcp("OutSegs"),
        tcp_retrans_segs: tcp("RetransSegs"),
        tcp_in_errs: tcp("InErrs"),
        tcp_out_rsts: tcp("OutRsts"),
        udp_in_datagrams: udp("InDatagrams"),
        udp_no_ports: udp("NoPorts"),
        udp_in_errors: udp("InErrors"),
        udp_out_datagrams: udp("OutDatagrams"),
        udp_rcvbuf_errors: udp("RcvbufErrors"),
        udp_sndbuf_errors: udp("SndbufErrors"),
    };
    (ipv4, transport)
}

/// One sample of every requested category, stamped with the same time.
#[derive(Debug, Default)]
pub struct HostSample {
    pub cpu: Option<CpuMetrics>,
    pub disk: Option<DiskMetrics>,
    pub memory: Option<MemoryMetrics>,
    pub ipv4: Option<Ipv4Metrics>,
    pub transport: Option<TransportMetrics>,
}

pub struct HostSampler {
    proc_root: PathBuf,
    categories: Vec<MetricCategory>,
}

impl HostSampler {
    pub fn new(proc_root: impl Into<PathBuf>, categories: &[MetricCategory]) -> Self {
        Self {
            proc_root: proc_root.into(),
            categories: categories.to_vec(),
        }
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn sample(&self, now_ns: u64) -> Result<HostSample> {
        let wants = |c| self.categories.contains(&c);
        let mut sample = HostSample::default();

        if wants(MetricCategory::Cpu) {
            let mut cpu = parse_stat(&self.read("stat")?)?;
            cpu.sampled_at_ns = now_ns;
            sample.cpu = Some(cpu);
        }
        if wants(MetricCategory::Disk) {
            let mut disk = parse_diskstats(&self.read("diskstats")?);
            disk.sampled_at_ns = now_ns;
            sample.disk = Some(disk);
        }
        if wants(MetricCategory::Memory) {
            let mut memory = parse_meminfo(&self.read("meminfo")?);
            memory.sampled_at_ns = now_ns;
            sample.memory = Some(memory);
        }
        if wants(MetricCategory::Ipv4) || wants(MetricCategory::Transport) {
            let (mut ipv4, mut transport) = parse_snmp(&self.read("net/snmp")?);
            ipv4.sampled_at_ns = now_ns;
            transport.sampled_at_ns = now_ns;
            sample.ipv4 = wants(MetricCategory::Ipv4).then_some(ipv4);
            sample.transport = wants(MetricCategory::Transport).then_some(transport);
        }
        Ok(sample)
    }
}

/// The single-slot host maps of a loaded program.
pub struct HostMaps {
    cpu: Array<MapData, CpuMetrics>,
    disk: Array<MapData, DiskMetrics>,
    memory: Array<MapData, MemoryMetrics>,
    ipv4: Array<MapData, Ipv4Metrics>,
    transport: Array<MapData, TransportMetrics>,
}

fn take_array<T: Pod>(bpf: &mut Ebpf, name: &str) -> Result<Array<MapData, T>> {
    let map = bpf
        .take_map(name)
        .with_context(|| format!("{} map not found", name))?;
    Array::try_from(map).with_context(|| format!("{} is not an array map", name))
}

impl HostMaps {
    pub fn take(bpf: &mut Ebpf) -> Result<Self> {
        Ok(Self {
            cpu: take_array(bpf, "HOST_CPU")?,
            disk: take_array(bpf, "HOST_DISK")?,
            memory: take_array(bpf, "HOST_MEMORY")?,
            ipv4: take_array(bpf, "HOST_IPV4")?,
            transport: take_array(bpf, "HOST_TRANSPORT")?,
        })
    }

    pub fn write(&mut self, sample: &HostSample) -> Result<()> {
        if let Some(cpu) = sample.cpu {
            self.cpu.set(0, cpu, 0).context("Failed to write HOST_CPU")?;
        }
        if let Some(disk) = sample.disk {
            self.disk.set(0, disk, 0).context("Failed to write HOST_DISK")?;
        }
        if let Some(memory) = sample.memory {
            self.memory
                .set(0, memory, 0)
                .context("Failed to write HOST_MEMORY")?;
        }
        if let Some(ipv4) = sample.ipv4 {
            self.ipv4.set(0, ipv4, 0).context("Failed to write HOST_IPV4")?;
        }
        if let Some(transport) = sample.transport {
            self.transport
                .set(0, transport, 0)
                .context("Failed to write HOST_TRANSPORT")?;
        }
        Ok(())
    }
}

/// Refresh the host maps every `period` until the task is dropped.
///
/// A failed refresh leaves the previous sample in place; its timestamp
/// tells readers how old it is.
pub async fn refresh(sampler: HostSampler, mut maps: HostMaps, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failing = false;
    loop {
        ticker.tick().await;
        let result = monotonic_ns()
            .and_then(|now| sampler.sample(now))
            .and_then(|sample| maps.write(&sample));
        match result {
            Ok(()) => failing = false,
            Err(e) if !failing => {
                warn!("Host counter refresh failed: {:#}", e);
                failing = true;
            }
            Err(_) => {}
        }
    }
}

/// Whether the procfs files a category needs are readable.
pub fn check_readable(proc_root: &Path, categories: &[MetricCategory]) -> Result<()> {
    HostSampler::new(proc_root, categories).sample(1).map(|_| ())
}
