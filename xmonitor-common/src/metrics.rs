//! Metric block layouts.
//!
//! Every block is a fixed-size `repr(C)` struct of `u64` counters, so its
//! byte image is exactly what lands on the wire (little endian, the byte
//! order of every host this runs on).

use crate::collector::AcquireError;

/// Largest application metric block the export map can hold.
pub const APP_METRICS_MAX_LEN: usize = 1024;

/// Host-level metric category read by the direct strategy.
///
/// The discriminant is the tag stored in registry entries.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricCategory {
    Cpu = 0,
    Disk = 1,
    Memory = 2,
    Ipv4 = 3,
    Transport = 4,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 5] = [
        MetricCategory::Cpu,
        MetricCategory::Disk,
        MetricCategory::Memory,
        MetricCategory::Ipv4,
        MetricCategory::Transport,
    ];

    pub const fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(MetricCategory::Cpu),
            1 => Some(MetricCategory::Disk),
            2 => Some(MetricCategory::Memory),
            3 => Some(MetricCategory::Ipv4),
            4 => Some(MetricCategory::Transport),
            _ => None,
        }
    }

    pub const fn tag(self) -> u16 {
        self as u16
    }

    /// Size of this category's block on the wire.
    pub const fn block_len(self) -> usize {
        match self {
            MetricCategory::Cpu => core::mem::size_of::<CpuMetrics>(),
            MetricCategory::Disk => core::mem::size_of::<DiskMetrics>(),
            MetricCategory::Memory => core::mem::size_of::<MemoryMetrics>(),
            MetricCategory::Ipv4 => core::mem::size_of::<Ipv4Metrics>(),
            MetricCategory::Transport => core::mem::size_of::<TransportMetrics>(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MetricCategory::Cpu => "cpu",
            MetricCategory::Disk => "disk",
            MetricCategory::Memory => "memory",
            MetricCategory::Ipv4 => "ipv4",
            MetricCategory::Transport => "transport",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownCategory;

impl core::str::FromStr for MetricCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricCategory::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or(UnknownCategory)
    }
}

/// A host counter snapshot that can be sent as a metric block.
///
/// # Safety
///
/// Implementors must be `repr(C)`, made only of `u64` fields and therefore
/// free of padding, so that every byte of the value is initialized.
pub unsafe trait HostMetrics: Copy + 'static {
    /// CLOCK_MONOTONIC time of the sample; zero until the first refresh.
    fn sampled_at_ns(&self) -> u64;

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed padding-free by the trait contract.
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, core::mem::size_of::<Self>())
        }
    }

    /// The block to send, or `ReadFault` if the slot was never written.
    fn block(&self) -> Result<&[u8], AcquireError> {
        if self.sampled_at_ns() == 0 {
            return Err(AcquireError::ReadFault);
        }
        Ok(self.as_bytes())
    }
}

/// Aggregate CPU time from the `cpu` line of `/proc/stat`, in clock ticks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuMetrics {
    pub sampled_at_ns: u64,
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

/// Block device counters summed over whole disks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskMetrics {
    pub sampled_at_ns: u64,
    pub reads: u64,
    pub reads_merged: u64,
    pub sectors_read: u64,
    pub read_ms: u64,
    pub writes: u64,
    pub writes_merged: u64,
    pub sectors_written: u64,
    pub write_ms: u64,
    pub in_flight: u64,
    pub io_ms: u64,
    pub weighted_io_ms: u64,
}

/// Memory counters in kB.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub sampled_at_ns: u64,
    pub total: u64,
    pub free: u64,
    pub available: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub dirty: u64,
    pub writeback: u64,
    pub shmem: u64,
    pub slab: u64,
}

/// IP MIB counters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ipv4Metrics {
    pub sampled_at_ns: u64,
    pub in_receives: u64,
    pub in_hdr_errors: u64,
    pub in_addr_errors: u64,
    pub forw_datagrams: u64,
    pub in_unknown_protos: u64,
    pub in_discards: u64,
    pub in_delivers: u64,
    pub out_requests: u64,
    pub out_discards: u64,
    pub out_no_routes: u64,
}

/// TCP and UDP MIB counters.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    pub sampled_at_ns: u64,
    pub tcp_active_opens: u64,
    pub tcp_passive_opens: u64,
    pub tcp_attempt_fails: u64,
    pub tcp_estab_resets: u64,
    pub tcp_curr_estab: u64,
    pub tcp_in_segs: u64,
    pub tcp_out_segs: u64,
    pub tcp_retrans_segs: u64,
    pub tcp_in_errs: u64,
    pub tcp_out_rsts: u64,
    pub udp_in_datagrams: u64,
    pub udp_no_ports: u64,
    pub udp_in_errors: u64,
    pub udp_out_datagrams: u64,
    pub udp_rcvbuf_errors: u64,
    pub udp_sndbuf_errors: u64,
}

// SAFETY: all five are repr(C) structs of u64 only.
unsafe impl HostMetrics for CpuMetrics {
    fn sampled_at_ns(&self) -> u64 {
        self.sampled_at_ns
    }
}

unsafe impl HostMetrics for DiskMetrics {
    fn sampled_at_ns(&self) -> u64 {
        self.sampled_at_ns
    }
}

unsafe impl HostMetrics for MemoryMetrics {
    fn sampled_at_ns(&self) -> u64 {
        self.sampled_at_ns
    }
}

unsafe impl HostMetrics for Ipv4Metrics {
    fn sampled_at_ns(&self) -> u64 {
        self.sampled_at_ns
    }
}

unsafe impl HostMetrics for TransportMetrics {
    fn sampled_at_ns(&self) -> u64 {
        self.sampled_at_ns
    }
}

/// Export slot for one monitored application instance, keyed by its port.
///
/// Written by the instance itself or by the loader's exporter; the responder
/// copies `data[..len]` verbatim.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppMetrics {
    pub len: u32,
    /// Bumped by the writer on every update.
    pub generation: u32,
    pub data: [u8; APP_METRICS_MAX_LEN],
}

impl AppMetrics {
    pub const fn zeroed() -> Self {
        Self {
            len: 0,
            generation: 0,
            data: [0; APP_METRICS_MAX_LEN],
        }
    }

    /// Build a slot holding `bytes`, or `None` if they do not fit.
    pub fn from_bytes(bytes: &[u8], generation: u32) -> Option<Self> {
        if bytes.len() > APP_METRICS_MAX_LEN {
            return None;
        }
        let mut slot = Self::zeroed();
        slot.len = bytes.len() as u32;
        slot.generation = generation;
        slot.data[..bytes.len()].copy_from_slice(bytes);
        Some(slot)
    }

    pub fn block(&self) -> Result<&[u8], AcquireError> {
        let len = self.len as usize;
        if len > APP_METRICS_MAX_LEN {
            return Err(AcquireError::SizeMismatch {
                expected: APP_METRICS_MAX_LEN as u32,
                actual: self.len,
            });
        }
        Ok(&self.data[..len])
    }
}
