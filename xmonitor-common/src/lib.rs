//! Shared types and the packet pipeline of the x-monitor responder.
//!
//! This crate is `no_std` compatible for use in eBPF programs. Everything the
//! XDP program decides is decided here, against the `PacketBuf` and
//! `MetricSource` traits, so the same code runs under unit tests on the host.

#![cfg_attr(not(test), no_std)]

pub mod buffer;
pub mod collector;
pub mod composer;
pub mod headers;
pub mod metrics;
pub mod registry;
pub mod responder;

pub use buffer::{OutOfBounds, PacketBuf};
pub use collector::{AcquireError, Collector, FailurePolicy, MetricSource};
pub use composer::{BlockReader, Composer, Overflow};
pub use metrics::{
    AppMetrics, CpuMetrics, DiskMetrics, HostMetrics, Ipv4Metrics, MemoryMetrics, MetricCategory,
    TransportMetrics, APP_METRICS_MAX_LEN,
};
pub use registry::{Registry, RegistryEntry, Strategy, MAX_REGISTRY_ENTRIES};
pub use responder::{respond, Outcome, Reason, Verdict};

/// UDP port probes are sent to.
pub const PROBE_PORT: u16 = 22222;
/// UDP port replies are sent to on the prober.
pub const REPLY_PORT: u16 = 22222;

/// Configuration passed to eBPF program
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponderConfig {
    pub probe_port: u16,
    pub reply_port: u16,
    /// `FailurePolicy` for direct entries.
    pub direct_policy: u8,
    /// `FailurePolicy` for indirect entries.
    pub indirect_policy: u8,
    pub _pad: [u8; 2],
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            probe_port: PROBE_PORT,
            reply_port: REPLY_PORT,
            direct_policy: FailurePolicy::Abort as u8,
            indirect_policy: FailurePolicy::Truncate as u8,
            _pad: [0; 2],
        }
    }
}

impl ResponderConfig {
    // An unknown policy byte is treated as the stricter one.
    pub fn direct_policy(&self) -> FailurePolicy {
        FailurePolicy::from_u8(self.direct_policy).unwrap_or(FailurePolicy::Abort)
    }

    pub fn indirect_policy(&self) -> FailurePolicy {
        FailurePolicy::from_u8(self.indirect_policy).unwrap_or(FailurePolicy::Abort)
    }
}

/// Statistics counters
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponderStats {
    /// Frames seen by the program
    pub frames: u64,
    /// Frames addressed to the probe port
    pub probes: u64,
    pub transmitted: u64,
    pub dropped: u64,
    pub aborted: u64,
    pub passed: u64,
    /// Probes passed because the registry did not fit the frame
    pub overflows: u64,
    /// Metric blocks written into replies
    pub blocks: u64,
    pub payload_bytes: u64,
    /// Failed acquisitions, under either policy
    pub acquire_failures: u64,
    /// Replies sent with fewer blocks than the registry holds
    pub truncated: u64,
    /// Time spent on probes, in nanoseconds
    pub elapsed_ns: u64,
}

impl ResponderStats {
    pub fn record(&mut self, outcome: &Outcome, elapsed_ns: u64) {
        self.frames += 1;
        if outcome.reason == Reason::NotProbe {
            return;
        }
        self.probes += 1;
        self.elapsed_ns += elapsed_ns;

        match outcome.verdict {
            Verdict::Transmit => self.transmitted += 1,
            Verdict::Drop => self.dropped += 1,
            Verdict::Abort => self.aborted += 1,
            Verdict::Pass => self.passed += 1,
        }
        match outcome.reason {
            Reason::Acquire(_) => self.acquire_failures += 1,
            Reason::Truncated(_) => {
                self.acquire_failures += 1;
                self.truncated += 1;
            }
            Reason::Overflow(_) => self.overflows += 1,
            _ => {}
        }
        self.blocks += outcome.blocks as u64;
        self.payload_bytes += outcome.payload_len as u64;
    }

    /// Fold another CPU's counters into these.
    pub fn merge(&mut self, other: &ResponderStats) {
        self.frames += other.frames;
        self.probes += other.probes;
        self.transmitted += other.transmitted;
        self.dropped += other.dropped;
        self.aborted += other.aborted;
        self.passed += other.passed;
        self.overflows += other.overflows;
        self.blocks += other.blocks;
        self.payload_bytes += other.payload_bytes;
        self.acquire_failures += other.acquire_failures;
        self.truncated += other.truncated;
        self.elapsed_ns += other.elapsed_ns;
    }

    /// Mean time per probe in nanoseconds.
    pub fn mean_probe_ns(&self) -> u64 {
        self.elapsed_ns.checked_div(self.probes).unwrap_or(0)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ResponderConfig {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ResponderStats {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RegistryEntry {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Registry {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AppMetrics {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for CpuMetrics {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for DiskMetrics {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for MemoryMetrics {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Ipv4Metrics {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TransportMetrics {}
