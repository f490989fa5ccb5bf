//! x-monitor XDP eBPF Program
//!
//! Answers UDP probes on the receive path. A probe's own buffer is turned
//! into the reply: addressing is swapped and metric blocks are appended
//! after the UDP header, then the frame is sent back out with XDP_TX.
//!
//! The decisions live in `xmonitor_common::respond`; this program only
//! adapts the frame and the BPF maps to it.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    cty::c_void,
    helpers::{bpf_ktime_get_ns, bpf_xdp_get_buff_len, bpf_xdp_load_bytes, bpf_xdp_store_bytes},
    macros::{map, xdp},
    maps::{Array, HashMap, PerCpuArray},
    programs::XdpContext,
};
use aya_log_ebpf::{debug, error, warn};
use core::mem;
use network_types::{
    eth::{EthHdr, EtherType},
    ip::Ipv4Hdr,
    udp::UdpHdr,
};
use xmonitor_common::{
    headers::{ETH_HDR_LEN, IPV4_MIN_HDR_LEN, UDP_HDR_LEN},
    respond, AcquireError, AppMetrics, CpuMetrics, DiskMetrics, HostMetrics, Ipv4Metrics,
    MemoryMetrics, MetricCategory, MetricSource, OutOfBounds, Outcome, PacketBuf, Reason,
    Registry, ResponderConfig, ResponderStats, TransportMetrics, MAX_REGISTRY_ENTRIES,
};

// The common pipeline uses its own header lengths; they must agree with the
// kernel's view of the headers.
const _: () = assert!(EthHdr::LEN == ETH_HDR_LEN);
const _: () = assert!(Ipv4Hdr::LEN == IPV4_MIN_HDR_LEN);
const _: () = assert!(UdpHdr::LEN == UDP_HDR_LEN);

// ============================================================================
// BPF Maps
// ============================================================================

/// Responder configuration (single entry)
#[map]
static CONFIG: Array<ResponderConfig> = Array::with_max_entries(1, 0);

/// Metric source registry (single entry), written once before attach
#[map]
static REGISTRY: Array<Registry> = Array::with_max_entries(1, 0);

/// Host counters for the direct strategy, one single-slot map per category,
/// refreshed from userspace.
#[map]
static HOST_CPU: Array<CpuMetrics> = Array::with_max_entries(1, 0);

#[map]
static HOST_DISK: Array<DiskMetrics> = Array::with_max_entries(1, 0);

#[map]
static HOST_MEMORY: Array<MemoryMetrics> = Array::with_max_entries(1, 0);

#[map]
static HOST_IPV4: Array<Ipv4Metrics> = Array::with_max_entries(1, 0);

#[map]
static HOST_TRANSPORT: Array<TransportMetrics> = Array::with_max_entries(1, 0);

/// Application metric export slots keyed by instance port. Pinned so the
/// instances themselves can write into it.
#[map]
static APP_METRICS: HashMap<u16, AppMetrics> =
    HashMap::pinned(MAX_REGISTRY_ENTRIES as u32, 0);

/// Statistics (per-CPU)
#[map]
static STATS: PerCpuArray<ResponderStats> = PerCpuArray::with_max_entries(1, 0);

// ============================================================================
// Entry Point
// ============================================================================

#[xdp(frags)]
pub fn xmonitor(ctx: XdpContext) -> u32 {
    match try_xmonitor(ctx) {
        Ok(ret) => ret,
        Err(_) => xdp_action::XDP_PASS, // On error, let kernel handle it
    }
}

#[inline(always)]
fn try_xmonitor(ctx: XdpContext) -> Result<u32, ()> {
    // Only IPv4 can carry a probe; skip everything else before copying
    // any header out of the frame.
    let ethhdr: *const EthHdr = ptr_at(&ctx, 0)?;
    if unsafe { (*ethhdr).ether_type } != EtherType::Ipv4 {
        update_stats(|s| s.frames += 1);
        return Ok(xdp_action::XDP_PASS);
    }

    let config = CONFIG.get(0).ok_or(())?;
    let registry = REGISTRY.get(0).ok_or(())?;

    let start = unsafe { bpf_ktime_get_ns() };
    let mut frame = XdpFrame::new(&ctx);
    let outcome = respond(&mut frame, config, registry, &MapSource);
    let elapsed = unsafe { bpf_ktime_get_ns() }.saturating_sub(start);

    log_outcome(&ctx, &outcome);
    update_stats(|s| s.record(&outcome, elapsed));

    Ok(outcome.verdict.xdp_action())
}

#[inline(always)]
fn log_outcome(ctx: &XdpContext, outcome: &Outcome) {
    match outcome.reason {
        Reason::Complete | Reason::NotProbe => {}
        Reason::Malformed(_) => debug!(ctx, "dropping malformed probe"),
        Reason::Acquire(failure) => error!(
            ctx,
            "metric source {} failed (error {}), probe aborted",
            failure.entry.id,
            failure.error.code()
        ),
        Reason::Truncated(failure) => warn!(
            ctx,
            "metric source {} failed (error {}), replying with {} blocks",
            failure.entry.id,
            failure.error.code(),
            outcome.blocks
        ),
        Reason::Overflow(overflow) => warn!(
            ctx,
            "registry needs {} more bytes than the probe carries",
            (overflow.cursor + overflow.block_len).saturating_sub(overflow.end)
        ),
        Reason::Store(err) => error!(
            ctx,
            "frame store failed at offset {}, probe aborted",
            err.offset
        ),
    }
}

// ============================================================================
// Frame and metric adapters
// ============================================================================

/// The frame behind `bpf_xdp_load_bytes` / `bpf_xdp_store_bytes`, which
/// also reach into the fragments of a multi-buffer frame.
struct XdpFrame<'a> {
    ctx: &'a XdpContext,
    len: usize,
}

impl<'a> XdpFrame<'a> {
    #[inline(always)]
    fn new(ctx: &'a XdpContext) -> Self {
        let len = unsafe { bpf_xdp_get_buff_len(ctx.ctx) } as usize;
        Self { ctx, len }
    }
}

impl PacketBuf for XdpFrame<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    fn load(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        let ret = unsafe {
            bpf_xdp_load_bytes(
                self.ctx.ctx,
                offset as u32,
                dst.as_mut_ptr() as *mut c_void,
                dst.len() as u32,
            )
        };
        if ret < 0 {
            return Err(OutOfBounds {
                offset,
                len: dst.len(),
            });
        }
        Ok(())
    }

    #[inline(always)]
    fn store(&mut self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        let ret = unsafe {
            bpf_xdp_store_bytes(
                self.ctx.ctx,
                offset as u32,
                src.as_ptr() as *mut c_void,
                src.len() as u32,
            )
        };
        if ret < 0 {
            return Err(OutOfBounds {
                offset,
                len: src.len(),
            });
        }
        Ok(())
    }
}

/// Metric blocks read straight out of the maps.
struct MapSource;

impl MetricSource for MapSource {
    #[inline(always)]
    fn direct(&self, category: MetricCategory) -> Result<&[u8], AcquireError> {
        match category {
            MetricCategory::Cpu => host_block(&HOST_CPU),
            MetricCategory::Disk => host_block(&HOST_DISK),
            MetricCategory::Memory => host_block(&HOST_MEMORY),
            MetricCategory::Ipv4 => host_block(&HOST_IPV4),
            MetricCategory::Transport => host_block(&HOST_TRANSPORT),
        }
    }

    #[inline(always)]
    fn indirect(&self, port: u16) -> Result<&[u8], AcquireError> {
        let slot = unsafe { APP_METRICS.get(&port) }.ok_or(AcquireError::Unreachable)?;
        slot.block()
    }
}

#[inline(always)]
fn host_block<T: HostMetrics>(map: &'static Array<T>) -> Result<&'static [u8], AcquireError> {
    map.get(0).ok_or(AcquireError::ReadFault)?.block()
}

// ============================================================================
// Helpers
// ============================================================================

/// Update per-CPU statistics
#[inline(always)]
fn update_stats<F: FnOnce(&mut ResponderStats)>(f: F) {
    if let Some(stats) = STATS.get_ptr_mut(0) {
        f(unsafe { &mut *stats });
    }
}

/// Get pointer at offset (const)
#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return Err(());
    }

    Ok((start + offset) as *const T)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
