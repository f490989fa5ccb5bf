//! Loads the responder, pushes its configuration and keeps its metric maps
//! fresh until Ctrl+C.

use anyhow::{Context, Result};
use aya::{
    maps::{Array, HashMap, MapData, PerCpuArray},
    programs::{Xdp, XdpFlags},
    Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use log::{info, warn};
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use std::time::Duration;
use tokio::signal;
use xmonitor_common::{AppMetrics, Registry, ResponderConfig, ResponderStats};

use crate::config::RunArgs;
use crate::exporter::{self, Exporter};
use crate::host::{self, HostMaps, HostSampler};
use crate::stats;

/// How long a single instance poll may take before it counts as unreachable.
const EXPORT_TIMEOUT: Duration = Duration::from_millis(500);

pub async fn run(args: RunArgs) -> Result<()> {
    let registry = args.registry.build()?;
    let (categories, instances) = args.registry.sources();
    let config = args.responder_config();

    info!("Starting x-monitor responder");
    info!("  Interface: {}", args.iface);
    info!("  Probe port: {}, reply port: {}", config.probe_port, config.reply_port);
    info!(
        "  Registry: {} sources, {} payload bytes",
        registry.len(),
        registry.payload_len()
    );
    info!(
        "  Failure policy: direct={:?} indirect={:?}",
        config.direct_policy(),
        config.indirect_policy()
    );
    if registry.is_empty() {
        warn!("Registry is empty; replies will carry headers only");
    }
    if registry.payload_len() > args.probe_size {
        warn!(
            "Registry needs {} payload bytes but probes carry {}; such probes will be passed",
            registry.payload_len(),
            args.probe_size
        );
    }
    if !categories.is_empty() {
        host::check_readable(&args.proc_root, &categories)?;
    }

    check_privileges();
    let ifindex = get_ifindex(&args.iface)?;

    let mut bpf = load_program(&args)?;

    // Set up logging
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("Failed to initialize eBPF logger: {}", e);
    }

    // Write config and registry before the program sees any traffic
    let mut config_map: Array<_, ResponderConfig> =
        Array::try_from(bpf.map_mut("CONFIG").context("CONFIG map not found")?)?;
    config_map.set(0, config, 0)?;

    let mut registry_map: Array<_, Registry> =
        Array::try_from(bpf.map_mut("REGISTRY").context("REGISTRY map not found")?)?;
    registry_map.set(0, registry, 0)?;

    // Host counters are sampled once before attach so direct entries never
    // see an empty slot.
    let sampler = HostSampler::new(&args.proc_root, &categories);
    let mut host_maps = HostMaps::take(&mut bpf)?;
    host_maps.write(&sampler.sample(host::monotonic_ns()?)?)?;

    let app_map: HashMap<MapData, u16, AppMetrics> = HashMap::try_from(
        bpf.take_map("APP_METRICS")
            .context("APP_METRICS map not found")?,
    )?;
    let mut exporter = Exporter::new(app_map, args.instance_addr, EXPORT_TIMEOUT, &instances);
    if !exporter.is_empty() {
        let failed = exporter.export_once().await;
        if failed > 0 {
            warn!("{} application slots could not be written", failed);
        }
    }

    let stats_map: PerCpuArray<MapData, ResponderStats> =
        PerCpuArray::try_from(bpf.take_map("STATS").context("STATS map not found")?)?;

    // Attach XDP program
    let program: &mut Xdp = bpf
        .program_mut("xmonitor")
        .context("xmonitor program not found")?
        .try_into()?;
    program.load()?;

    let flags = if args.skb_mode {
        XdpFlags::SKB_MODE
    } else {
        XdpFlags::default()
    };
    program
        .attach(&args.iface, flags)
        .with_context(|| format!("Failed to attach to {} (ifindex {})", args.iface, ifindex))?;
    info!(
        "Attached XDP to {} in {} mode",
        args.iface,
        if args.skb_mode { "SKB" } else { "driver" }
    );

    let refresher = (!categories.is_empty()).then(|| {
        tokio::spawn(host::refresh(
            sampler,
            host_maps,
            Duration::from_millis(args.refresh_ms.max(1)),
        ))
    });
    let export = (!exporter.is_empty()).then(|| {
        tokio::spawn(exporter::run(
            exporter,
            Duration::from_millis(args.export_ms.max(1)),
        ))
    });

    info!("x-monitor running. Press Ctrl+C to exit.");

    // Wait for shutdown signal
    if args.stats_interval > 0 {
        tokio::select! {
            res = signal::ctrl_c() => res?,
            _ = stats::report(&stats_map, Duration::from_secs(args.stats_interval)) => {}
        }
    } else {
        signal::ctrl_c().await?;
    }

    info!("Shutting down...");
    for task in [refresher, export].into_iter().flatten() {
        task.abort();
    }
    stats::log(&stats_map);
    Ok(())
}

fn load_program(args: &RunArgs) -> Result<Ebpf> {
    let mut loader = EbpfLoader::new();
    std::fs::create_dir_all(&args.pin_path)
        .with_context(|| format!("Failed to create pin path {}", args.pin_path.display()))?;
    loader.map_pin_path(&args.pin_path);

    #[cfg(feature = "embed-ebpf")]
    {
        let _ = &args.object;
        #[cfg(debug_assertions)]
        let bytes = aya::include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../xmonitor-ebpf/target/bpfel-unknown-none/debug/xmonitor-ebpf"
        ));
        #[cfg(not(debug_assertions))]
        let bytes = aya::include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../xmonitor-ebpf/target/bpfel-unknown-none/release/xmonitor-ebpf"
        ));
        info!("Loading embedded XDP object");
        loader.load(bytes).context("Failed to load embedded XDP object")
    }

    #[cfg(not(feature = "embed-ebpf"))]
    {
        info!("Loading XDP object from {}", args.object.display());
        loader.load_file(&args.object).with_context(|| {
            format!(
                "Failed to load {} (build xmonitor-ebpf first)",
                args.object.display()
            )
        })
    }
}

/// Warn early when the process is unlikely to be allowed to load programs,
/// and lift the locked memory limit for kernels that still charge it.
fn check_privileges() {
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; loading the XDP program will likely fail");
    }
    if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        warn!("Failed to remove limit on locked memory: {}", e);
    }
}

/// Get interface index by name
fn get_ifindex(name: &str) -> Result<u32> {
    let index = nix::net::if_::if_nametoindex(name)
        .with_context(|| format!("Failed to get index for interface: {}", name))?;
    Ok(index)
}
