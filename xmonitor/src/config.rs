//! Command-line configuration and registry building.

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::str::FromStr;
use xmonitor_common::{
    FailurePolicy, MetricCategory, Registry, RegistryEntry, ResponderConfig, APP_METRICS_MAX_LEN,
    PROBE_PORT, REPLY_PORT,
};

use crate::exporter::{MEMCACHED_FIELDS, REDIS_FIELDS};

/// Where `cargo build --release` leaves the XDP object.
pub const DEFAULT_OBJECT: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../xmonitor-ebpf/target/bpfel-unknown-none/release/xmonitor-ebpf"
);

/// Probe size used by the probe client, and so the reply capacity.
pub const DEFAULT_PROBE_SIZE: usize = 6570;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Interface to attach to (e.g., eth0)
    #[arg(short = 'i', long, env = "XMONITOR_IFACE")]
    pub iface: String,

    /// Attach in generic (SKB) mode instead of driver mode
    #[arg(long)]
    pub skb_mode: bool,

    /// Compiled XDP object to load
    #[arg(long, env = "XMONITOR_OBJECT", default_value = DEFAULT_OBJECT)]
    pub object: PathBuf,

    /// Directory under bpffs where the application metric map is pinned
    #[arg(long, env = "XMONITOR_PIN_PATH", default_value = "/sys/fs/bpf/xmonitor")]
    pub pin_path: PathBuf,

    #[command(flatten)]
    pub registry: RegistryArgs,

    /// UDP port probes arrive on
    #[arg(long, env = "XMONITOR_PROBE_PORT", default_value_t = PROBE_PORT)]
    pub probe_port: u16,

    /// UDP port replies are sent to
    #[arg(long, env = "XMONITOR_REPLY_PORT", default_value_t = REPLY_PORT)]
    pub reply_port: u16,

    /// What a failed host counter read does to the probe
    #[arg(long, value_enum, default_value_t = Policy::Abort)]
    pub direct_policy: Policy,

    /// What an unreachable application instance does to the probe
    #[arg(long, value_enum, default_value_t = Policy::Truncate)]
    pub indirect_policy: Policy,

    /// Probe size the clients send; used to warn about registries that cannot fit
    #[arg(long, default_value_t = DEFAULT_PROBE_SIZE)]
    pub probe_size: usize,

    /// Host counter refresh period in milliseconds
    #[arg(long, default_value = "100")]
    pub refresh_ms: u64,

    /// Application metric export period in milliseconds
    #[arg(long, default_value = "1000")]
    pub export_ms: u64,

    /// Address the memcached/redis instances listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub instance_addr: std::net::IpAddr,

    /// Procfs mount to read host counters from
    #[arg(long, default_value = "/proc")]
    pub proc_root: PathBuf,

    /// Seconds between statistics reports (0: only at shutdown)
    #[arg(long, default_value = "10")]
    pub stats_interval: u64,
}

impl RunArgs {
    pub fn responder_config(&self) -> ResponderConfig {
        ResponderConfig {
            probe_port: self.probe_port,
            reply_port: self.reply_port,
            direct_policy: FailurePolicy::from(self.direct_policy) as u8,
            indirect_policy: FailurePolicy::from(self.indirect_policy) as u8,
            ..Default::default()
        }
    }
}

/// Metric sources, in the order their blocks appear in a reply.
#[derive(Debug, Default, Args)]
pub struct RegistryArgs {
    /// Host counter categories (cpu, disk, memory, ipv4, transport)
    #[arg(long, value_delimiter = ',', value_parser = parse_category)]
    pub host: Vec<MetricCategory>,

    /// Application instance: memcached:PORT[:LEN], redis:PORT[:LEN] or raw:PORT:LEN
    #[arg(long = "instance", value_parser = InstanceSpec::from_str)]
    pub instances: Vec<InstanceSpec>,

    /// Predefined registry
    #[arg(long, value_enum, conflicts_with_all = ["host", "instances"])]
    pub preset: Option<Preset>,
}

impl RegistryArgs {
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.instances.is_empty() && self.preset.is_none()
    }

    /// Host categories, then instances, each in command-line order.
    pub fn sources(&self) -> (Vec<MetricCategory>, Vec<InstanceSpec>) {
        match self.preset {
            Some(preset) => preset.sources(),
            None => (self.host.clone(), self.instances.clone()),
        }
    }

    pub fn build(&self) -> Result<Registry> {
        let (host, instances) = self.sources();
        build_registry(&host, &instances)
    }
}

pub fn build_registry(host: &[MetricCategory], instances: &[InstanceSpec]) -> Result<Registry> {
    let mut registry = Registry::new();
    let entries = host
        .iter()
        .map(|c| RegistryEntry::direct(*c))
        .chain(instances.iter().map(InstanceSpec::entry));
    for entry in entries {
        // An instance port is one export slot, whatever length it is given.
        let taken = registry
            .entries()
            .iter()
            .any(|e| e.strategy == entry.strategy && e.id == entry.id);
        if taken {
            bail!("Duplicate metric source: {:?}", entry);
        }
        registry
            .push(entry)
            .map_err(|_| anyhow::anyhow!("Too many metric sources"))
            .context("Registry holds at most 100 entries")?;
    }
    Ok(registry)
}

fn parse_category(s: &str) -> Result<MetricCategory, String> {
    s.parse()
        .map_err(|_| format!("unknown host category: {s} (cpu, disk, memory, ipv4, transport)"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    /// Abort the probe; nothing is sent back
    Abort,
    /// Send back the blocks collected so far
    Truncate,
}

impl From<Policy> for FailurePolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Abort => FailurePolicy::Abort,
            Policy::Truncate => FailurePolicy::Truncate,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Ten memcached instances on 11211-11220
    Memcached,
    /// Twelve redis instances on 6379-6390
    Redis,
    /// Every host counter category
    Kernel,
    /// CPU counters only
    Cpu,
}

impl Preset {
    pub fn sources(self) -> (Vec<MetricCategory>, Vec<InstanceSpec>) {
        match self {
            Preset::Memcached => (
                Vec::new(),
                (11211..=11220).map(|p| InstanceSpec::new(AppKind::Memcached, p)).collect(),
            ),
            Preset::Redis => (
                Vec::new(),
                (6379..=6390).map(|p| InstanceSpec::new(AppKind::Redis, p)).collect(),
            ),
            Preset::Kernel => (MetricCategory::ALL.to_vec(), Vec::new()),
            Preset::Cpu => (vec![MetricCategory::Cpu], Vec::new()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppKind {
    Memcached,
    Redis,
    /// Writes its own slot into the pinned map.
    Raw,
}

impl AppKind {
    /// Block length when none is given: one u64 per exported field.
    pub fn default_block_len(self) -> Option<u32> {
        match self {
            AppKind::Memcached => Some((MEMCACHED_FIELDS.len() * 8) as u32),
            AppKind::Redis => Some((REDIS_FIELDS.len() * 8) as u32),
            AppKind::Raw => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceSpec {
    pub kind: AppKind,
    pub port: u16,
    pub block_len: u32,
}

impl InstanceSpec {
    pub fn new(kind: AppKind, port: u16) -> Self {
        Self {
            kind,
            port,
            block_len: kind.default_block_len().unwrap_or(0),
        }
    }

    pub fn entry(&self) -> RegistryEntry {
        RegistryEntry::indirect(self.port, self.block_len)
    }
}

impl FromStr for InstanceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let kind = match parts.next() {
            Some("memcached") => AppKind::Memcached,
            Some("redis") => AppKind::Redis,
            Some("raw") => AppKind::Raw,
            _ => return Err(format!("unknown instance kind in {s:?} (memcached, redis, raw)")),
        };
        let port: u16 = parts
            .next()
            .ok_or_else(|| format!("missing port in {s:?}"))?
            .parse()
            .map_err(|e| format!("invalid port in {s:?}: {e}"))?;
        let block_len = match parts.next() {
            Some(len) => len
                .parse::<u32>()
                .map_err(|e| format!("invalid block length in {s:?}: {e}"))?,
            None => kind
                .default_block_len()
                .ok_or_else(|| format!("raw instance {s:?} needs a block length"))?,
        };
        if parts.next().is_some() {
            return Err(format!("too many fields in {s:?}"));
        }
        if block_len == 0 || block_len as usize > APP_METRICS_MAX_LEN {
            return Err(format!(
                "block length {block_len} out of range (1..={APP_METRICS_MAX_LEN})"
            ));
        }
        Ok(Self {
            kind,
            port,
            block_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        registry: RegistryArgs,
    }

    fn parse(args: &[&str]) -> RegistryArgs {
        TestCli::try_parse_from(std::iter::once("xmonitor").chain(args.iter().copied()))
            .unwrap()
            .registry
    }

    #[test]
    fn parses_instance_specs() {
        assert_eq!(
            "memcached:11211".parse::<InstanceSpec>().unwrap(),
            InstanceSpec {
                kind: AppKind::Memcached,
                port: 11211,
                block_len: 64
            }
        );
        assert_eq!(
            "redis:6379:740".parse::<InstanceSpec>().unwrap().block_len,
            740
        );
        assert_eq!("raw:9000:16".parse::<InstanceSpec>().unwrap().kind, AppKind::Raw);

        assert!("raw:9000".parse::<InstanceSpec>().is_err());
        assert!("mysql:3306".parse::<InstanceSpec>().is_err());
        assert!("redis:70000".parse::<InstanceSpec>().is_err());
        assert!("redis:6379:0".parse::<InstanceSpec>().is_err());
        assert!("redis:6379:2048".parse::<InstanceSpec>().is_err());
        assert!("redis:6379:8:9".parse::<InstanceSpec>().is_err());
    }

    #[test]
    fn registry_keeps_command_line_order() {
        let args = parse(&[
            "--host",
            "memory,cpu",
            "--instance",
            "memcached:11211",
            "--instance",
            "memcached:11212",
        ]);
        let registry = args.build().unwrap();

        let ids: Vec<u16> = registry.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, [2, 0, 11211, 11212]);
        assert_eq!(registry.payload_len(), 96 + 88 + 64 + 64);
    }

    #[test]
    fn presets_expand_to_fixed_registries() {
        let memcached = parse(&["--preset", "memcached"]).build().unwrap();
        assert_eq!(memcached.len(), 10);
        assert_eq!(memcached.entries()[0].port(), Some(11211));
        assert_eq!(memcached.entries()[9].port(), Some(11220));

        let redis = parse(&["--preset", "redis"]).build().unwrap();
        assert_eq!(redis.len(), 12);

        let kernel = parse(&["--preset", "kernel"]).build().unwrap();
        assert_eq!(kernel.payload_len(), 88 + 96 + 96 + 88 + 136);
    }

    #[test]
    fn preset_conflicts_with_explicit_sources() {
        let cli = TestCli::try_parse_from(["xmonitor", "--preset", "cpu", "--host", "disk"]);
        assert!(cli.is_err());
    }

    #[test]
    fn duplicates_are_rejected() {
        let args = parse(&["--host", "cpu,cpu"]);
        assert!(args.build().is_err());
    }

    #[test]
    fn one_port_cannot_take_two_block_lengths() {
        let args = parse(&["--instance", "memcached:11211", "--instance", "memcached:11211:72"]);
        assert!(args.build().is_err());

        let args = parse(&["--instance", "memcached:11211", "--instance", "raw:11211:64"]);
        assert!(args.build().is_err());

        let args = parse(&["--instance", "memcached:11211", "--instance", "memcached:11212:72"]);
        assert_eq!(args.build().unwrap().len(), 2);
    }

    #[test]
    fn unknown_category_is_a_parse_error() {
        assert!(TestCli::try_parse_from(["xmonitor", "--host", "gpu"]).is_err());
    }

    #[test]
    fn policies_map_onto_the_config() {
        let policy: FailurePolicy = Policy::Truncate.into();
        assert_eq!(policy, FailurePolicy::Truncate);
        assert_eq!(FailurePolicy::from(Policy::Abort) as u8, 0);
    }
}
