//! Application metric exporter.
//!
//! Polls memcached (`stats`) and redis (`INFO`) instances over TCP, packs a
//! fixed list of counters into each instance's block and publishes it in the
//! pinned `APP_METRICS` map, where the responder copies it from.

use anyhow::{bail, Context, Result};
use aya::maps::{HashMap, MapData, MapError};
use log::{debug, info, warn};
use std::collections::HashMap as StdHashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use xmonitor_common::AppMetrics;

use crate::config::{AppKind, InstanceSpec};

/// `stats` fields exported for memcached, in block order.
pub const MEMCACHED_FIELDS: [&str; 8] = [
    "uptime",
    "curr_connections",
    "total_connections",
    "cmd_get",
    "cmd_set",
    "get_hits",
    "get_misses",
    "bytes",
];

/// `INFO` fields exported for redis, in block order.
pub const REDIS_FIELDS: [&str; 12] = [
    "connected_clients",
    "blocked_clients",
    "used_memory",
    "used_memory_rss",
    "used_memory_peak",
    "total_connections_received",
    "total_commands_processed",
    "instantaneous_ops_per_sec",
    "total_net_input_bytes",
    "total_net_output_bytes",
    "keyspace_hits",
    "keyspace_misses",
];

/// Replies larger than this are treated as a protocol error.
const MAX_REPLY_LEN: usize = 1 << 20;

/// Where packed blocks are published.
pub trait ExportSink {
    fn publish(&mut self, port: u16, slot: AppMetrics) -> Result<()>;
    /// Remove the port's slot so the responder sees the instance as unreachable.
    fn withdraw(&mut self, port: u16) -> Result<()>;
}

impl ExportSink for HashMap<MapData, u16, AppMetrics> {
    fn publish(&mut self, port: u16, slot: AppMetrics) -> Result<()> {
        self.insert(port, slot, 0)
            .with_context(|| format!("Failed to publish metrics for port {}", port))
    }

    fn withdraw(&mut self, port: u16) -> Result<()> {
        match self.remove(&port) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to withdraw port {}", port)),
        }
    }
}

struct Tracked {
    spec: InstanceSpec,
    generation: u32,
    reachable: Option<bool>,
}

pub struct Exporter<S> {
    sink: S,
    addr: IpAddr,
    timeout: Duration,
    instances: Vec<Tracked>,
}

impl<S: ExportSink> Exporter<S> {
    /// Raw instances publish their own slots and are left alone.
    pub fn new(sink: S, addr: IpAddr, timeout: Duration, instances: &[InstanceSpec]) -> Self {
        let instances = instances
            .iter()
            .filter(|spec| spec.kind != AppKind::Raw)
            .map(|spec| Tracked {
                spec: *spec,
                generation: 0,
                reachable: None,
            })
            .collect();
        Self {
            sink,
            addr,
            timeout,
            instances,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Poll every instance once and publish or withdraw its slot.
    ///
    /// A slot that cannot be written is reported and the pass carries on, so
    /// one bad slot never leaves the others stale. Returns the number of
    /// slots that failed.
    pub async fn export_once(&mut self) -> usize {
        let mut failed = 0;
        for tracked in &mut self.instances {
            let spec = tracked.spec;
            let addr = SocketAddr::new(self.addr, spec.port);
            let written = match fetch_block(spec, addr, self.timeout).await {
                Ok(block) => {
                    tracked.generation = tracked.generation.wrapping_add(1);
                    let published = AppMetrics::from_bytes(&block, tracked.generation)
                        .context("Packed block larger than the export slot")
                        .and_then(|slot| self.sink.publish(spec.port, slot));
                    if tracked.reachable != Some(true) {
                        info!("Exporting {:?} metrics for port {}", spec.kind, spec.port);
                    }
                    tracked.reachable = Some(true);
                    published
                }
                Err(e) => {
                    if tracked.reachable != Some(false) {
                        warn!("Instance on port {} unreachable: {:#}", spec.port, e);
                    } else {
                        debug!("Instance on port {} still unreachable: {:#}", spec.port, e);
                    }
                    tracked.reachable = Some(false);
                    self.sink.withdraw(spec.port)
                }
            };
            if let Err(e) = written {
                warn!("Failed to update slot for port {}: {:#}", spec.port, e);
                failed += 1;
            }
        }
        failed
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

/// Run the exporter every `period` until the task is dropped.
pub async fn run<S: ExportSink>(mut exporter: Exporter<S>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        exporter.export_once().await;
    }
}

/// Fetch one instance's counters and pack them into its block.
pub async fn fetch_block(spec: InstanceSpec, addr: SocketAddr, timeout: Duration) -> Result<Vec<u8>> {
    tokio::time::timeout(timeout, poll_instance(spec, addr))
        .await
        .with_context(|| format!("Timed out polling {}", addr))?
}

async fn poll_instance(spec: InstanceSpec, addr: SocketAddr) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let block_len = spec.block_len as usize;
    match spec.kind {
        AppKind::Memcached => {
            let text = memcached_stats(&mut stream).await?;
            Ok(pack(&MEMCACHED_FIELDS, &parse_memcached(&text), block_len))
        }
        AppKind::Redis => {
            let text = redis_info(&mut stream).await?;
            Ok(pack(&REDIS_FIELDS, &parse_redis(&text), block_len))
        }
        AppKind::Raw => bail!("Raw instances are not polled"),
    }
}

/// Send `stats` and read up to the terminating `END`.
async fn memcached_stats(stream: &mut TcpStream) -> Result<String> {
    stream.write_all(b"stats\r\n").await?;

    let mut reply: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    while !reply.ends_with(b"END\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("Connection closed before END");
        }
        reply.extend_from_slice(&buf[..n]);
        if reply.len() > MAX_REPLY_LEN {
            bail!("stats reply too large");
        }
    }
    String::from_utf8(reply).context("stats reply is not UTF-8")
}

/// Send `INFO` and read the RESP bulk string reply.
async fn redis_info(stream: &mut TcpStream) -> Result<String> {
    stream.write_all(b"INFO\r\n").await?;

    let mut reply: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    let body_len = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("Connection closed before INFO header");
        }
        reply.extend_from_slice(&buf[..n]);
        if let Some(eol) = reply.windows(2).position(|w| w == b"\r\n") {
            let header = std::str::from_utf8(&reply[..eol]).context("Bad INFO header")?;
            let len: usize = match header.strip_prefix('$') {
                Some(len) => len.parse().context("Bad INFO length")?,
                None => bail!("Unexpected INFO reply: {}", header),
            };
            if len > MAX_REPLY_LEN {
                bail!("INFO reply too large");
            }
            reply.drain(..eol + 2);
            break len;
        }
        if reply.len() > MAX_REPLY_LEN {
            bail!("INFO header too large");
        }
    };

    while reply.len() < body_len {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("Connection closed inside INFO body");
        }
        reply.extend_from_slice(&buf[..n]);
    }
    reply.truncate(body_len);
    String::from_utf8(reply).context("INFO reply is not UTF-8")
}

/// `STAT name value` lines.
pub fn parse_memcached(text: &str) -> StdHashMap<&str, &str> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some("STAT"), Some(name), Some(value)) => Some((name, value)),
                _ => None,
            }
        })
        .collect()
}

/// `name:value` lines; section headers and blanks are skipped.
pub fn parse_redis(text: &str) -> StdHashMap<&str, &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .collect()
}

/// Little-endian u64 per field, zero when missing or not an integer, then
/// zero-padded or cut to `block_len`.
pub fn pack(fields: &[&str], values: &StdHashMap<&str, &str>, block_len: usize) -> Vec<u8> {
    let mut block: Vec<u8> = fields
        .iter()
        .map(|name| {
            values
                .get(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
        })
        .flat_map(u64::to_le_bytes)
        .collect();
    block.resize(block_len, 0);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    const MEMCACHED_REPLY: &str = "STAT pid 42\r\nSTAT uptime 100\r\nSTAT curr_connections 3\r\n\
        STAT cmd_get 7\r\nSTAT get_hits 5\r\nSTAT bytes 1024\r\nEND\r\n";

    const REDIS_BODY: &str = "# Server\r\nredis_version:7.2.0\r\n\r\n# Clients\r\n\
        connected_clients:4\r\nblocked_clients:0\r\n# Memory\r\nused_memory:2048\r\n\
        mem_fragmentation_ratio:1.5\r\n";

    #[derive(Default)]
    struct MemorySink {
        slots: BTreeMap<u16, AppMetrics>,
        /// Port whose publishes are refused, like a full map.
        refuse: Option<u16>,
    }

    impl ExportSink for MemorySink {
        fn publish(&mut self, port: u16, slot: AppMetrics) -> Result<()> {
            if self.refuse == Some(port) {
                anyhow::bail!("map full");
            }
            self.slots.insert(port, slot);
            Ok(())
        }

        fn withdraw(&mut self, port: u16) -> Result<()> {
            self.slots.remove(&port);
            Ok(())
        }
    }

    fn u64_at(block: &[u8], index: usize) -> u64 {
        u64::from_le_bytes(block[index * 8..index * 8 + 8].try_into().unwrap())
    }

    /// Answer every connection with `reply` once the request line arrives.
    async fn fake_server(reply: String) -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                    // Split the reply to exercise partial reads.
                    let (head, tail) = reply.as_bytes().split_at(reply.len() / 2);
                    stream.write_all(head).await.unwrap();
                    stream.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    stream.write_all(tail).await.unwrap();
                });
            }
        });
        addr
    }

    #[test]
    fn parses_memcached_stats() {
        let stats = parse_memcached(MEMCACHED_REPLY);
        assert_eq!(stats.get("uptime"), Some(&"100"));
        assert_eq!(stats.get("bytes"), Some(&"1024"));
        assert!(!stats.contains_key("END"));
    }

    #[test]
    fn parses_redis_info() {
        let info = parse_redis(REDIS_BODY);
        assert_eq!(info.get("connected_clients"), Some(&"4"));
        assert_eq!(info.get("redis_version"), Some(&"7.2.0"));
        assert!(!info.keys().any(|k| k.starts_with('#')));
    }

    #[test]
    fn packs_fields_in_order_and_sizes_the_block() {
        let stats = parse_memcached(MEMCACHED_REPLY);
        let block = pack(&MEMCACHED_FIELDS, &stats, 64);
        assert_eq!(block.len(), 64);
        assert_eq!(u64_at(&block, 0), 100);
        assert_eq!(u64_at(&block, 1), 3);
        assert_eq!(u64_at(&block, 2), 0);
        assert_eq!(u64_at(&block, 7), 1024);

        assert_eq!(pack(&MEMCACHED_FIELDS, &stats, 80)[64..], [0u8; 16]);
        assert_eq!(pack(&MEMCACHED_FIELDS, &stats, 12).len(), 12);
    }

    #[test]
    fn non_integer_values_pack_as_zero() {
        let info = parse_redis("used_memory:1.5\r\n");
        assert_eq!(pack(&["used_memory"], &info, 8), [0u8; 8]);
    }

    #[tokio::test]
    async fn fetches_memcached_block() {
        let addr = fake_server(MEMCACHED_REPLY.to_string()).await;
        let spec: InstanceSpec = format!("memcached:{}", addr.port()).parse().unwrap();

        let block = fetch_block(spec, addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(block.len(), 64);
        assert_eq!(u64_at(&block, 3), 7);
    }

    #[tokio::test]
    async fn fetches_redis_bulk_reply() {
        let reply = format!("${}\r\n{}\r\n", REDIS_BODY.len(), REDIS_BODY);
        let addr = fake_server(reply).await;
        let spec: InstanceSpec = format!("redis:{}", addr.port()).parse().unwrap();

        let block = fetch_block(spec, addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(block.len(), REDIS_FIELDS.len() * 8);
        assert_eq!(u64_at(&block, 0), 4);
        assert_eq!(u64_at(&block, 2), 2048);
    }

    #[tokio::test]
    async fn unreachable_instances_are_withdrawn() {
        let addr = fake_server(MEMCACHED_REPLY.to_string()).await;
        // Bind and drop a listener to get a port nothing listens on.
        let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let instances = [
            InstanceSpec::new(AppKind::Memcached, addr.port()),
            InstanceSpec::new(AppKind::Memcached, closed_port),
            InstanceSpec {
                kind: AppKind::Raw,
                port: 9000,
                block_len: 8,
            },
        ];
        let mut sink = MemorySink::default();
        sink.slots.insert(closed_port, AppMetrics::zeroed());
        sink.slots.insert(9000, AppMetrics::zeroed());

        let mut exporter = Exporter::new(
            sink,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(1),
            &instances,
        );
        assert_eq!(exporter.export_once().await, 0);
        assert_eq!(exporter.export_once().await, 0);
        let sink = exporter.into_sink();

        let slot = sink.slots.get(&addr.port()).unwrap();
        assert_eq!(slot.generation, 2);
        assert_eq!(slot.block().unwrap().len(), 64);
        assert!(!sink.slots.contains_key(&closed_port));
        // Raw slots belong to the instance.
        assert!(sink.slots.contains_key(&9000));
    }

    #[tokio::test]
    async fn failed_publish_does_not_stop_the_pass() {
        let addr = fake_server(MEMCACHED_REPLY.to_string()).await;
        let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let instances = [
            InstanceSpec::new(AppKind::Memcached, addr.port()),
            InstanceSpec::new(AppKind::Memcached, closed_port),
        ];
        let mut sink = MemorySink {
            refuse: Some(addr.port()),
            ..Default::default()
        };
        sink.slots.insert(closed_port, AppMetrics::zeroed());

        let mut exporter = Exporter::new(
            sink,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(1),
            &instances,
        );
        assert_eq!(exporter.export_once().await, 1);
        let sink = exporter.into_sink();

        assert!(!sink.slots.contains_key(&addr.port()));
        assert!(!sink.slots.contains_key(&closed_port));
    }
}
