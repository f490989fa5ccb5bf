//! Probe client.
//!
//! Sends fixed-size UDP probes to the responder at a steady interval and
//! records one line per reply:
//!
//! ```text
//! YYYY/MM/DD-HH:MM:SS.micros,send_sec.send_nsec,rtt_us
//! ```
//!
//! The first column is the local receive time, the second the wall clock
//! at send, the third the round trip in microseconds with two decimals.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::Args;
use log::{debug, info, warn};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use xmonitor_common::{BlockReader, Registry};

use crate::config::{RegistryArgs, DEFAULT_PROBE_SIZE};

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// File to write the samples to
    pub output: PathBuf,

    /// Seconds between probes; asked for on stdin when omitted
    #[arg(long)]
    pub interval: Option<f64>,

    /// Length of the measurement in seconds
    #[arg(long, default_value = "60")]
    pub baseline: f64,

    /// Responder address
    #[arg(long, env = "XMONITOR_TARGET", default_value = "10.0.0.1:22222")]
    pub target: SocketAddr,

    /// Local address replies are received on
    #[arg(long, env = "XMONITOR_BIND", default_value = "0.0.0.0:22222")]
    pub bind: SocketAddr,

    /// Probe payload size in bytes; bounds the metric payload of the reply
    #[arg(long, default_value_t = DEFAULT_PROBE_SIZE)]
    pub size: usize,

    /// How long to wait for each reply
    #[arg(long, default_value = "1000")]
    pub timeout_ms: u64,

    /// Registry the responder runs with; replies are checked against it
    #[command(flatten)]
    pub registry: RegistryArgs,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let interval = match args.interval {
        Some(interval) => interval,
        None => {
            read_interval(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?
        }
    };
    let iterations = iterations(args.baseline, interval)?;
    let period = Duration::try_from_secs_f64(interval).context("Interval out of range")?;

    let registry = if args.registry.is_empty() {
        None
    } else {
        let registry = args.registry.build()?;
        if registry.payload_len() > args.size {
            warn!(
                "Registry needs {} payload bytes but probes carry {}; the responder will pass them",
                registry.payload_len(),
                args.size
            );
        }
        Some(registry)
    };

    let mut prober = Prober::bind(
        args.target,
        args.bind,
        args.size,
        Duration::from_millis(args.timeout_ms),
    )
    .await?;

    info!(
        "Probing {} every {}s, {} samples of {} bytes into {}",
        args.target,
        interval,
        iterations,
        args.size,
        args.output.display()
    );
    let summary = measure(
        &mut prober,
        &args.output,
        iterations,
        period,
        registry.as_ref(),
    )
    .await?;
    info!(
        "Done: {} samples, {} timeouts, {} partial replies",
        summary.samples, summary.timeouts, summary.partial
    );
    Ok(())
}

/// Number of probes that fit in `baseline` seconds at `interval`.
pub fn iterations(baseline: f64, interval: f64) -> Result<u64> {
    if !interval.is_finite() || interval <= 0.0 {
        bail!("Interval must be a positive number of seconds, got {}", interval);
    }
    if !baseline.is_finite() || baseline < 0.0 {
        bail!("Baseline must be a non-negative number of seconds, got {}", baseline);
    }
    // Absorb the representation error of decimal intervals (60 / 0.1).
    Ok((baseline / interval + 1e-9).floor() as u64)
}

pub async fn read_interval<R, W>(mut input: R, mut output: W) -> Result<f64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(b"Enter interval (unit is second): ").await?;
    output.flush().await?;

    let mut line = String::new();
    input
        .read_line(&mut line)
        .await
        .context("Failed to read interval")?;
    line.trim()
        .parse()
        .with_context(|| format!("Invalid interval: {:?}", line.trim()))
}

#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub sent_at: SystemTime,
    pub received_at: SystemTime,
    pub rtt: Duration,
    pub len: usize,
}

pub fn format_line(sample: &Sample) -> String {
    let received: DateTime<Local> = sample.received_at.into();
    let sent = sample.sent_at.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!(
        "{},{}.{:09},{:.2}",
        received.format("%Y/%m/%d-%H:%M:%S%.6f"),
        sent.as_secs(),
        sent.subsec_nanos(),
        sample.rtt.as_secs_f64() * 1e6
    )
}

pub struct Prober {
    send: UdpSocket,
    recv: UdpSocket,
    buf: Vec<u8>,
    timeout: Duration,
}

impl Prober {
    /// Replies come back to a fixed port, so they are read on their own
    /// socket bound to `bind`; probes leave from an ephemeral port.
    pub async fn bind(
        target: SocketAddr,
        bind: SocketAddr,
        size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let recv = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("Failed to bind reply socket to {}", bind))?;
        let send = UdpSocket::bind(SocketAddr::new(bind.ip(), 0))
            .await
            .context("Failed to bind probe socket")?;
        send.connect(target)
            .await
            .with_context(|| format!("Failed to connect to {}", target))?;
        Ok(Self {
            send,
            recv,
            buf: vec![0; size],
            timeout,
        })
    }

    pub fn reply_addr(&self) -> Result<SocketAddr> {
        Ok(self.recv.local_addr()?)
    }

    /// Send one probe and wait for its reply; `None` on timeout.
    pub async fn sample(&mut self) -> Result<Option<Sample>> {
        // Late replies to earlier probes would be taken for this one.
        while self.recv.try_recv(&mut self.buf).is_ok() {}
        self.buf.fill(0);

        let sent_at = SystemTime::now();
        let start = Instant::now();
        self.send.send(&self.buf).await.context("Failed to send probe")?;

        match tokio::time::timeout(self.timeout, self.recv.recv(&mut self.buf)).await {
            Err(_) => Ok(None),
            Ok(received) => {
                let len = received.context("Failed to receive reply")?;
                Ok(Some(Sample {
                    sent_at,
                    received_at: SystemTime::now(),
                    rtt: start.elapsed(),
                    len,
                }))
            }
        }
    }

    /// Payload of the last reply.
    pub fn payload(&self, sample: &Sample) -> &[u8] {
        &self.buf[..sample.len.min(self.buf.len())]
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub samples: u64,
    pub timeouts: u64,
    /// Replies with fewer filled blocks than the registry holds.
    pub partial: u64,
}

/// Blocks of `payload` holding anything but zeros. Host blocks always carry
/// their sample time, so a zero block is one the responder never wrote.
pub fn filled_blocks(payload: &[u8], registry: &Registry) -> usize {
    BlockReader::new(payload, registry.entries())
        .filter(|(_, block)| block.iter().any(|b| *b != 0))
        .count()
}

/// One warm-up probe, then `iterations` paced samples written to `output`.
pub async fn measure(
    prober: &mut Prober,
    output: &Path,
    iterations: u64,
    interval: Duration,
    registry: Option<&Registry>,
) -> Result<Summary> {
    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut out = BufWriter::new(file);
    let mut summary = Summary::default();

    if prober.sample().await?.is_none() {
        warn!("No reply to the warm-up probe");
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for i in 0..iterations {
        ticker.tick().await;
        let Some(sample) = prober.sample().await? else {
            summary.timeouts += 1;
            debug!("Probe {} timed out", i);
            continue;
        };
        writeln!(out, "{}", format_line(&sample))?;
        summary.samples += 1;

        if let Some(registry) = registry {
            let filled = filled_blocks(prober.payload(&sample), registry);
            if filled < registry.len() {
                summary.partial += 1;
                debug!("Reply {} carried {} of {} blocks", i, filled, registry.len());
            }
        }
    }
    out.flush()
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmonitor_common::RegistryEntry;

    /// Reflects probes to `reply_to`, stamping the first `filled` bytes.
    fn spawn_reflector(socket: UdpSocket, reply_to: SocketAddr, filled: usize) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, _) = socket.recv_from(&mut buf).await.unwrap();
                buf[..filled.min(n)].fill(0xee);
                socket.send_to(&buf[..n], reply_to).await.unwrap();
            }
        });
    }

    async fn loopback_prober(size: usize, timeout: Duration) -> (Prober, UdpSocket) {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let prober = Prober::bind(
            responder.local_addr().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            size,
            timeout,
        )
        .await
        .unwrap();
        (prober, responder)
    }

    #[test]
    fn iterations_follow_baseline_over_interval() {
        assert_eq!(iterations(60.0, 0.5).unwrap(), 120);
        assert_eq!(iterations(60.0, 0.1).unwrap(), 600);
        assert_eq!(iterations(60.0, 1.0).unwrap(), 60);
        assert_eq!(iterations(1.0, 3.0).unwrap(), 0);
        assert!(iterations(60.0, 0.0).is_err());
        assert!(iterations(60.0, f64::NAN).is_err());
    }

    #[tokio::test]
    async fn prompts_for_the_interval() {
        let mut prompt = Vec::new();
        let interval = read_interval(&b"0.25\n"[..], &mut prompt).await.unwrap();
        assert_eq!(interval, 0.25);
        assert!(String::from_utf8(prompt).unwrap().contains("interval"));

        assert!(read_interval(&b"soon\n"[..], Vec::new()).await.is_err());
    }

    #[test]
    fn formats_sample_lines() {
        let sample = Sample {
            sent_at: UNIX_EPOCH + Duration::new(1_700_000_000, 123),
            received_at: UNIX_EPOCH + Duration::new(1_700_000_000, 500_000_000),
            rtt: Duration::from_nanos(1_234_567),
            len: 0,
        };
        let line = format_line(&sample);
        let fields: Vec<&str> = line.split(',').collect();

        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].len(), "2023/11/14-22:13:20.500000".len());
        assert!(fields[0].ends_with(".500000"));
        assert_eq!(&fields[0][4..5], "/");
        assert_eq!(&fields[0][10..11], "-");
        assert_eq!(fields[1], "1700000000.000000123");
        assert_eq!(fields[2], "1234.57");
    }

    #[test]
    fn counts_filled_blocks() {
        let registry = Registry::from_entries(&[
            RegistryEntry::indirect(11211, 4),
            RegistryEntry::indirect(11212, 4),
        ])
        .unwrap();
        assert_eq!(filled_blocks(&[1, 0, 0, 0, 0, 0, 0, 0], &registry), 1);
        assert_eq!(filled_blocks(&[1, 0, 0, 0, 0, 0, 2, 0], &registry), 2);
        assert_eq!(filled_blocks(&[1, 0], &registry), 0);
    }

    #[tokio::test]
    async fn records_one_line_per_reply() {
        let (mut prober, responder) = loopback_prober(64, Duration::from_secs(1)).await;
        spawn_reflector(responder, prober.reply_addr().unwrap(), 4);
        let registry = Registry::from_entries(&[
            RegistryEntry::indirect(11211, 4),
            RegistryEntry::indirect(11212, 4),
        ])
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("rtt.csv");

        let summary = measure(
            &mut prober,
            &output,
            3,
            Duration::from_millis(5),
            Some(&registry),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            Summary {
                samples: 3,
                timeouts: 0,
                partial: 3
            }
        );
        let text = std::fs::read_to_string(&output).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().all(|l| l.split(',').count() == 3));
    }

    #[tokio::test]
    async fn silent_responder_times_out() {
        let (mut prober, _responder) = loopback_prober(16, Duration::from_millis(20)).await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("rtt.csv");

        let summary = measure(&mut prober, &output, 2, Duration::from_millis(1), None)
            .await
            .unwrap();

        assert_eq!(summary.samples, 0);
        assert_eq!(summary.timeouts, 2);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "");
    }
}
