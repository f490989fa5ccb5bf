//! x-monitor userspace
//!
//! `run` loads the XDP responder and keeps its metric maps fresh.
//! `probe` measures round trips against a responder.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod config;
mod exporter;
mod host;
mod loader;
mod probe;
mod stats;

#[derive(Debug, Parser)]
#[command(name = "xmonitor", about = "XDP responder that embeds host and application metrics in probe replies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach the responder to an interface
    Run(config::RunArgs),
    /// Send probes to a responder and record round-trip times
    Probe(probe::ProbeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Run(args) => loader::run(args).await,
        Command::Probe(args) => probe::run(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn preset_conflicts_with_explicit_sources() {
        let err = Cli::try_parse_from([
            "xmonitor", "run", "-i", "eth0", "--preset", "redis", "--host", "cpu",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["xmonitor", "run", "-i", "eth0", "--host", "cpu,memory"])
            .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.responder_config();
        assert_eq!(config.probe_port, 22222);
        assert_eq!(config.reply_port, 22222);
        assert_eq!(args.registry.build().unwrap().len(), 2);
    }
}
