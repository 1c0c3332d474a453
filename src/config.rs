// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use clap::{ArgAction, Parser, ValueEnum};
use log::LevelFilter;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReactorKind {
    /// io_uring readiness polling, falling back to poll(2) if unavailable
    Uring,
    /// poll(2)
    Poll,
}

/// Stress an HTTP server with batches of concurrent GET requests.
#[derive(Debug, Parser)]
#[command(name = "http-stress", disable_help_flag = true)]
pub struct Cli {
    /// Connect to specified host or ip
    #[arg(short = 'h', visible_short_alias = 'c', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to connect to
    #[arg(short, long, default_value_t = 80)]
    pub port: u16,

    /// Number of connections per iteration
    #[arg(short = 'n', long, default_value_t = 10)]
    pub connections: usize,

    /// Seconds before a connection times out
    #[arg(short, long, default_value_t = 1)]
    pub timeout: u64,

    /// Number of iterations to run
    #[arg(short, long, default_value_t = 1)]
    pub iterations: u64,

    /// Path to request on every connection
    #[arg(short = 'u', long, default_value = "")]
    pub url: String,

    /// File with one path per line; one connection per path and iteration
    #[arg(short = 'f', long)]
    pub paths_file: Option<PathBuf>,

    /// Only print errors and the summary
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,

    /// More logging; repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, value_enum, default_value_t = ReactorKind::Uring)]
    pub reactor: ReactorKind,

    /// Submission queue size of the io_uring reactor
    #[arg(long, default_value_t = 256)]
    pub ring_entries: u32,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

/// A validated run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The host as given, sent in the `Host` header.
    pub host: String,
    pub addr: SocketAddr,
    pub connections: usize,
    pub timeout: Duration,
    pub iterations: u64,
    pub path: String,
    pub paths_file: Option<PathBuf>,
    pub silent: bool,
    pub log_level: LevelFilter,
    pub reactor: ReactorKind,
    pub ring_entries: u32,
}

impl TryFrom<Cli> for Config {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self, Error> {
        if cli.connections == 0 {
            return Err(Error::InvalidValue {
                name: "connections",
                reason: "must be at least 1",
            });
        }
        if cli.timeout == 0 {
            return Err(Error::InvalidValue {
                name: "timeout",
                reason: "must be at least 1 second",
            });
        }
        if cli.ring_entries == 0 {
            return Err(Error::InvalidValue {
                name: "ring-entries",
                reason: "must be at least 1",
            });
        }

        let addr = resolve(&cli.host, cli.port)?;

        let log_level = match (cli.silent, cli.verbose) {
            (true, _) => LevelFilter::Error,
            (false, 0) => LevelFilter::Warn,
            (false, 1) => LevelFilter::Info,
            (false, 2) => LevelFilter::Debug,
            (false, _) => LevelFilter::Trace,
        };

        Ok(Self {
            host: cli.host,
            addr,
            connections: cli.connections,
            timeout: Duration::from_secs(cli.timeout),
            iterations: cli.iterations,
            path: cli.url,
            paths_file: cli.paths_file,
            silent: cli.silent,
            log_level,
            reactor: cli.reactor,
            ring_entries: cli.ring_entries,
        })
    }
}

/// Resolve `host` once, preferring IPv4 like the rest of the tool's defaults.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_owned(),
            source,
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Unresolved {
            host: host.to_owned(),
        })
}
