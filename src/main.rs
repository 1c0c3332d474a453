// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use clap::Parser;
use log::*;

use http_stress::config::{Cli, Config, ReactorKind};
use http_stress::coordinator::Coordinator;
use http_stress::error::Error;
use http_stress::limits::{self, FD_MARGIN};
use http_stress::reactor::{PollReactor, Reactor, UringReactor};
use http_stress::report::Report;
use http_stress::target::TargetRegistry;

fn main() -> Result<(), Error> {
    let config = Config::try_from(Cli::parse())?;

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .init();

    let registry = match &config.paths_file {
        Some(path) => TargetRegistry::from_file(path).unwrap_or_else(|err| {
            warn!("{err}; requesting /{} instead", config.path);
            TargetRegistry::single(&config.path, config.connections)
        }),
        None => TargetRegistry::single(&config.path, config.connections),
    };

    let wanted = registry.batch_size() as u64 + FD_MARGIN;
    if let Err(err) = limits::raise_fd_limit(wanted) {
        warn!("Failed to raise open file limit to {wanted}: {err}");
    }

    let mut reactor = reactor(&config);
    let mut coordinator = Coordinator::new(config.addr, &config.host, config.timeout, registry);

    info!(
        "Running {} iterations of {} connections against {}",
        config.iterations,
        coordinator.registry().batch_size(),
        config.addr
    );
    coordinator.run(&mut *reactor, config.iterations)?;

    let targets: &[_] = if config.silent {
        &[]
    } else {
        coordinator.registry().targets()
    };
    let batch_size = coordinator.registry().batch_size();
    println!("{}", Report::new(coordinator.stats(), batch_size, targets));

    Ok(())
}

fn reactor(config: &Config) -> Box<dyn Reactor> {
    match config.reactor {
        ReactorKind::Poll => Box::new(PollReactor::new()),
        ReactorKind::Uring => match UringReactor::new(config.ring_entries) {
            Ok(reactor) => Box::new(reactor),
            Err(err) => {
                warn!("io_uring unavailable ({err}); falling back to poll(2)");
                Box::new(PollReactor::new())
            }
        },
    }
}
