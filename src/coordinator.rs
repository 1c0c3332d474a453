// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use log::*;

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::connection::{self, Connection, Step};
use crate::reactor::{Event, Handler, Interest, Reactor, Token};
use crate::stats::{Failure, Outcome, RunStats};
use crate::target::TargetRegistry;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Live connections, keyed by the token their watch is registered under. Removing an entry is
/// the only way a connection is released.
#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Option<Connection>>,
    free: Vec<usize>,
}

impl Slots {
    fn insert(&mut self, conn: Connection) -> Token {
        match self.free.pop() {
            Some(i) => {
                self.entries[i] = Some(conn);
                Token(i)
            }
            None => {
                self.entries.push(Some(conn));
                Token(self.entries.len() - 1)
            }
        }
    }

    fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.entries.get_mut(token.0)?.as_mut()
    }

    fn remove(&mut self, token: Token) -> Option<Connection> {
        let conn = self.entries.get_mut(token.0)?.take()?;
        self.free.push(token.0);
        Some(conn)
    }

    fn tokens(&self) -> Vec<Token> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| Token(i))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

/// Launches batches of connections and accounts for every one of them.
#[derive(Debug)]
pub struct Coordinator {
    addr: SocketAddr,
    host: String,
    timeout: Duration,
    registry: TargetRegistry,
    stats: RunStats,
    connections: Slots,
    /// Connections of the current batch that have not reached a terminal state.
    outstanding: usize,
    buf: Vec<u8>,
}

impl Coordinator {
    /// `host` is sent in the `Host` header of every request to `addr`.
    pub fn new(addr: SocketAddr, host: &str, timeout: Duration, registry: TargetRegistry) -> Self {
        Self {
            addr,
            host: host.to_owned(),
            timeout,
            registry,
            stats: RunStats::default(),
            connections: Slots::default(),
            outstanding: 0,
            buf: vec![0; READ_BUF_SIZE],
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Connections currently allocated.
    pub fn live(&self) -> usize {
        self.connections.len()
    }

    /// Run `iterations` batches back to back.
    ///
    /// # Errors
    ///
    /// Only failures of the reactor itself are returned; failed connections are counted.
    pub fn run(&mut self, reactor: &mut dyn Reactor, iterations: u64) -> io::Result<()> {
        for i in 1..=iterations {
            debug!("Starting iteration {i} of {iterations}");
            self.run_iteration(reactor)?;
        }

        Ok(())
    }

    /// Launch one batch and return once every connection in it has finished.
    ///
    /// # Errors
    ///
    /// Fails if the reactor's loop fails.
    pub fn run_iteration(&mut self, reactor: &mut dyn Reactor) -> io::Result<()> {
        let started = Instant::now();
        let before = self.stats;

        self.launch(reactor);
        if self.outstanding > 0 {
            reactor.run(self)?;
        }

        if self.outstanding > 0 {
            warn!(
                "Event loop stopped with {} connections outstanding; counting them as timed out",
                self.outstanding
            );
            // The loop is over, so no exit is requested; one left pending would cut the next
            // iteration short.
            for token in self.connections.tokens() {
                self.release(reactor, token, Outcome::Failure(Failure::Timeout));
            }
        }

        let elapsed = started.elapsed();
        self.stats.add_iteration(elapsed);

        info!(
            "Iteration {} finished in {:?}: {} of {} succeeded, {} bytes",
            self.stats.iterations,
            elapsed,
            self.stats.successes - before.successes,
            self.stats.attempts - before.attempts,
            self.stats.bytes - before.bytes,
        );

        Ok(())
    }

    fn launch(&mut self, reactor: &mut dyn Reactor) {
        let wanted = self.registry.batch_size();

        for (target, path) in self.registry.launch_plan() {
            let request = connection::request(&self.host, path);
            let conn = match Connection::open(self.addr, request, target) {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("socket() failed: {err}");
                    continue;
                }
            };

            let fd = conn.fd();
            let token = self.connections.insert(conn);
            if let Err(err) = reactor.register(token, fd, Interest::Writable, self.timeout, false)
            {
                warn!("Failed to watch fd {fd}: {err}");
                self.connections.remove(token);
                continue;
            }

            self.outstanding += 1;
        }

        if self.outstanding < wanted {
            warn!("Launched {} of {wanted} connections", self.outstanding);
        } else {
            debug!("Launched {wanted} connections");
        }
    }

    /// Release a connection from inside the event loop, stopping the loop after the last one.
    fn finish(&mut self, reactor: &mut dyn Reactor, token: Token, outcome: Outcome) {
        if self.release(reactor, token, outcome) && self.outstanding == 0 {
            reactor.request_exit(Duration::ZERO);
        }
    }

    /// The single release point of a connection. Returns false if `token` was already released.
    fn release(&mut self, reactor: &mut dyn Reactor, token: Token, outcome: Outcome) -> bool {
        if let Err(err) = reactor.deregister(token) {
            warn!("Failed to drop watch for {token:?}: {err}");
        }

        let Some(conn) = self.connections.remove(token) else {
            return false;
        };
        let finished = conn.finish(outcome);

        match finished.outcome {
            Outcome::Success { latency } => {
                debug!("Connection {token:?} done: {} bytes in {latency:?}", finished.bytes);
            }
            Outcome::Failure(failure) => {
                debug!("Connection {token:?} failed: {failure}");
            }
        }

        let target = finished.target.and_then(|id| self.registry.get_mut(id));
        self.stats.record(&finished, target);

        self.outstanding -= 1;
        true
    }
}

impl Handler for Coordinator {
    fn on_event(&mut self, reactor: &mut dyn Reactor, token: Token, event: Event) {
        let Some(conn) = self.connections.get_mut(token) else {
            trace!("Dropping {event} for released connection {token:?}");
            return;
        };

        match conn.handle_event(event, &mut self.buf) {
            Step::Pending => {}
            Step::AwaitResponse => {
                let fd = conn.fd();
                if let Err(err) =
                    reactor.register(token, fd, Interest::Readable, self.timeout, true)
                {
                    warn!("Failed to watch fd {fd} for the response: {err}");
                    self.finish(reactor, token, Outcome::Failure(Failure::Read));
                }
            }
            Step::Done(outcome) => self.finish(reactor, token, outcome),
        }
    }
}
