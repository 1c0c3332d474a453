// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use log::*;

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::{Event, Handler, Interest, Reactor, Token, Watch, next_wakeup};

/// A reactor built on plain `poll(2)`, rebuilding the descriptor set on every pass.
///
/// Used where io_uring is unavailable. Fine for the batch sizes a single client reaches, but it
/// costs O(watches) per wakeup.
#[derive(Debug, Default)]
pub struct PollReactor {
    watches: BTreeMap<Token, Watch>,
    exit_at: Option<Instant>,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `event` to the handler if `token` is still watched.
    fn deliver(&mut self, handler: &mut dyn Handler, token: Token, event: Event, now: Instant) {
        let Some(watch) = self.watches.get_mut(&token) else {
            trace!("Dropping {event} for {token:?}: no longer watched");
            return;
        };

        if watch.persistent {
            watch.rearm(now);
        } else {
            self.watches.remove(&token);
        }

        handler.on_event(self, token, event);
    }

    fn expire(&mut self, handler: &mut dyn Handler) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .watches
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(t, _)| *t)
            .collect();

        for token in expired {
            self.deliver(handler, token, Event::Timeout, now);
        }
    }
}

impl Reactor for PollReactor {
    fn register(
        &mut self,
        token: Token,
        fd: RawFd,
        interest: Interest,
        timeout: Duration,
        persistent: bool,
    ) -> io::Result<()> {
        self.watches
            .insert(token, Watch::new(fd, interest, timeout, persistent));
        Ok(())
    }

    fn deregister(&mut self, token: Token) -> io::Result<()> {
        self.watches.remove(&token);
        Ok(())
    }

    fn request_exit(&mut self, delay: Duration) {
        self.exit_at = Some(Instant::now() + delay);
    }

    fn run(&mut self, handler: &mut dyn Handler) -> io::Result<()> {
        loop {
            let now = Instant::now();
            if self.exit_at.is_some_and(|at| at <= now) || self.watches.is_empty() {
                self.exit_at = None;
                return Ok(());
            }

            let wait = next_wakeup(self.exit_at, self.watches.values(), now);
            let (tokens, mut fds): (Vec<Token>, Vec<libc::pollfd>) = self
                .watches
                .iter()
                .map(|(token, w)| {
                    let pollfd = libc::pollfd {
                        fd: w.fd,
                        events: w.interest.poll_flags(),
                        revents: 0,
                    };
                    (*token, pollfd)
                })
                .unzip();

            // SAFETY: `fds` is an initialized array of `fds.len()` pollfd structs that outlives
            // the call.
            let res = unsafe {
                libc::poll(
                    fds.as_mut_ptr(),
                    fds.len() as libc::nfds_t,
                    wait.map_or(-1, poll_timeout),
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let ready: Vec<(Token, Event)> = tokens
                .iter()
                .zip(&fds)
                .filter(|(_, p)| p.revents != 0)
                .map(|(token, p)| (*token, Event::from_revents(p.revents)))
                .collect();

            let now = Instant::now();
            for (token, event) in ready {
                self.deliver(handler, token, event, now);
            }

            self.expire(handler);
        }
    }
}

/// `poll(2)` takes whole milliseconds; round up so a deadline is never woken for early.
fn poll_timeout(wait: Duration) -> libc::c_int {
    let millis = wait.as_micros().div_ceil(1000);
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}
