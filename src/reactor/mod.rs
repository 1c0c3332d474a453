// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

//! Readiness-based event loops that drive connections.
//!
//! A [`Reactor`] watches file descriptors for readiness, each watch carrying a timeout, and
//! delivers [`Event`]s to a [`Handler`] until it is asked to exit or runs out of watches.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub mod poll;
pub mod uring;

pub use poll::PollReactor;
pub use uring::UringReactor;

/// Identifies a watch. Chosen by the caller and handed back with every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Writable,
    Readable,
}

impl Interest {
    fn poll_flags(self) -> libc::c_short {
        match self {
            Self::Writable => libc::POLLOUT,
            Self::Readable => libc::POLLIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Writable,
    Readable,
    /// The watch's timeout elapsed without readiness.
    Timeout,
    Error,
    Hangup,
}

impl Event {
    /// Classify a `poll(2)`-style `revents` mask. Readable data wins over error bits so that a
    /// peer's final bytes are still read before its hangup is seen.
    fn from_revents(revents: libc::c_short) -> Self {
        if revents & libc::POLLIN != 0 {
            Self::Readable
        } else if revents & libc::POLLOUT != 0 {
            Self::Writable
        } else if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            Self::Error
        } else {
            Self::Hangup
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Writable => write!(f, "writable"),
            Self::Readable => write!(f, "readable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::Hangup => write!(f, "hangup"),
        }
    }
}

/// Receives events from [`Reactor::run`].
pub trait Handler {
    /// Called once per delivered event. The reactor is handed back so the handler can change or
    /// drop watches, or ask the loop to exit.
    fn on_event(&mut self, reactor: &mut dyn Reactor, token: Token, event: Event);
}

pub trait Reactor {
    /// Watch `fd` for `interest`, replacing any watch already held by `token`.
    ///
    /// A non-persistent watch is dropped after delivering one event. A persistent one stays
    /// armed, and its timeout restarts every time it delivers.
    fn register(
        &mut self,
        token: Token,
        fd: RawFd,
        interest: Interest,
        timeout: Duration,
        persistent: bool,
    ) -> io::Result<()>;

    /// Drop the watch held by `token`, if any.
    fn deregister(&mut self, token: Token) -> io::Result<()>;

    /// Make [`Reactor::run`] return once `delay` has passed.
    fn request_exit(&mut self, delay: Duration);

    /// Deliver events until an exit is requested or no watches remain.
    fn run(&mut self, handler: &mut dyn Handler) -> io::Result<()>;
}

/// Bookkeeping shared by the reactor implementations.
#[derive(Debug, Clone, Copy)]
struct Watch {
    fd: RawFd,
    interest: Interest,
    timeout: Duration,
    deadline: Instant,
    persistent: bool,
}

impl Watch {
    fn new(fd: RawFd, interest: Interest, timeout: Duration, persistent: bool) -> Self {
        Self {
            fd,
            interest,
            timeout,
            deadline: Instant::now() + timeout,
            persistent,
        }
    }

    fn rearm(&mut self, now: Instant) {
        self.deadline = now + self.timeout;
    }
}

/// Time left until the exit deadline or the earliest watch deadline, whichever comes first.
fn next_wakeup<'w>(
    exit_at: Option<Instant>,
    watches: impl Iterator<Item = &'w Watch>,
    now: Instant,
) -> Option<Duration> {
    watches
        .map(|w| w.deadline)
        .chain(exit_at)
        .min()
        .map(|at| at.saturating_duration_since(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_wins_over_hangup() {
        assert_eq!(
            Event::from_revents(libc::POLLIN | libc::POLLHUP),
            Event::Readable
        );
        assert_eq!(
            Event::from_revents(libc::POLLOUT | libc::POLLERR | libc::POLLHUP),
            Event::Writable
        );
        assert_eq!(Event::from_revents(libc::POLLERR), Event::Error);
        assert_eq!(Event::from_revents(libc::POLLHUP), Event::Hangup);
    }

    #[test]
    fn wakeup_is_earliest_deadline() {
        let watches = [
            Watch::new(3, Interest::Readable, Duration::from_secs(5), true),
            Watch::new(4, Interest::Writable, Duration::from_secs(1), false),
        ];
        let now = Instant::now();

        let wait = next_wakeup(None, watches.iter(), now).unwrap();
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::from_millis(900));

        let wait = next_wakeup(Some(now), watches.iter(), now).unwrap();
        assert_eq!(wait, Duration::ZERO);

        assert_eq!(next_wakeup(None, std::iter::empty::<&Watch>(), now), None);
    }
}
