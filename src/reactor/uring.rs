// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use io_uring::{IoUring, cqueue, opcode, squeue, types};
use log::*;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::{Event, Handler, Interest, Reactor, Token, Watch, next_wakeup};

/// user_data for `PollRemove` submissions. Their completions carry nothing we act on.
const REMOVE_USER_DATA: u64 = u64::MAX;

#[derive(Debug)]
struct Armed {
    watch: Watch,
    /// user_data of the `PollAdd` currently serving this watch.
    poll_id: u64,
}

/// A reactor that gets readiness from io_uring `PollAdd` requests.
///
/// Persistent watches use multishot polls. Timeouts are tracked here rather than in the ring:
/// the loop waits for completions with the nearest deadline as its timeout.
pub struct UringReactor {
    ring: IoUring,
    watches: HashMap<Token, Armed>,
    /// Live poll submissions, by user_data. Completions for anything not in here are stale.
    polls: HashMap<u64, Token>,
    next_id: u64,
    exit_at: Option<Instant>,
}

impl UringReactor {
    /// # Errors
    ///
    /// Fails if the kernel refuses to set up a ring, e.g. when io_uring is disabled, or if it is
    /// too old (before 5.11) to wait for completions with a timeout.
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        require_ext_arg(ring.params().is_feature_ext_arg())?;

        Ok(Self {
            ring,
            watches: HashMap::new(),
            polls: HashMap::new(),
            next_id: 0,
            exit_at: None,
        })
    }

    fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        // SAFETY: poll and poll-remove entries carry only a descriptor and ids, no buffers that
        // would have to outlive the submission.
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        // Queue is full: flush it to the kernel and try again.
        self.ring.submit()?;

        // SAFETY: as above.
        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| io::Error::other("submission queue is full"))
    }

    /// Submit a poll for `watch` and return its user_data.
    fn arm(&mut self, token: Token, watch: &Watch) -> io::Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        let poll = opcode::PollAdd::new(types::Fd(watch.fd), watch.interest.poll_flags() as u32)
            .multi(watch.persistent)
            .build()
            .user_data(id);
        self.push(&poll)?;
        self.polls.insert(id, token);

        Ok(id)
    }

    /// Cancel the poll with user_data `poll_id` if the kernel still holds it.
    fn disarm(&mut self, poll_id: u64) -> io::Result<()> {
        if self.polls.remove(&poll_id).is_none() {
            return Ok(());
        }

        let remove = opcode::PollRemove::new(poll_id)
            .build()
            .user_data(REMOVE_USER_DATA);
        self.push(&remove)
    }

    fn wait(&mut self, wait: Option<Duration>) -> io::Result<()> {
        let res = match wait {
            Some(wait) => {
                let ts = types::Timespec::new()
                    .sec(wait.as_secs())
                    .nsec(wait.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submit_and_wait(1),
        };

        match res {
            Ok(_) => Ok(()),
            // Deadline reached or interrupted; the loop re-checks timers either way.
            Err(err) if matches!(err.raw_os_error(), Some(libc::ETIME | libc::EINTR)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn complete(
        &mut self,
        handler: &mut dyn Handler,
        cqe: (u64, i32, u32),
        now: Instant,
    ) -> io::Result<()> {
        let (user_data, result, flags) = cqe;

        if user_data == REMOVE_USER_DATA {
            if result < 0 && result != -libc::ENOENT && result != -libc::EALREADY {
                debug!("Poll removal failed: {}", io::Error::from_raw_os_error(-result));
            }
            return Ok(());
        }

        let Some(&token) = self.polls.get(&user_data) else {
            trace!("Ignoring stale completion {user_data}: {result}");
            return Ok(());
        };

        let more = cqueue::more(flags);
        if !more {
            self.polls.remove(&user_data);
        }

        let event = if result < 0 {
            debug!(
                "Poll failed for {token:?}: {}",
                io::Error::from_raw_os_error(-result)
            );
            Event::Error
        } else {
            Event::from_revents(result as libc::c_short)
        };

        let Some(armed) = self.watches.get_mut(&token) else {
            return Ok(());
        };

        if armed.watch.persistent {
            armed.watch.rearm(now);
            if !more && result >= 0 {
                warn!("Multishot poll did not set MORE flag; resubmitting");
                let watch = armed.watch;
                let poll_id = self.arm(token, &watch)?;
                if let Some(armed) = self.watches.get_mut(&token) {
                    armed.poll_id = poll_id;
                }
            }
        } else {
            self.watches.remove(&token);
        }

        handler.on_event(self, token, event);

        Ok(())
    }

    fn expire(&mut self, handler: &mut dyn Handler) -> io::Result<()> {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .watches
            .iter()
            .filter(|(_, armed)| armed.watch.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            let Some(armed) = self.watches.get_mut(&token) else {
                continue;
            };

            if armed.watch.persistent {
                armed.watch.rearm(now);
            } else {
                let poll_id = armed.poll_id;
                self.watches.remove(&token);
                self.disarm(poll_id)?;
            }

            handler.on_event(self, token, Event::Timeout);
        }

        Ok(())
    }
}

/// The wait loop passes its deadline through `IORING_ENTER_EXT_ARG`.
fn require_ext_arg(supported: bool) -> io::Result<()> {
    if supported {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "io_uring lacks IORING_FEAT_EXT_ARG (kernel 5.11+)",
        ))
    }
}

impl Reactor for UringReactor {
    fn register(
        &mut self,
        token: Token,
        fd: RawFd,
        interest: Interest,
        timeout: Duration,
        persistent: bool,
    ) -> io::Result<()> {
        if let Some(old) = self.watches.remove(&token) {
            self.disarm(old.poll_id)?;
        }

        let watch = Watch::new(fd, interest, timeout, persistent);
        let poll_id = self.arm(token, &watch)?;
        self.watches.insert(token, Armed { watch, poll_id });

        Ok(())
    }

    fn deregister(&mut self, token: Token) -> io::Result<()> {
        match self.watches.remove(&token) {
            Some(armed) => self.disarm(armed.poll_id),
            None => Ok(()),
        }
    }

    fn request_exit(&mut self, delay: Duration) {
        self.exit_at = Some(Instant::now() + delay);
    }

    fn run(&mut self, handler: &mut dyn Handler) -> io::Result<()> {
        loop {
            let now = Instant::now();
            if self.exit_at.is_some_and(|at| at <= now) || self.watches.is_empty() {
                self.exit_at = None;
                // Hand pending removals to the kernel before going idle.
                self.ring.submit()?;
                return Ok(());
            }

            let wait = next_wakeup(
                self.exit_at,
                self.watches.values().map(|armed| &armed.watch),
                now,
            );
            self.wait(wait)?;

            let completions: Vec<(u64, i32, u32)> = self
                .ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
                .collect();

            let now = Instant::now();
            for cqe in completions {
                self.complete(handler, cqe, now)?;
            }

            self.expire(handler)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(Token, Event)>,
    }

    impl Handler for Recorder {
        fn on_event(&mut self, reactor: &mut dyn Reactor, token: Token, event: Event) {
            self.events.push((token, event));
            reactor.deregister(token).unwrap();
        }
    }

    fn ring() -> Option<UringReactor> {
        match UringReactor::new(8) {
            Ok(reactor) => Some(reactor),
            Err(err) => {
                eprintln!("io_uring unavailable, skipping: {err}");
                None
            }
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn old_kernels_are_unsupported() {
        assert!(require_ext_arg(true).is_ok());

        let err = require_ext_arg(false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn delivers_readiness_and_timeouts() {
        let Some(mut reactor) = ring() else {
            return;
        };

        let (writer, _peer) = pair();
        let (idle, _idle_peer) = pair();
        let (reader, mut reader_peer) = pair();
        reader_peer.write_all(b"response").unwrap();

        let timeout = Duration::from_millis(100);
        reactor
            .register(Token(0), writer.as_raw_fd(), Interest::Writable, timeout, false)
            .unwrap();
        reactor
            .register(Token(1), idle.as_raw_fd(), Interest::Readable, timeout, false)
            .unwrap();
        reactor
            .register(Token(2), reader.as_raw_fd(), Interest::Readable, timeout, true)
            .unwrap();

        let mut recorder = Recorder::default();
        reactor.run(&mut recorder).unwrap();

        recorder.events.sort_by_key(|(token, _)| *token);
        assert_eq!(
            recorder.events,
            [
                (Token(0), Event::Writable),
                (Token(1), Event::Timeout),
                (Token(2), Event::Readable),
            ]
        );
    }

    #[test]
    fn replaced_watch_ignores_old_poll() {
        let Some(mut reactor) = ring() else {
            return;
        };

        let (client, mut server) = pair();
        let timeout = Duration::from_secs(5);

        reactor
            .register(Token(4), client.as_raw_fd(), Interest::Readable, timeout, false)
            .unwrap();
        reactor
            .register(Token(4), client.as_raw_fd(), Interest::Writable, timeout, false)
            .unwrap();
        server.write_all(b"x").unwrap();

        let mut recorder = Recorder::default();
        reactor.run(&mut recorder).unwrap();

        assert_eq!(recorder.events, [(Token(4), Event::Writable)]);
    }
}
