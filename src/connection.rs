// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use log::*;
use socket2::{Domain, Protocol, Socket, Type};

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use crate::reactor::Event;
use crate::stats::{Failure, Finished, Outcome};
use crate::target::TargetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Reading,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Reading => write!(f, "reading"),
        }
    }
}

/// What the driver of a [`Connection`] has to do after an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Keep the current watch.
    Pending,
    /// The request is out; watch the socket for the response from now on.
    AwaitResponse,
    /// Terminal. Release the connection with [`Connection::finish`].
    Done(Outcome),
}

/// One in-flight request.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    state: State,
    target: Option<TargetId>,
    started: Instant,
    request: Vec<u8>,
    /// An error from `connect()` itself, reported on the first event.
    connect_error: Option<io::Error>,
    received: u64,
}

/// The request sent for `path`, byte for byte.
pub fn request(host: &str, path: &str) -> Vec<u8> {
    format!("GET /{path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").into_bytes()
}

impl Connection {
    /// Create a non-blocking socket and start connecting it to `addr`.
    ///
    /// # Errors
    ///
    /// Fails only if the socket cannot be set up. A refused or unreachable peer is not an error
    /// here; it surfaces as a connect failure from [`Connection::handle_event`].
    pub fn open(
        addr: SocketAddr,
        request: Vec<u8>,
        target: Option<TargetId>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        let started = Instant::now();
        socket.set_nonblocking(true)?;

        let connect_error = match socket.connect(&addr.into()) {
            Ok(()) => None,
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => None,
            Err(err) => Some(err),
        };

        Ok(Self {
            stream: socket.into(),
            state: State::Connecting,
            target,
            started,
            request,
            connect_error,
            received: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Advance the state machine for one reactor event. `buf` is scratch space for reads.
    pub fn handle_event(&mut self, event: Event, buf: &mut [u8]) -> Step {
        match (self.state, event) {
            (_, Event::Timeout) => {
                debug!("Timed out while {} on fd {}", self.state, self.fd());
                Step::Done(Outcome::Failure(Failure::Timeout))
            }
            (State::Connecting, Event::Writable) => self.send_request(),
            (State::Connecting, event) => {
                debug!("Connection error on fd {}: {event}", self.fd());
                Step::Done(Outcome::Failure(Failure::Connect))
            }
            (State::Reading, Event::Readable) => self.read_response(buf),
            (State::Reading, event) => {
                debug!("Read error, connection closed on fd {}: {event}", self.fd());
                Step::Done(Outcome::Failure(Failure::Hangup))
            }
        }
    }

    fn send_request(&mut self) -> Step {
        let error = match self.connect_error.take() {
            Some(err) => Some(err),
            None => self.stream.take_error().unwrap_or_else(Some),
        };
        if let Some(err) = error {
            debug!("Connection error on fd {}: {err}", self.fd());
            return Step::Done(Outcome::Failure(Failure::Connect));
        }

        trace!("Connection successful on fd {}", self.fd());

        match self.stream.write(&self.request) {
            Ok(n) if n == self.request.len() => {
                self.state = State::Reading;
                Step::AwaitResponse
            }
            Ok(n) => {
                debug!(
                    "Short write on fd {}: only sent {n} out of {} bytes",
                    self.fd(),
                    self.request.len()
                );
                Step::Done(Outcome::Failure(Failure::Write))
            }
            Err(err) => {
                debug!("Write error on fd {}: {err}", self.fd());
                Step::Done(Outcome::Failure(Failure::Write))
            }
        }
    }

    /// Drain the socket. EOF ends the exchange successfully; a read error fails it.
    fn read_response(&mut self, buf: &mut [u8]) -> Step {
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    trace!("Read eof on fd {} after {} bytes", self.fd(), self.received);
                    return Step::Done(Outcome::Success {
                        latency: self.started.elapsed(),
                    });
                }
                Ok(n) => {
                    trace!("Read {n} bytes on fd {}", self.fd());
                    self.received += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Step::Pending,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("Read error on fd {}: {err}", self.fd());
                    return Step::Done(Outcome::Failure(Failure::Read));
                }
            }
        }
    }

    /// The terminal transition: consumes the connection, closing its socket.
    pub fn finish(self, outcome: Outcome) -> Finished {
        Finished {
            target: self.target,
            outcome,
            bytes: self.received,
        }
    }
}
