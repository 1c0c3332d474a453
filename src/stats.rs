// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use std::fmt;
use std::time::Duration;

use crate::target::{Target, TargetId};

/// Why a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The peer refused or was unreachable.
    Connect,
    /// The request could not be written in full.
    Write,
    /// An I/O error while reading the response.
    Read,
    /// Error or hangup reported by the reactor with no data to read.
    Hangup,
    Timeout,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
            Self::Hangup => write!(f, "hangup"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The peer closed the stream after sending its response.
    Success { latency: Duration },
    Failure(Failure),
}

/// The result of a connection's terminal transition, produced exactly once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub target: Option<TargetId>,
    pub outcome: Outcome,
    /// Response bytes read over the connection's lifetime.
    pub bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounts {
    pub connect: u64,
    pub write: u64,
    pub read: u64,
    pub hangup: u64,
    pub timeout: u64,
}

impl FailureCounts {
    fn bump(&mut self, failure: Failure) {
        let counter = match failure {
            Failure::Connect => &mut self.connect,
            Failure::Write => &mut self.write,
            Failure::Read => &mut self.read,
            Failure::Hangup => &mut self.hangup,
            Failure::Timeout => &mut self.timeout,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.connect + self.write + self.read + self.hangup + self.timeout
    }
}

/// Global counters for a whole run, across all iterations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub attempts: u64,
    pub successes: u64,
    pub bytes: u64,
    /// Sum of the wall-clock duration of every completed batch.
    pub elapsed: Duration,
    pub iterations: u64,
    pub failures: FailureCounts,
}

impl RunStats {
    /// Account for one terminal transition, globally and against its target.
    pub fn record(&mut self, finished: &Finished, target: Option<&mut Target>) {
        self.attempts += 1;
        self.bytes += finished.bytes;

        match finished.outcome {
            Outcome::Success { latency } => {
                self.successes += 1;
                if let Some(target) = target {
                    target.attempts += 1;
                    target.successes += 1;
                    target.latency_ema =
                        update_ema(target.latency_ema, micros(latency), target.attempts);
                }
            }
            Outcome::Failure(failure) => {
                self.failures.bump(failure);
                if let Some(target) = target {
                    target.attempts += 1;
                }
            }
        }
    }

    pub fn add_iteration(&mut self, elapsed: Duration) {
        self.elapsed += elapsed;
        self.iterations += 1;
    }

    pub fn failed(&self) -> u64 {
        self.attempts - self.successes
    }
}

/// Fold `sample` into a running average. `attempts` already counts the sample, so the first
/// sample replaces the average outright and later ones get progressively less weight.
pub fn update_ema(ema: u64, sample: u64, attempts: u64) -> u64 {
    let alpha = 2.0 / (attempts as f64 + 1.0);
    let next = ema as f64 * (1.0 - alpha) + sample as f64 * alpha;
    next.round() as u64
}

pub fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(ms: u64, bytes: u64) -> Finished {
        Finished {
            target: None,
            outcome: Outcome::Success {
                latency: Duration::from_millis(ms),
            },
            bytes,
        }
    }

    fn failure(kind: Failure) -> Finished {
        Finished {
            target: None,
            outcome: Outcome::Failure(kind),
            bytes: 0,
        }
    }

    #[test]
    fn first_sample_sets_average() {
        assert_eq!(update_ema(0, 1500, 1), 1500);
    }

    #[test]
    fn constant_latency_converges() {
        let mut target = Target::new("a");
        let mut stats = RunStats::default();

        stats.record(&failure(Failure::Timeout), Some(&mut target));
        for _ in 0..50 {
            stats.record(&success(20, 0), Some(&mut target));
        }

        // within 1% of the constant latency
        let diff = target.latency_ema().abs_diff(20_000);
        assert!(diff <= 200, "ema {} too far from 20ms", target.latency_ema());
    }

    #[test]
    fn failures_leave_average_alone() {
        let mut target = Target::new("a");
        let mut stats = RunStats::default();

        stats.record(&success(4, 10), Some(&mut target));
        stats.record(&failure(Failure::Connect), Some(&mut target));
        stats.record(&failure(Failure::Timeout), Some(&mut target));

        assert_eq!(target.latency_ema(), 4000);
        assert_eq!(target.attempts(), 3);
        assert_eq!(target.successes(), 1);
        assert_eq!(target.failures(), 2);
    }

    #[test]
    fn newer_samples_weigh_less() {
        let mut target = Target::new("a");
        let mut stats = RunStats::default();

        stats.record(&success(10, 0), Some(&mut target));
        stats.record(&success(40, 0), Some(&mut target));
        // alpha = 2/3 on the second sample
        assert_eq!(target.latency_ema(), 30_000);

        stats.record(&success(30, 0), Some(&mut target));
        assert_eq!(target.latency_ema(), 30_000);
    }

    #[test]
    fn attempts_split_into_successes_and_failures() {
        let mut stats = RunStats::default();

        stats.record(&success(1, 100), None);
        stats.record(&success(1, 100), None);
        stats.record(&failure(Failure::Read), None);
        stats.record(&failure(Failure::Hangup), None);
        stats.record(&failure(Failure::Connect), None);

        assert_eq!(stats.attempts, 5);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.bytes, 200);
        assert_eq!(stats.attempts, stats.successes + stats.failures.total());
        assert_eq!(stats.failed(), stats.failures.total());
    }

    #[test]
    fn iterations_accumulate_elapsed() {
        let mut stats = RunStats::default();
        stats.add_iteration(Duration::from_millis(250));
        stats.add_iteration(Duration::from_millis(750));

        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.elapsed, Duration::from_secs(1));
    }
}
