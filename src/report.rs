// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use std::fmt;
use std::time::Duration;

use crate::stats::RunStats;
use crate::target::Target;

/// The end-of-run summary, derived from the accumulated statistics.
#[derive(Debug)]
pub struct Report<'a> {
    stats: &'a RunStats,
    /// Connections launched per iteration.
    batch_size: usize,
    targets: &'a [Target],
}

impl<'a> Report<'a> {
    /// Pass an empty `targets` to leave out the per-target table.
    pub fn new(stats: &'a RunStats, batch_size: usize, targets: &'a [Target]) -> Self {
        Self {
            stats,
            batch_size,
            targets,
        }
    }

    pub fn success_rate(&self) -> f64 {
        ratio(self.stats.successes as f64, self.stats.attempts as f64)
    }

    /// Batch time spent per successful connection.
    pub fn avg_latency(&self) -> Duration {
        match self.stats.successes {
            0 => Duration::ZERO,
            n => Duration::from_secs_f64(self.stats.elapsed.as_secs_f64() / n as f64),
        }
    }

    pub fn connections_per_sec(&self) -> f64 {
        ratio(
            self.stats.successes as f64,
            self.stats.elapsed.as_secs_f64(),
        )
    }

    pub fn bits_per_sec(&self) -> f64 {
        ratio(self.stats.bytes as f64, self.stats.elapsed.as_secs_f64()) * 8.0
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

/// Bytes with binary prefixes, e.g. `1.50 KiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// A bit rate with decimal prefixes, e.g. `12.00 Mbit/s`.
pub fn human_rate(bits_per_sec: f64) -> String {
    const UNITS: [&str; 5] = ["bit/s", "Kbit/s", "Mbit/s", "Gbit/s", "Tbit/s"];

    let mut value = bits_per_sec;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stats = self.stats;
        let failures = &stats.failures;

        writeln!(f, "Targets:          {} per iteration", self.batch_size)?;
        writeln!(f, "Iterations:       {}", stats.iterations)?;
        writeln!(f, "Attempts:         {}", stats.attempts)?;
        writeln!(
            f,
            "Succeeded:        {} ({:.2}%)",
            stats.successes,
            self.success_rate() * 100.0
        )?;
        writeln!(
            f,
            "Failed:           {} (connect {}, write {}, read {}, hangup {}, timeout {})",
            stats.failed(),
            failures.connect,
            failures.write,
            failures.read,
            failures.hangup,
            failures.timeout
        )?;
        writeln!(f, "Transferred:      {}", human_bytes(stats.bytes))?;
        writeln!(f, "Elapsed:          {:.3} ms", millis(stats.elapsed))?;
        writeln!(
            f,
            "Average latency:  {:.3} ms",
            millis(self.avg_latency())
        )?;
        writeln!(f, "Connections/sec:  {:.2}", self.connections_per_sec())?;
        write!(f, "Bit rate:         {}", human_rate(self.bits_per_sec()))?;

        if self.targets.is_empty() {
            return Ok(());
        }

        let width = self
            .targets
            .iter()
            .map(|t| t.path().len() + 1)
            .max()
            .unwrap_or(0)
            .max(4);

        writeln!(f)?;
        writeln!(f)?;
        write!(
            f,
            "{:<width$}  {:>12}  {:>9}  {:>9}",
            "Path", "Latency (ms)", "Succeeded", "Failed"
        )?;
        for target in self.targets {
            writeln!(f)?;
            write!(
                f,
                "{:<width$}  {:>12.3}  {:>9}  {:>9}",
                format!("/{}", target.path()),
                target.latency_ema() as f64 / 1000.0,
                target.successes(),
                target.failures()
            )?;
        }

        Ok(())
    }
}
