// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use log::*;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::error::Error;

/// Index of a [`Target`] within its registry. Stable for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(usize);

impl TargetId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }
}

/// One request path and its accumulated per-target statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    path: String,
    pub(crate) latency_ema: u64,
    pub(crate) attempts: u64,
    pub(crate) successes: u64,
}

impl Target {
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize(path).to_owned(),
            latency_ema: 0,
            attempts: 0,
            successes: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Moving average of successful request latency, in microseconds.
    pub fn latency_ema(&self) -> u64 {
        self.latency_ema
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.attempts - self.successes
    }
}

#[derive(Debug)]
enum Kind {
    /// The same path for every connection, statistics are global only.
    Single { path: String, count: usize },
    /// One connection per loaded target per iteration.
    List(Vec<Target>),
}

/// The ordered set of request targets for a run.
#[derive(Debug)]
pub struct TargetRegistry {
    kind: Kind,
}

impl TargetRegistry {
    pub fn single(path: &str, count: usize) -> Self {
        Self {
            kind: Kind::Single {
                path: normalize(path).to_owned(),
                count,
            },
        }
    }

    /// Load one target per line of `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or yields no targets. Callers are expected to fall back
    /// to [`TargetRegistry::single`] in that case.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|source| Error::ReadTargets {
            path: path.to_owned(),
            source,
        })?;

        let targets = parse_targets(BufReader::new(file)).map_err(|source| Error::ReadTargets {
            path: path.to_owned(),
            source,
        })?;

        if targets.is_empty() {
            return Err(Error::NoTargets {
                path: path.to_owned(),
            });
        }

        debug!("Loaded {} targets from {}", targets.len(), path.display());

        Ok(Self {
            kind: Kind::List(targets),
        })
    }

    /// Number of connections launched per iteration.
    pub fn batch_size(&self) -> usize {
        match &self.kind {
            Kind::Single { count, .. } => *count,
            Kind::List(targets) => targets.len(),
        }
    }

    /// The connections to launch for one iteration, in order: the target each one accounts to
    /// (if any) and the path it requests.
    pub fn launch_plan(&self) -> Vec<(Option<TargetId>, &str)> {
        match &self.kind {
            Kind::Single { path, count } => vec![(None, path.as_str()); *count],
            Kind::List(targets) => targets
                .iter()
                .enumerate()
                .map(|(i, t)| (Some(TargetId::new(i)), t.path()))
                .collect(),
        }
    }

    /// Per-target accumulators. Empty in single-path mode.
    pub fn targets(&self) -> &[Target] {
        match &self.kind {
            Kind::Single { .. } => &[],
            Kind::List(targets) => targets,
        }
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        match &mut self.kind {
            Kind::Single { .. } => None,
            Kind::List(targets) => targets.get_mut(id.0),
        }
    }
}

/// Read targets one per line, skipping blank lines and `#` comments.
pub fn parse_targets(reader: impl BufRead) -> io::Result<Vec<Target>> {
    let mut targets = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        targets.push(Target::new(line));
    }

    Ok(targets)
}

fn normalize(path: &str) -> &str {
    path.trim().trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Cursor, Write};

    #[test]
    fn skips_comments_and_blank_lines() {
        let input = "a\n# comment\n  \nb\n";
        let targets = parse_targets(Cursor::new(input)).unwrap();

        let paths: Vec<&str> = targets.iter().map(Target::path).collect();
        assert_eq!(paths, ["a", "b"]);
    }

    #[test]
    fn trims_whitespace_and_leading_slash() {
        let targets = parse_targets(Cursor::new("  /index.html \t\n\t#x\nimg/logo.png\n")).unwrap();

        let paths: Vec<&str> = targets.iter().map(Target::path).collect();
        assert_eq!(paths, ["index.html", "img/logo.png"]);
    }

    #[test]
    fn loads_file_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a\n# comment\n  \nb").unwrap();

        let registry = TargetRegistry::from_file(file.path()).unwrap();

        assert_eq!(registry.batch_size(), 2);
        let plan = registry.launch_plan();
        assert_eq!(plan, [(Some(TargetId(0)), "a"), (Some(TargetId(1)), "b")]);
        assert!(registry.targets().iter().all(|t| t.attempts() == 0));
    }

    #[test]
    fn empty_file_has_no_targets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# only a comment\n\n").unwrap();

        let err = TargetRegistry::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::NoTargets { .. }));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TargetRegistry::from_file(&dir.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, Error::ReadTargets { .. }));
    }

    #[test]
    fn single_path_repeats_without_accumulators() {
        let mut registry = TargetRegistry::single("/status", 3);

        assert_eq!(registry.batch_size(), 3);
        assert_eq!(registry.launch_plan(), [(None, "status"); 3]);
        assert!(registry.targets().is_empty());
        assert!(registry.get_mut(TargetId(0)).is_none());
    }
}
