// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no targets found in '{}'", path.display())]
    NoTargets { path: PathBuf },

    #[error("failed to read targets from '{}': {source}", path.display())]
    ReadTargets {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("host '{host}' resolved to no addresses")]
    Unresolved { host: String },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        reason: &'static str,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
