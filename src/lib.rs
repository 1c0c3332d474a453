// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

//! Batches of concurrent, non-blocking HTTP GET requests against one server, with latency and
//! throughput accounting per batch and per target.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod limits;
pub mod reactor;
pub mod report;
pub mod stats;
pub mod target;
