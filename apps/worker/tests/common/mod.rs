//! Common test utilities for worker integration tests
//!
//! This module provides shared test infrastructure for integration tests:
//! an in-memory harness wiring queue, limiter, scan handler and worker loop,
//! payload builders, and an optional Postgres pool.

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod db;
pub mod fixtures;

pub use db::*;
pub use fixtures::*;
