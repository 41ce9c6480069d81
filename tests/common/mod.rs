//! Common test utilities and fixtures for kgraph-engine integration tests
//!
//! This module provides:
//! - `TestRepo` builder for temporary workspaces
//! - `SyncedRepo`, a workspace already reconciled into an in-memory graph

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod test_repo;

pub use test_repo::{SyncedRepo, TestRepo};
