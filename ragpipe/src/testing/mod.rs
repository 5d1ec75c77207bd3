//! Testing utilities for ragpipe pipelines.
//!
//! This module provides:
//! - In-memory collaborators with call counters and failure injection
//! - Assertions over execution reports

mod assertions;
mod mocks;

pub use assertions::{
    assert_all_terminal, assert_node_failed, assert_node_output, assert_node_skipped,
    assert_node_status, assert_node_succeeded,
};
pub use mocks::{
    EchoLlm, FailurePlan, HashEmbedder, InMemoryRetriever, ReversingReranker, StaticLoader,
};
