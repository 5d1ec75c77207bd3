//! Test assertions for execution reports.

use crate::scheduler::{ExecutionReport, NodeStatus};
use serde_json::Value;

/// Asserts that a node ended with the expected status.
pub fn assert_node_status(report: &ExecutionReport, node_id: &str, expected: NodeStatus) {
    let actual = report.status(node_id);
    assert_eq!(
        actual,
        Some(expected),
        "Expected node '{node_id}' to be {expected}, got {actual:?}"
    );
}

/// Asserts that a node succeeded.
pub fn assert_node_succeeded(report: &ExecutionReport, node_id: &str) {
    assert_node_status(report, node_id, NodeStatus::Succeeded);
}

/// Asserts that a node failed.
pub fn assert_node_failed(report: &ExecutionReport, node_id: &str) {
    assert_node_status(report, node_id, NodeStatus::Failed);
}

/// Asserts that a node was skipped.
pub fn assert_node_skipped(report: &ExecutionReport, node_id: &str) {
    assert_node_status(report, node_id, NodeStatus::Skipped);
}

/// Asserts that a node produced the expected output.
pub fn assert_node_output(report: &ExecutionReport, node_id: &str, expected: &Value) {
    let actual = report.output(node_id);
    assert_eq!(
        actual,
        Some(expected),
        "Expected output {expected} for node '{node_id}', got {actual:?}"
    );
}

/// Asserts that every node in the report reached a terminal state.
pub fn assert_all_terminal(report: &ExecutionReport) {
    for (id, outcome) in &report.outcomes {
        assert!(
            outcome.status.is_terminal(),
            "Node '{id}' ended in non-terminal state {}",
            outcome.status
        );
    }
}
