// crates/datatrail-core/tests/graph_topology.rs
// ============================================================================
// Module: Execution Graph Tests
// Description: Tests for graph construction, ordering, and topology hashing.
// ============================================================================
//! ## Overview
//! Validates structural invariants: label uniqueness, cycle rejection,
//! upstream-reachability hashing (parallel labels hash distinctly), and edge
//! schema compatibility through schema-less gates.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use datatrail_core::Determinism;
use datatrail_core::ExecutionGraph;
use datatrail_core::FieldContract;
use datatrail_core::FieldType;
use datatrail_core::NodeId;
use datatrail_core::NodeInfo;
use datatrail_core::NodeType;
use datatrail_core::RoutingMode;
use datatrail_core::SchemaContract;
use datatrail_core::SchemaMode;
use datatrail_core::runtime::GraphError;
use serde_json::json;

/// Builds a node with the given id, type, and optional schemas.
fn node(
    id: &str,
    node_type: NodeType,
    input: Option<SchemaContract>,
    output: Option<SchemaContract>,
) -> NodeInfo {
    NodeInfo {
        node_id: NodeId::new(id),
        node_type,
        plugin_name: id.to_string(),
        plugin_version: "1.0.0".to_string(),
        determinism: Determinism::Deterministic,
        config: json!({ "id": id }),
        input_schema: input,
        output_schema: output,
    }
}

/// Builds a strict contract with the given required field names.
fn schema(fields: &[&str]) -> SchemaContract {
    SchemaContract::declared(
        SchemaMode::Strict,
        fields
            .iter()
            .map(|name| FieldContract::declared(*name, FieldType::String, true))
            .collect(),
    )
}

// ============================================================================
// SECTION: Structure
// ============================================================================

/// Tests duplicate node ids are rejected.
#[test]
fn test_duplicate_node_rejected() {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("a", NodeType::Transform, None, None)).unwrap();
    assert!(matches!(
        graph.add_node(node("a", NodeType::Transform, None, None)),
        Err(GraphError::DuplicateNode(_))
    ));
}

/// Tests edge labels are unique per source node.
#[test]
fn test_duplicate_edge_label_rejected() {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("a", NodeType::Source, None, None)).unwrap();
    graph.add_node(node("b", NodeType::Sink, None, None)).unwrap();
    graph.add_edge(&NodeId::new("a"), &NodeId::new("b"), "continue", RoutingMode::Move).unwrap();
    assert!(matches!(
        graph.add_edge(&NodeId::new("a"), &NodeId::new("b"), "continue", RoutingMode::Move),
        Err(GraphError::DuplicateEdgeLabel { .. })
    ));
}

/// Tests topological order respects edges.
#[test]
fn test_topological_order() {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("sink", NodeType::Sink, None, None)).unwrap();
    graph.add_node(node("source", NodeType::Source, None, None)).unwrap();
    graph.add_node(node("mid", NodeType::Transform, None, None)).unwrap();
    graph.add_edge(&NodeId::new("source"), &NodeId::new("mid"), "continue", RoutingMode::Move).unwrap();
    graph.add_edge(&NodeId::new("mid"), &NodeId::new("sink"), "continue", RoutingMode::Move).unwrap();
    let order = graph.topological_order().unwrap();
    let position = |id: &str| order.iter().position(|node| node.as_str() == id).unwrap();
    assert!(position("source") < position("mid"));
    assert!(position("mid") < position("sink"));
}

/// Tests cycles are rejected.
#[test]
fn test_cycle_rejected() {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("a", NodeType::Transform, None, None)).unwrap();
    graph.add_node(node("b", NodeType::Transform, None, None)).unwrap();
    graph.add_edge(&NodeId::new("a"), &NodeId::new("b"), "forward", RoutingMode::Move).unwrap();
    graph.add_edge(&NodeId::new("b"), &NodeId::new("a"), "back", RoutingMode::Move).unwrap();
    assert!(matches!(graph.topological_order(), Err(GraphError::Cycle(_))));
}

// ============================================================================
// SECTION: Topology Hashing
// ============================================================================

/// Tests parallel edges with different labels hash distinctly: the hash with
/// one label present differs from the hash with both present.
#[test]
fn test_parallel_edge_labels_hash_distinctly() {
    let build = |labels: &[&str]| {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("from", NodeType::Gate, None, None)).unwrap();
        graph.add_node(node("to", NodeType::Sink, None, None)).unwrap();
        for label in labels {
            graph
                .add_edge(&NodeId::new("from"), &NodeId::new("to"), label, RoutingMode::Move)
                .unwrap();
        }
        graph.compute_upstream_topology_hash(&NodeId::new("to")).unwrap()
    };
    let one = build(&["match"]);
    let both = build(&["match", "no_match"]);
    assert_ne!(one, both);
}

/// Tests the upstream hash covers exactly the reverse-reachable subgraph.
#[test]
fn test_upstream_hash_ignores_downstream_changes() {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("source", NodeType::Source, None, None)).unwrap();
    graph.add_node(node("mid", NodeType::Transform, None, None)).unwrap();
    graph.add_node(node("sink", NodeType::Sink, None, None)).unwrap();
    graph.add_edge(&NodeId::new("source"), &NodeId::new("mid"), "continue", RoutingMode::Move).unwrap();
    graph.add_edge(&NodeId::new("mid"), &NodeId::new("sink"), "continue", RoutingMode::Move).unwrap();
    let before = graph.compute_upstream_topology_hash(&NodeId::new("mid")).unwrap();

    // Adding a node strictly downstream of mid must not change mid's
    // upstream hash, but must change the full topology hash.
    let full_before = graph.compute_full_topology_hash().unwrap();
    graph.add_node(node("extra_sink", NodeType::Sink, None, None)).unwrap();
    graph
        .add_edge(&NodeId::new("mid"), &NodeId::new("extra_sink"), "spur", RoutingMode::Move)
        .unwrap();
    let after = graph.compute_upstream_topology_hash(&NodeId::new("mid")).unwrap();
    let full_after = graph.compute_full_topology_hash().unwrap();
    assert_eq!(before, after);
    assert_ne!(full_before, full_after);
}

/// Tests config changes move the topology hash.
#[test]
fn test_config_change_moves_hash() {
    let build = |config: serde_json::Value| {
        let mut graph = ExecutionGraph::new();
        let mut info = node("only", NodeType::Transform, None, None);
        info.config = config;
        graph.add_node(info).unwrap();
        graph.compute_full_topology_hash().unwrap()
    };
    assert_ne!(build(json!({"limit": 1})), build(json!({"limit": 2})));
}

// ============================================================================
// SECTION: Edge Compatibility
// ============================================================================

/// Tests guarantees walk upstream through schema-less gates.
#[test]
fn test_compatibility_through_gate() {
    let mut graph = ExecutionGraph::new();
    graph
        .add_node(node("source", NodeType::Source, None, Some(schema(&["id", "status"]))))
        .unwrap();
    graph.add_node(node("gate", NodeType::Gate, None, None)).unwrap();
    graph.add_node(node("sink", NodeType::Sink, Some(schema(&["id"])), None)).unwrap();
    graph.add_edge(&NodeId::new("source"), &NodeId::new("gate"), "continue", RoutingMode::Move).unwrap();
    graph.add_edge(&NodeId::new("gate"), &NodeId::new("sink"), "match", RoutingMode::Move).unwrap();
    graph.validate_edge_compatibility().unwrap();
}

/// Tests a missing required field fails validation with the field named.
#[test]
fn test_incompatible_edge_reports_missing_fields() {
    let mut graph = ExecutionGraph::new();
    graph.add_node(node("source", NodeType::Source, None, Some(schema(&["id"])))).unwrap();
    graph
        .add_node(node("sink", NodeType::Sink, Some(schema(&["id", "score"])), None))
        .unwrap();
    graph.add_edge(&NodeId::new("source"), &NodeId::new("sink"), "continue", RoutingMode::Move).unwrap();
    match graph.validate_edge_compatibility() {
        Err(GraphError::IncompatibleEdge { missing, .. }) => {
            assert_eq!(missing, vec!["score".to_string()]);
        }
        other => panic!("expected incompatible edge, got {other:?}"),
    }
}
