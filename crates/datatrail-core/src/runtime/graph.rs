// crates/datatrail-core/src/runtime/graph.rs
// ============================================================================
// Module: Datatrail Execution Graph
// Description: Labeled multi-digraph of pipeline nodes with topology hashing.
// Purpose: Validate pipeline shape and produce canonical topology digests for
//          checkpoint compatibility.
// Dependencies: crate::core, serde, serde_json
// ============================================================================

//! ## Overview
//! The execution graph is a labeled multi-digraph keyed by node id. Parallel
//! edges between the same node pair are distinct when their labels differ and
//! are topology-significant: they hash distinctly. Edge compatibility walks
//! upstream through schema-less nodes (gates in particular) until a node with
//! an output schema is found, so gate hops never hide a missing field.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::contract::SchemaContract;
use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashError;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::NodeId;
use crate::core::records::Determinism;
use crate::core::records::NodeType;
use crate::core::records::RoutingMode;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while building or validating the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node id was added twice.
    #[error("duplicate node '{0}'")]
    DuplicateNode(NodeId),
    /// An edge reused a label already present on the same source node.
    #[error("duplicate edge label '{label}' on node '{from}'")]
    DuplicateEdgeLabel {
        /// Source node of the edge.
        from: NodeId,
        /// Reused label.
        label: String,
    },
    /// An edge referenced a node that is not in the graph.
    #[error("edge references unknown node '{0}'")]
    UnknownNode(NodeId),
    /// The graph contains a cycle.
    #[error("graph contains a cycle through node '{0}'")]
    Cycle(NodeId),
    /// A downstream node requires fields its upstream cannot guarantee.
    #[error(
        "edge '{from}' -> '{to}' ({label}) is incompatible: missing required fields {missing:?}"
    )]
    IncompatibleEdge {
        /// Source node of the edge.
        from: NodeId,
        /// Destination node of the edge.
        to: NodeId,
        /// Edge label.
        label: String,
        /// Required fields the upstream cannot guarantee.
        missing: Vec<String>,
    },
    /// Canonicalization failure while hashing topology.
    #[error(transparent)]
    Hash(#[from] HashError),
}

// ============================================================================
// SECTION: Graph Types
// ============================================================================

/// A node registered in the graph.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node identifier.
    pub node_id: NodeId,
    /// Node kind.
    pub node_type: NodeType,
    /// Plugin name.
    pub plugin_name: String,
    /// Plugin version string.
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Node configuration.
    pub config: Value,
    /// Fields the node requires on its input rows.
    pub input_schema: Option<SchemaContract>,
    /// Computed output guarantees; absent for gates and other pass-through
    /// nodes.
    pub output_schema: Option<SchemaContract>,
}

/// A directed labeled edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// Source node.
    pub from: NodeId,
    /// Destination node.
    pub to: NodeId,
    /// Route label.
    pub label: String,
    /// Default routing mode.
    pub mode: RoutingMode,
}

/// Canonical node projection used in topology hashes.
#[derive(Debug, Serialize)]
struct TopologyNode {
    /// Node identifier.
    node_id: String,
    /// Node kind.
    node_type: NodeType,
    /// Plugin name.
    plugin_name: String,
    /// Canonical hash of the node configuration.
    config_hash: String,
}

/// Canonical edge projection used in topology hashes.
#[derive(Debug, Serialize)]
struct TopologyEdge {
    /// Source node.
    from: String,
    /// Destination node.
    to: String,
    /// Route label.
    label: String,
    /// Default routing mode.
    mode: RoutingMode,
}

/// Labeled multi-digraph of pipeline nodes.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    /// Nodes keyed by id.
    nodes: BTreeMap<NodeId, NodeInfo>,
    /// Edges in insertion order.
    edges: Vec<GraphEdge>,
}

impl ExecutionGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] when the id is already present.
    pub fn add_node(&mut self, node: NodeInfo) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(GraphError::DuplicateNode(node.node_id));
        }
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Adds an edge; labels are unique per source node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] when either endpoint is missing
    /// and [`GraphError::DuplicateEdgeLabel`] when the label is reused.
    pub fn add_edge(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        mode: RoutingMode,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(from) {
            return Err(GraphError::UnknownNode(from.clone()));
        }
        if !self.nodes.contains_key(to) {
            return Err(GraphError::UnknownNode(to.clone()));
        }
        if self.edges.iter().any(|edge| edge.from == *from && edge.label == label) {
            return Err(GraphError::DuplicateEdgeLabel { from: from.clone(), label: label.to_string() });
        }
        self.edges.push(GraphEdge {
            from: from.clone(),
            to: to.clone(),
            label: label.to_string(),
            mode,
        });
        Ok(())
    }

    /// Returns the node for an id.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    /// Returns all nodes keyed by id.
    #[must_use]
    pub const fn nodes(&self) -> &BTreeMap<NodeId, NodeInfo> {
        &self.nodes
    }

    /// Returns all edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Returns outgoing edges of a node in insertion order.
    #[must_use]
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|edge| edge.from == *node_id).collect()
    }

    /// Returns incoming edges of a node in insertion order.
    #[must_use]
    pub fn incoming(&self, node_id: &NodeId) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|edge| edge.to == *node_id).collect()
    }

    /// Returns the outgoing edge with the given label.
    #[must_use]
    pub fn outgoing_labeled(&self, node_id: &NodeId, label: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|edge| edge.from == *node_id && edge.label == label)
    }

    /// Returns a topological order of all nodes.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] when the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: BTreeMap<&NodeId, usize> =
            self.nodes.keys().map(|node_id| (node_id, 0)).collect();
        for edge in &self.edges {
            if let Some(count) = in_degree.get_mut(&edge.to) {
                *count += 1;
            }
        }
        let mut ready: VecDeque<&NodeId> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node_id, _)| *node_id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node_id) = ready.pop_front() {
            order.push(node_id.clone());
            for edge in self.edges.iter().filter(|edge| edge.from == *node_id) {
                if let Some(count) = in_degree.get_mut(&edge.to) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(&edge.to);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, count)| **count > 0)
                .map(|(node_id, _)| (*node_id).clone());
            return Err(GraphError::Cycle(stuck.unwrap_or_else(|| NodeId::new("unknown"))));
        }
        Ok(order)
    }

    /// Validates that every edge's upstream guarantees cover its downstream
    /// requirements.
    ///
    /// Guarantees for a node without its own output schema (gates in
    /// particular) are inherited by walking upstream until nodes with output
    /// schemas are found.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::IncompatibleEdge`] for the first edge whose
    /// required fields are not guaranteed.
    pub fn validate_edge_compatibility(&self) -> Result<(), GraphError> {
        for edge in &self.edges {
            let Some(to_node) = self.nodes.get(&edge.to) else {
                return Err(GraphError::UnknownNode(edge.to.clone()));
            };
            let Some(input_schema) = &to_node.input_schema else {
                continue;
            };
            let required: Vec<&str> = input_schema.required_fields();
            if required.is_empty() {
                continue;
            }
            let guaranteed = self.effective_guarantees(&edge.from);
            let missing: Vec<String> = required
                .iter()
                .filter(|field| !guaranteed.contains(**field))
                .map(|field| (*field).to_string())
                .collect();
            if !missing.is_empty() {
                return Err(GraphError::IncompatibleEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    label: edge.label.clone(),
                    missing,
                });
            }
        }
        Ok(())
    }

    /// Collects the effective guaranteed fields of a node: its own output
    /// schema when present, otherwise the guarantees inherited from upstream
    /// schema-bearing ancestors.
    fn effective_guarantees(&self, node_id: &NodeId) -> BTreeSet<String> {
        let mut guaranteed = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut pending = VecDeque::from([node_id.clone()]);
        while let Some(current) = pending.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if let Some(schema) = &node.output_schema {
                for field in schema.field_names() {
                    guaranteed.insert(field.to_string());
                }
                continue;
            }
            for edge in self.edges.iter().filter(|edge| edge.to == current) {
                pending.push_back(edge.from.clone());
            }
        }
        guaranteed
    }

    /// Computes the canonical hash of the subgraph reachable upward from a
    /// node, including the node itself.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] for an unregistered node or
    /// [`GraphError::Hash`] on canonicalization failure.
    pub fn compute_upstream_topology_hash(&self, node_id: &NodeId) -> Result<String, GraphError> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphError::UnknownNode(node_id.clone()));
        }
        let mut reachable = BTreeSet::new();
        let mut pending = VecDeque::from([node_id.clone()]);
        while let Some(current) = pending.pop_front() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            for edge in self.edges.iter().filter(|edge| edge.to == current) {
                pending.push_back(edge.from.clone());
            }
        }
        self.hash_subgraph(&reachable)
    }

    /// Computes the canonical hash of the entire graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Hash`] on canonicalization failure.
    pub fn compute_full_topology_hash(&self) -> Result<String, GraphError> {
        let all: BTreeSet<NodeId> = self.nodes.keys().cloned().collect();
        self.hash_subgraph(&all)
    }

    /// Computes the canonical hash of a node's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] for an unregistered node or
    /// [`GraphError::Hash`] on canonicalization failure.
    pub fn node_config_hash(&self, node_id: &NodeId) -> Result<String, GraphError> {
        let node =
            self.nodes.get(node_id).ok_or_else(|| GraphError::UnknownNode(node_id.clone()))?;
        Ok(hash_canonical_json(DEFAULT_HASH_ALGORITHM, &node.config)?.value)
    }

    /// Hashes the induced subgraph over the given node set.
    fn hash_subgraph(&self, node_ids: &BTreeSet<NodeId>) -> Result<String, GraphError> {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let Some(node) = self.nodes.get(node_id) else {
                continue;
            };
            nodes.push(TopologyNode {
                node_id: node.node_id.to_string(),
                node_type: node.node_type,
                plugin_name: node.plugin_name.clone(),
                config_hash: hash_canonical_json(DEFAULT_HASH_ALGORITHM, &node.config)?.value,
            });
        }
        let mut edges: Vec<TopologyEdge> = self
            .edges
            .iter()
            .filter(|edge| node_ids.contains(&edge.from) && node_ids.contains(&edge.to))
            .map(|edge| TopologyEdge {
                from: edge.from.to_string(),
                to: edge.to.to_string(),
                label: edge.label.clone(),
                mode: edge.mode,
            })
            .collect();
        edges.sort_by(|a, b| {
            (&a.from, &a.to, &a.label).cmp(&(&b.from, &b.to, &b.label))
        });
        let projection = serde_json::json!({
            "nodes": nodes
                .iter()
                .map(|node| {
                    serde_json::json!({
                        "node_id": node.node_id,
                        "node_type": node.node_type,
                        "plugin_name": node.plugin_name,
                        "config_hash": node.config_hash,
                    })
                })
                .collect::<Vec<Value>>(),
            "edges": edges
                .iter()
                .map(|edge| {
                    serde_json::json!({
                        "from": edge.from,
                        "to": edge.to,
                        "label": edge.label,
                        "mode": edge.mode,
                    })
                })
                .collect::<Vec<Value>>(),
        });
        Ok(hash_canonical_json(DEFAULT_HASH_ALGORITHM, &projection)?.value)
    }
}
