// crates/datatrail-core/src/runtime/pipeline.rs
// ============================================================================
// Module: Datatrail Pipeline Configuration
// Description: Typed container wiring plugin instances into an execution graph.
// Purpose: Turn declared plugins into deterministic node ids, edges, and the
//          validation the orchestrator requires before a run may begin.
// Dependencies: crate::{core, interfaces, runtime}, serde_json
// ============================================================================

//! ## Overview
//! A pipeline is a source, an ordered chain of steps (transforms, gates,
//! aggregations, coalesces), and a set of named sinks. Node ids are derived
//! deterministically from step position and plugin name so identical
//! configurations produce identical topology across runs, which checkpoint
//! compatibility depends on. Construction fails closed: unknown sinks,
//! duplicate names, and uncompilable gate rules are
//! [`PluginInvariantViolation`]s and the run never begins.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::contract::SchemaContract;
use crate::core::identifiers::NodeId;
use crate::core::records::Determinism;
use crate::core::records::NodeType;
use crate::core::records::RoutingMode;
use crate::interfaces::GatePlugin;
use crate::interfaces::PluginInvariantViolation;
use crate::interfaces::RouteTarget;
use crate::interfaces::SinkPlugin;
use crate::interfaces::SourcePlugin;
use crate::interfaces::TransformPlugin;
use crate::runtime::aggregation::AggregationSettings;
use crate::runtime::aggregation::CoalesceSettings;
use crate::runtime::expression::CompiledExpression;
use crate::runtime::graph::ExecutionGraph;
use crate::runtime::graph::GraphError;
use crate::runtime::graph::NodeInfo;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Label of the linear continuation edge.
pub const CONTINUE_LABEL: &str = "continue";

/// Label of the edge taken when no gate rule matches.
pub const NO_MATCH_LABEL: &str = "no_match";

// ============================================================================
// SECTION: Steps
// ============================================================================

/// Where a gate edge leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTarget {
    /// The next step in the chain (or the success sink after the last step).
    Continue,
    /// A later step, by index into the step list.
    Step(usize),
    /// A named sink.
    Sink(String),
}

/// One step in the pipeline chain.
pub enum StepConfig {
    /// A single-row transform.
    Transform(Box<dyn TransformPlugin>),
    /// A gate with labeled targets for its rules.
    Gate {
        /// The gate plugin.
        plugin: Box<dyn GatePlugin>,
        /// Target per rule label; labels not listed continue to the next
        /// step.
        targets: BTreeMap<String, StepTarget>,
    },
    /// An aggregation node owning a batch-aware transform.
    Aggregation {
        /// The batch-aware transform executed at flush.
        transform: Box<dyn TransformPlugin>,
        /// Trigger and output-mode settings; `node_id` is assigned during
        /// graph construction.
        settings: AggregationSettings,
    },
    /// A coalesce join point.
    Coalesce {
        /// Join policy settings; `node_id` is assigned during graph
        /// construction.
        settings: CoalesceSettings,
    },
}

impl std::fmt::Debug for StepConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transform(plugin) => write!(f, "Transform({})", plugin.name()),
            Self::Gate { plugin, .. } => write!(f, "Gate({})", plugin.name()),
            Self::Aggregation { transform, .. } => {
                write!(f, "Aggregation({})", transform.name())
            }
            Self::Coalesce { settings } => write!(f, "Coalesce({})", settings.name),
        }
    }
}

// ============================================================================
// SECTION: Export Settings
// ============================================================================

/// Audit trail export configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    /// Export format label: "json" or "csv".
    pub format: String,
    /// Destination path: a file for JSON, a directory for CSV.
    pub path: std::path::PathBuf,
    /// Whether to sign the export with the environment key.
    pub sign: bool,
}

// ============================================================================
// SECTION: Pipeline Configuration
// ============================================================================

/// A fully wired pipeline ready for orchestration.
pub struct PipelineConfig {
    /// Pipeline name used in run settings.
    pub pipeline_name: String,
    /// The single source.
    pub source: Box<dyn SourcePlugin>,
    /// Ordered processing steps.
    pub steps: Vec<StepConfig>,
    /// Named sinks.
    pub sinks: Vec<Box<dyn SinkPlugin>>,
    /// Raw settings blob recorded on the run.
    pub settings: Value,
    /// Create a checkpoint every N rows, when set.
    pub checkpoint_every_rows: Option<u64>,
    /// Export configuration, when exporting is requested.
    pub export: Option<ExportSettings>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("pipeline_name", &self.pipeline_name)
            .field("steps", &self.steps.len())
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

/// Deterministic node id for the source.
#[must_use]
pub fn source_node_id(name: &str) -> NodeId {
    NodeId::new(format!("source_{name}"))
}

/// Deterministic node id for a step.
#[must_use]
pub fn step_node_id(kind: &str, index: usize, name: &str) -> NodeId {
    NodeId::new(format!("{kind}_{index:02}_{name}"))
}

/// Deterministic node id for a sink.
#[must_use]
pub fn sink_node_id(name: &str) -> NodeId {
    NodeId::new(format!("sink_{name}"))
}

/// Compiled gate ready for evaluation.
#[derive(Debug)]
pub struct CompiledGate {
    /// Rules as (edge label, compiled condition) in declared order.
    pub rules: Vec<(String, CompiledExpression)>,
    /// Destination when no rule matches.
    pub on_no_match: Option<RouteTarget>,
    /// Routing mode applied to chosen edges.
    pub default_mode: RoutingMode,
}

/// Everything the orchestrator derives from a pipeline configuration.
pub struct PreparedPipeline {
    /// Pipeline name used in run settings.
    pub pipeline_name: String,
    /// The single source.
    pub source: Box<dyn SourcePlugin>,
    /// Raw settings blob recorded on the run.
    pub settings: Value,
    /// Create a checkpoint every N rows, when set.
    pub checkpoint_every_rows: Option<u64>,
    /// Export configuration, when exporting is requested.
    pub export: Option<ExportSettings>,
    /// The validated execution graph.
    pub graph: ExecutionGraph,
    /// Source node id.
    pub source_node: NodeId,
    /// First processing node after the source.
    pub entry_node: NodeId,
    /// Transforms keyed by node id (aggregation batch transforms included).
    pub transforms: BTreeMap<NodeId, Box<dyn TransformPlugin>>,
    /// Compiled gates keyed by node id.
    pub gates: BTreeMap<NodeId, CompiledGate>,
    /// Aggregation settings with node ids assigned.
    pub aggregations: Vec<AggregationSettings>,
    /// Coalesce settings with node ids assigned.
    pub coalesces: Vec<CoalesceSettings>,
    /// Sinks keyed by sink name, with their node ids.
    pub sinks: BTreeMap<String, (NodeId, Box<dyn SinkPlugin>)>,
}

impl PipelineConfig {
    /// Builds and validates the execution graph from the plugin instances.
    ///
    /// Each transform's computed output schema is extracted into its
    /// [`NodeInfo`] so edge validation sees computed, not raw, guarantees.
    ///
    /// # Errors
    ///
    /// Returns [`PluginInvariantViolation`] for contract violations and
    /// [`GraphError`] wrapped inside it for structural failures.
    #[expect(clippy::too_many_lines, reason = "Single construction pass over the declared pipeline.")]
    pub fn prepare(self) -> Result<PreparedPipeline, PreparationError> {
        let mut graph = ExecutionGraph::new();
        let mut transforms: BTreeMap<NodeId, Box<dyn TransformPlugin>> = BTreeMap::new();
        let mut gates: BTreeMap<NodeId, CompiledGate> = BTreeMap::new();
        let mut aggregations = Vec::new();
        let mut coalesces = Vec::new();
        let mut sinks: BTreeMap<String, (NodeId, Box<dyn SinkPlugin>)> = BTreeMap::new();

        // Sinks first so route targets can be resolved.
        for sink in self.sinks {
            let name = sink.name().to_string();
            if name.is_empty() {
                return Err(PluginInvariantViolation::EmptyAttribute {
                    plugin: "sink".to_string(),
                    attribute: "name",
                }
                .into());
            }
            let node_id = sink_node_id(&name);
            if sinks.contains_key(&name) {
                return Err(PluginInvariantViolation::DuplicateName(name).into());
            }
            graph.add_node(NodeInfo {
                node_id: node_id.clone(),
                node_type: NodeType::Sink,
                plugin_name: name.clone(),
                plugin_version: sink.plugin_version().to_string(),
                determinism: sink.determinism(),
                config: serde_json::json!({ "sink": name }),
                input_schema: Some(sink.input_schema().clone()),
                output_schema: None,
            })?;
            sinks.insert(name, (node_id, sink));
        }

        let source_node = source_node_id(self.source.name());
        graph.add_node(NodeInfo {
            node_id: source_node.clone(),
            node_type: NodeType::Source,
            plugin_name: self.source.name().to_string(),
            plugin_version: self.source.plugin_version().to_string(),
            determinism: self.source.determinism(),
            config: serde_json::json!({ "source": self.source.name() }),
            input_schema: None,
            output_schema: Some(self.source.output_schema().clone()),
        })?;

        // Materialize step nodes with deterministic ids.
        let mut step_nodes: Vec<NodeId> = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let node_id = match step {
                StepConfig::Transform(plugin) => {
                    step_node_id("transform", index, plugin.name())
                }
                StepConfig::Gate { plugin, .. } => step_node_id("gate", index, plugin.name()),
                StepConfig::Aggregation { settings, .. } => {
                    step_node_id("aggregation", index, &settings.name)
                }
                StepConfig::Coalesce { settings } => {
                    step_node_id("coalesce", index, &settings.name)
                }
            };
            step_nodes.push(node_id);
        }

        let success_sink = self.source.on_success().to_string();
        if !sinks.contains_key(&success_sink) {
            return Err(PluginInvariantViolation::UnknownSink {
                plugin: self.source.name().to_string(),
                sink: success_sink,
            }
            .into());
        }

        // Resolve a step target into a node id.
        let resolve = |target: &StepTarget,
                       index: usize,
                       owner: &str,
                       step_nodes: &[NodeId],
                       sinks: &BTreeMap<String, (NodeId, Box<dyn SinkPlugin>)>|
         -> Result<NodeId, PreparationError> {
            match target {
                StepTarget::Continue => Ok(step_nodes
                    .get(index + 1)
                    .cloned()
                    .unwrap_or_else(|| sink_node_id(&success_sink))),
                StepTarget::Step(step_index) => step_nodes
                    .get(*step_index)
                    .cloned()
                    .ok_or_else(|| {
                        PluginInvariantViolation::EmptyAttribute {
                            plugin: owner.to_string(),
                            attribute: "target step",
                        }
                        .into()
                    }),
                StepTarget::Sink(name) => sinks
                    .get(name)
                    .map(|(node_id, _)| node_id.clone())
                    .ok_or_else(|| {
                        PluginInvariantViolation::UnknownSink {
                            plugin: owner.to_string(),
                            sink: name.clone(),
                        }
                        .into()
                    }),
            }
        };

        for (index, step) in self.steps.into_iter().enumerate() {
            let node_id = step_nodes[index].clone();
            match step {
                StepConfig::Transform(plugin) => {
                    validate_route_target(plugin.name(), plugin.on_error(), &sinks)?;
                    graph.add_node(NodeInfo {
                        node_id: node_id.clone(),
                        node_type: NodeType::Transform,
                        plugin_name: plugin.name().to_string(),
                        plugin_version: plugin.plugin_version().to_string(),
                        determinism: plugin.determinism(),
                        config: plugin_config(plugin.name(), plugin.plugin_version()),
                        input_schema: Some(plugin.input_schema().clone()),
                        output_schema: Some(plugin.output_schema().clone()),
                    })?;
                    let next = resolve(
                        &StepTarget::Continue,
                        index,
                        plugin.name(),
                        &step_nodes,
                        &sinks,
                    )?;
                    graph.add_edge(&node_id, &next, CONTINUE_LABEL, RoutingMode::Move)?;
                    transforms.insert(node_id, plugin);
                }
                StepConfig::Gate { plugin, targets } => {
                    let mut compiled_rules = Vec::new();
                    for rule in plugin.rules() {
                        let condition =
                            CompiledExpression::compile(&rule.condition).map_err(|err| {
                                PluginInvariantViolation::InvalidGateRule {
                                    gate: plugin.name().to_string(),
                                    label: rule.edge_label.clone(),
                                    reason: err.to_string(),
                                }
                            })?;
                        compiled_rules.push((rule.edge_label.clone(), condition));
                    }
                    graph.add_node(NodeInfo {
                        node_id: node_id.clone(),
                        node_type: NodeType::Gate,
                        plugin_name: plugin.name().to_string(),
                        plugin_version: plugin.plugin_version().to_string(),
                        determinism: plugin.determinism(),
                        config: plugin_config(plugin.name(), plugin.plugin_version()),
                        input_schema: None,
                        output_schema: None,
                    })?;
                    for (label, _) in &compiled_rules {
                        let target = targets.get(label).unwrap_or(&StepTarget::Continue);
                        let to = resolve(target, index, plugin.name(), &step_nodes, &sinks)?;
                        graph.add_edge(&node_id, &to, label, plugin.default_mode())?;
                    }
                    let on_no_match = plugin.on_no_match().cloned();
                    if let Some(RouteTarget::Sink(sink_name)) = &on_no_match {
                        let to = resolve(
                            &StepTarget::Sink(sink_name.clone()),
                            index,
                            plugin.name(),
                            &step_nodes,
                            &sinks,
                        )?;
                        graph.add_edge(&node_id, &to, NO_MATCH_LABEL, RoutingMode::Move)?;
                    }
                    gates.insert(
                        node_id,
                        CompiledGate {
                            rules: compiled_rules,
                            on_no_match,
                            default_mode: plugin.default_mode(),
                        },
                    );
                }
                StepConfig::Aggregation { transform, mut settings } => {
                    validate_route_target(transform.name(), transform.on_error(), &sinks)?;
                    if !transform.is_batch_aware() {
                        return Err(PluginInvariantViolation::NotBatchAware(
                            transform.name().to_string(),
                        )
                        .into());
                    }
                    settings.node_id = node_id.clone();
                    graph.add_node(NodeInfo {
                        node_id: node_id.clone(),
                        node_type: NodeType::Aggregation,
                        plugin_name: transform.name().to_string(),
                        plugin_version: transform.plugin_version().to_string(),
                        determinism: transform.determinism(),
                        config: serde_json::json!({
                            "aggregation": settings.name,
                            "count_trigger": settings.count_trigger,
                            "timeout_ms": settings.timeout_ms,
                            "output_mode": settings.output_mode,
                        }),
                        input_schema: Some(transform.input_schema().clone()),
                        output_schema: Some(transform.output_schema().clone()),
                    })?;
                    let next = resolve(
                        &StepTarget::Continue,
                        index,
                        transform.name(),
                        &step_nodes,
                        &sinks,
                    )?;
                    graph.add_edge(&node_id, &next, CONTINUE_LABEL, RoutingMode::Move)?;
                    transforms.insert(node_id.clone(), transform);
                    aggregations.push(settings);
                }
                StepConfig::Coalesce { mut settings } => {
                    settings.node_id = node_id.clone();
                    graph.add_node(NodeInfo {
                        node_id: node_id.clone(),
                        node_type: NodeType::Coalesce,
                        plugin_name: settings.name.clone(),
                        plugin_version: "1.0.0".to_string(),
                        determinism: Determinism::Deterministic,
                        config: serde_json::json!({
                            "coalesce": settings.name,
                            "expected_branches": settings.expected_branches,
                            "policy": settings.policy,
                            "merge": settings.merge,
                        }),
                        input_schema: None,
                        output_schema: None,
                    })?;
                    let next = resolve(
                        &StepTarget::Continue,
                        index,
                        &settings.name.clone(),
                        &step_nodes,
                        &sinks,
                    )?;
                    graph.add_edge(&node_id, &next, CONTINUE_LABEL, RoutingMode::Move)?;
                    coalesces.push(settings);
                }
            }
        }

        // Wire the source into the chain (or straight to its sink).
        let entry_node = step_nodes
            .first()
            .cloned()
            .unwrap_or_else(|| sink_node_id(&success_sink));
        graph.add_edge(&source_node, &entry_node, CONTINUE_LABEL, RoutingMode::Move)?;

        // Quarantine route, when it names a sink, is an edge too.
        if let RouteTarget::Sink(quarantine) = self.source.on_validation_failure() {
            if !sinks.contains_key(quarantine) {
                return Err(PluginInvariantViolation::UnknownSink {
                    plugin: self.source.name().to_string(),
                    sink: quarantine.clone(),
                }
                .into());
            }
            graph.add_edge(
                &source_node,
                &sink_node_id(quarantine),
                "quarantine",
                RoutingMode::Move,
            )?;
        }

        graph.topological_order()?;
        graph.validate_edge_compatibility()?;

        Ok(PreparedPipeline {
            pipeline_name: self.pipeline_name,
            source: self.source,
            settings: self.settings,
            checkpoint_every_rows: self.checkpoint_every_rows,
            export: self.export,
            graph,
            source_node,
            entry_node,
            transforms,
            gates,
            aggregations,
            coalesces,
            sinks,
        })
    }
}

/// Minimal node config blob for transforms and gates.
fn plugin_config(name: &str, version: &str) -> Value {
    serde_json::json!({ "plugin": name, "version": version })
}

/// Validates that a route target, when it names a sink, is configured.
fn validate_route_target(
    plugin: &str,
    target: &RouteTarget,
    sinks: &BTreeMap<String, (NodeId, Box<dyn SinkPlugin>)>,
) -> Result<(), PreparationError> {
    if let RouteTarget::Sink(sink) = target
        && !sinks.contains_key(sink)
    {
        return Err(PluginInvariantViolation::UnknownSink {
            plugin: plugin.to_string(),
            sink: sink.clone(),
        }
        .into());
    }
    Ok(())
}

/// Errors raised while preparing a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PreparationError {
    /// A plugin violated its contract.
    #[error(transparent)]
    Plugin(#[from] PluginInvariantViolation),
    /// The graph was structurally invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Declared schema fields serialized for node registration.
#[must_use]
pub fn schema_fields_json(schema: &SchemaContract) -> Option<String> {
    if schema.fields.is_empty() {
        return None;
    }
    serde_json::to_string(&schema.fields).ok()
}
