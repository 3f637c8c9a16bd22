// crates/datatrail-core/tests/common/mod.rs
// ============================================================================
// Module: Engine Test Support
// Description: In-memory plugins and stores shared by the engine tests.
// ============================================================================
//! ## Overview
//! Test doubles for the plugin traits: a vector-backed source, a collecting
//! sink with observable flushes, simple transforms, a rule gate, and an
//! in-memory payload store for resume tests.

#![allow(
    dead_code,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-support code is exercised selectively per test binary."
)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use datatrail_core::ArtifactDescriptor;
use datatrail_core::DEFAULT_HASH_ALGORITHM;
use datatrail_core::Determinism;
use datatrail_core::GatePlugin;
use datatrail_core::GateRule;
use datatrail_core::OutputValidation;
use datatrail_core::PayloadError;
use datatrail_core::PayloadRef;
use datatrail_core::PayloadStore;
use datatrail_core::PipelineRow;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::RoutingMode;
use datatrail_core::SchemaContract;
use datatrail_core::SinkError;
use datatrail_core::SinkPlugin;
use datatrail_core::SourceError;
use datatrail_core::SourcePlugin;
use datatrail_core::SourceRow;
use datatrail_core::TransformPlugin;
use datatrail_core::TransformResult;
use datatrail_core::hash_bytes;
use serde_json::Map;
use serde_json::Value;

// ============================================================================
// SECTION: Payload Store
// ============================================================================

/// In-memory content-addressed payload store.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    /// Blobs keyed by content hash.
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl PayloadStore for MemoryPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<PayloadRef, PayloadError> {
        let reference = hash_bytes(DEFAULT_HASH_ALGORITHM, bytes).value;
        self.blobs
            .lock()
            .map_err(|_| PayloadError::Io("poisoned".to_string()))?
            .insert(reference.clone(), bytes.to_vec());
        Ok(PayloadRef::new(reference))
    }

    fn load(&self, reference: &PayloadRef) -> Result<Option<Vec<u8>>, PayloadError> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| PayloadError::Io("poisoned".to_string()))?
            .get(reference.as_str())
            .cloned())
    }

    fn delete(&self, reference: &PayloadRef) -> Result<(), PayloadError> {
        self.blobs
            .lock()
            .map_err(|_| PayloadError::Io("poisoned".to_string()))?
            .remove(reference.as_str());
        Ok(())
    }
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// Vector-backed source.
pub struct VecSource {
    /// Rows yielded in order.
    pub rows: Vec<SourceRow>,
    /// Declared contract.
    pub schema: SchemaContract,
    /// Success sink name.
    pub on_success: String,
    /// Quarantine destination.
    pub on_validation_failure: RouteTarget,
}

impl VecSource {
    /// Builds a source over valid object rows.
    pub fn of_valid(rows: Vec<Value>, on_success: &str) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|value| SourceRow::valid(value.as_object().cloned().unwrap()))
                .collect(),
            schema: SchemaContract::free(),
            on_success: on_success.to_string(),
            on_validation_failure: RouteTarget::Discard,
        }
    }
}

impl SourcePlugin for VecSource {
    fn name(&self) -> &str {
        "vec"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn on_success(&self) -> &str {
        &self.on_success
    }

    fn on_validation_failure(&self) -> &RouteTarget {
        &self.on_validation_failure
    }

    fn load(
        &mut self,
        _ctx: &PluginContext,
    ) -> Result<Box<dyn Iterator<Item = Result<SourceRow, SourceError>> + '_>, SourceError> {
        let rows = std::mem::take(&mut self.rows);
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}

// ============================================================================
// SECTION: Transforms
// ============================================================================

/// Transform that inserts a constant field.
pub struct StampTransform {
    /// Field name to insert.
    pub field: String,
    /// Value inserted.
    pub value: Value,
    /// Success sink name.
    pub on_success: String,
    /// Error route.
    pub on_error: RouteTarget,
    /// Free contract.
    pub schema: SchemaContract,
}

impl StampTransform {
    /// Builds a stamping transform.
    pub fn new(field: &str, value: Value, on_success: &str) -> Self {
        Self {
            field: field.to_string(),
            value,
            on_success: on_success.to_string(),
            on_error: RouteTarget::Discard,
            schema: SchemaContract::free(),
        }
    }
}

impl TransformPlugin for StampTransform {
    fn name(&self) -> &str {
        "stamp"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn transform_adds_fields(&self) -> bool {
        true
    }

    fn on_error(&self) -> &RouteTarget {
        &self.on_error
    }

    fn on_success(&self) -> &str {
        &self.on_success
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        let (mut data, _) = row.into_parts();
        data.insert(self.field.clone(), self.value.clone());
        TransformResult::success(data)
    }
}

/// Transform that fails rows matching a field value.
pub struct RejectTransform {
    /// Field inspected.
    pub field: String,
    /// Value that triggers rejection.
    pub reject_value: Value,
    /// Success sink name.
    pub on_success: String,
    /// Error route.
    pub on_error: RouteTarget,
    /// Free contract.
    pub schema: SchemaContract,
}

impl RejectTransform {
    /// Builds a rejecting transform routing errors to the given target.
    pub fn new(field: &str, reject_value: Value, on_success: &str, on_error: RouteTarget) -> Self {
        Self {
            field: field.to_string(),
            reject_value,
            on_success: on_success.to_string(),
            on_error,
            schema: SchemaContract::free(),
        }
    }
}

impl TransformPlugin for RejectTransform {
    fn name(&self) -> &str {
        "reject"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn on_error(&self) -> &RouteTarget {
        &self.on_error
    }

    fn on_success(&self) -> &str {
        &self.on_success
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        if row.get(&self.field) == Some(&self.reject_value) {
            return TransformResult::error(
                serde_json::json!({"error": "rejected", "field": self.field}),
                false,
            );
        }
        let (data, _) = row.into_parts();
        TransformResult::success(data)
    }
}

/// Batch transform that forwards buffered rows unchanged.
pub struct BatchEcho {
    /// Success sink name.
    pub on_success: String,
    /// Error route.
    pub on_error: RouteTarget,
    /// Free contract.
    pub schema: SchemaContract,
    /// Number of batch invocations observed.
    pub batches_seen: Arc<AtomicUsize>,
}

impl BatchEcho {
    /// Builds a batch echo transform.
    pub fn new(on_success: &str) -> Self {
        Self {
            on_success: on_success.to_string(),
            on_error: RouteTarget::Discard,
            schema: SchemaContract::free(),
            batches_seen: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl TransformPlugin for BatchEcho {
    fn name(&self) -> &str {
        "batch_echo"
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn on_error(&self) -> &RouteTarget {
        &self.on_error
    }

    fn on_success(&self) -> &str {
        &self.on_success
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        let (data, _) = row.into_parts();
        TransformResult::success(data)
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, _ctx: &PluginContext) -> TransformResult {
        self.batches_seen.fetch_add(1, Ordering::SeqCst);
        TransformResult::success_multi(rows.into_iter().map(|row| row.into_parts().0).collect())
    }
}

// ============================================================================
// SECTION: Gate
// ============================================================================

/// Declarative test gate.
pub struct TestGate {
    /// Gate name.
    pub gate_name: String,
    /// Declared rules.
    pub gate_rules: Vec<GateRule>,
    /// No-match destination.
    pub no_match: Option<RouteTarget>,
    /// Routing mode.
    pub mode: RoutingMode,
}

impl TestGate {
    /// Builds a single-rule gate.
    pub fn single(name: &str, label: &str, condition: &str, no_match: Option<&str>) -> Self {
        Self {
            gate_name: name.to_string(),
            gate_rules: vec![GateRule {
                edge_label: label.to_string(),
                condition: condition.to_string(),
            }],
            no_match: no_match.map(RouteTarget::parse),
            mode: RoutingMode::Move,
        }
    }
}

impl GatePlugin for TestGate {
    fn name(&self) -> &str {
        &self.gate_name
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn rules(&self) -> &[GateRule] {
        &self.gate_rules
    }

    fn on_no_match(&self) -> Option<&RouteTarget> {
        self.no_match.as_ref()
    }

    fn default_mode(&self) -> RoutingMode {
        self.mode
    }
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// Shared row buffer captured by a collecting sink.
pub type SinkBuffer = Arc<Mutex<Vec<Map<String, Value>>>>;

/// Sink that collects rows in memory and tracks flushes.
pub struct CollectingSink {
    /// Sink name.
    pub sink_name: String,
    /// Captured rows.
    pub rows: SinkBuffer,
    /// Captured contracts per write, for header assertions.
    pub contracts: Arc<Mutex<Vec<SchemaContract>>>,
    /// Whether flush has been observed.
    pub flushed: Arc<AtomicBool>,
    /// Whether flush fails (durability error injection).
    pub fail_flush: bool,
    /// Whether the sink declares resume support.
    pub resumable: bool,
    /// Free contract.
    pub schema: SchemaContract,
}

impl CollectingSink {
    /// Builds a collecting sink with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            sink_name: name.to_string(),
            rows: Arc::new(Mutex::new(Vec::new())),
            contracts: Arc::new(Mutex::new(Vec::new())),
            flushed: Arc::new(AtomicBool::new(false)),
            fail_flush: false,
            resumable: true,
            schema: SchemaContract::free(),
        }
    }

    /// Returns handles to the captured rows and flush flag.
    pub fn handles(&self) -> (SinkBuffer, Arc<AtomicBool>) {
        (Arc::clone(&self.rows), Arc::clone(&self.flushed))
    }
}

impl SinkPlugin for CollectingSink {
    fn name(&self) -> &str {
        &self.sink_name
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoWrite
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn supports_resume(&self) -> bool {
        self.resumable
    }

    fn write(
        &mut self,
        rows: &[PipelineRow],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, SinkError> {
        let mut buffer = self.rows.lock().map_err(|_| SinkError::Io("poisoned".to_string()))?;
        let mut contracts =
            self.contracts.lock().map_err(|_| SinkError::Io("poisoned".to_string()))?;
        for row in rows {
            buffer.push(row.data().clone());
            contracts.push(row.contract().clone());
        }
        let bytes = serde_json::to_vec(&*buffer).map_err(|err| SinkError::Io(err.to_string()))?;
        Ok(ArtifactDescriptor {
            path_or_uri: format!("memory://{}", self.sink_name),
            content_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes).value,
            size_bytes: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            artifact_type: "memory".to_string(),
            idempotency_key: None,
        })
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if self.fail_flush {
            return Err(SinkError::Durability("injected flush failure".to_string()));
        }
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn configure_for_resume(&mut self) -> Result<(), SinkError> {
        if self.resumable {
            Ok(())
        } else {
            Err(SinkError::Unsupported("resume".to_string()))
        }
    }

    fn validate_output_target(&self) -> Result<OutputValidation, SinkError> {
        Ok(OutputValidation { matches: true, reason: None })
    }
}

// ============================================================================
// SECTION: Gate Targets Helper
// ============================================================================

/// Builds a gate target map from label/target pairs.
pub fn targets(pairs: &[(&str, datatrail_core::StepTarget)]) -> BTreeMap<String, datatrail_core::StepTarget> {
    pairs.iter().map(|(label, target)| ((*label).to_string(), target.clone())).collect()
}
