// crates/datatrail-core/src/runtime/call_recorder.rs
// ============================================================================
// Module: Datatrail Call Recorder
// Description: Landscape-backed call recorder handed to plugins.
// Purpose: Give plugins a narrow append-only API for external call records.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Plugins never touch the Landscape directly. The engine installs this
//! recorder on the [`crate::interfaces::PluginContext`], scoped to the node
//! state or operation currently being processed, so every external call a
//! plugin makes lands in the audit trail under the right parent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use crate::core::identifiers::CallId;
use crate::core::records::CallParent;
use crate::interfaces::CallRecorder;
use crate::interfaces::CallSpec;
use crate::interfaces::Landscape;
use crate::interfaces::PluginContextError;

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// Call recorder writing through to a Landscape store.
pub struct LandscapeCallRecorder {
    /// Backing store.
    landscape: Arc<dyn Landscape>,
}

impl LandscapeCallRecorder {
    /// Creates a recorder over the given store.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self { landscape }
    }
}

impl CallRecorder for LandscapeCallRecorder {
    fn record_call(
        &self,
        parent: &CallParent,
        spec: CallSpec,
    ) -> Result<CallId, PluginContextError> {
        self.landscape
            .record_call(parent, spec)
            .map(|call| call.call_id)
            .map_err(|err| PluginContextError::Store(err.to_string()))
    }
}
