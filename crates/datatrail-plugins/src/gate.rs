// crates/datatrail-plugins/src/gate.rs
// ============================================================================
// Module: Datatrail Rule Gate
// Description: Configuration-driven gate with ordered condition rules.
// Purpose: Declare labeled routes whose conditions the engine evaluates.
// Dependencies: datatrail-core, serde
// ============================================================================

//! ## Overview
//! The rule gate is pure declaration: an ordered list of (edge label,
//! condition) rules, an optional no-match destination, and a default routing
//! mode. The engine, not the gate, compiles and evaluates the conditions
//! against each row.

// ============================================================================
// SECTION: Imports
// ============================================================================

use datatrail_core::Determinism;
use datatrail_core::GatePlugin;
use datatrail_core::GateRule;
use datatrail_core::RouteTarget;
use datatrail_core::RoutingMode;
use serde::Deserialize;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::parse_config;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// One declared gate rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Label of the edge taken when the condition matches.
    pub label: String,
    /// Condition expression over `row`.
    pub condition: String,
}

/// Rule gate options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGateConfig {
    /// Gate instance name.
    pub name: String,
    /// Ordered rules; the first match wins in move mode.
    pub rules: Vec<RuleConfig>,
    /// Destination when no rule matches: a sink name or "discard".
    #[serde(default)]
    pub on_no_match: Option<String>,
    /// Routing mode applied to chosen edges.
    #[serde(default)]
    pub mode: GateMode,
}

/// Declared routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Token moves along the first matching edge.
    #[default]
    Move,
    /// Token is cloned along every matching edge.
    Copy,
}

// ============================================================================
// SECTION: Gate
// ============================================================================

/// Configuration-driven gate.
pub struct RuleGate {
    /// Gate instance name.
    name: String,
    /// Declared rules.
    rules: Vec<GateRule>,
    /// No-match destination.
    on_no_match: Option<RouteTarget>,
    /// Routing mode.
    mode: RoutingMode,
}

impl RuleGate {
    /// Plugin name.
    pub const NAME: &'static str = "rule_gate";

    /// Builds a rule gate from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration or an empty
    /// rule list.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: RuleGateConfig = parse_config(Self::NAME, value)?;
        if config.rules.is_empty() {
            return Err(PluginConfigError::Invalid {
                plugin: Self::NAME.to_string(),
                reason: "a gate requires at least one rule".to_string(),
            });
        }
        let rules = config
            .rules
            .into_iter()
            .map(|rule| GateRule { edge_label: rule.label, condition: rule.condition })
            .collect();
        Ok(Self {
            name: config.name,
            rules,
            on_no_match: config.on_no_match.as_deref().map(RouteTarget::parse),
            mode: match config.mode {
                GateMode::Move => RoutingMode::Move,
                GateMode::Copy => RoutingMode::Copy,
            },
        })
    }
}

impl GatePlugin for RuleGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn rules(&self) -> &[GateRule] {
        &self.rules
    }

    fn on_no_match(&self) -> Option<&RouteTarget> {
        self.on_no_match.as_ref()
    }

    fn default_mode(&self) -> RoutingMode {
        self.mode
    }
}
