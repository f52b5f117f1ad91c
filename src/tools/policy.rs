//! Per-tool risk classification.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::llm::ToolCallRequest;

/// How risky a tool invocation is considered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Executes immediately.
    #[default]
    Low,
    /// Pauses the turn until a human approves.
    RequiresApproval,
}

/// Configuration-supplied classification of tool calls.
///
/// Lookup order: exact `plugin.function`, then `plugin.*`, then the default
/// level. An empty policy with a `Low` default approves nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterventionPolicy {
    #[serde(default)]
    rules: HashMap<String, RiskLevel>,
    #[serde(default)]
    default_level: RiskLevel,
}

impl InterventionPolicy {
    pub fn new(default_level: RiskLevel) -> Self {
        Self {
            rules: HashMap::new(),
            default_level,
        }
    }

    pub fn with_rule(mut self, name: impl Into<String>, level: RiskLevel) -> Self {
        self.rules.insert(name.into(), level);
        self
    }

    fn level_for(&self, call: &ToolCallRequest) -> RiskLevel {
        if let Some(level) = self.rules.get(&call.qualified_name()) {
            return *level;
        }
        if let Some(level) = self.rules.get(&format!("{}.*", call.plugin)) {
            return *level;
        }
        self.default_level
    }

    pub fn requires_intervention(&self, call: &ToolCallRequest) -> bool {
        self.level_for(call) == RiskLevel::RequiresApproval
    }

    /// Split calls into (immediately-executable, intervention-required),
    /// preserving order within each set.
    pub fn partition(
        &self,
        calls: Vec<ToolCallRequest>,
    ) -> (Vec<ToolCallRequest>, Vec<ToolCallRequest>) {
        calls
            .into_iter()
            .partition(|call| !self.requires_intervention(call))
    }
}
