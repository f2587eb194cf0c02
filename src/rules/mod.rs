//! Routing rules: data describing which provider serves which model.

mod engine;
mod evaluator;

pub use engine::{ModelMapping, RoutingSnapshot, RuleEngine};
pub use evaluator::{EvalError, evaluate_condition, ruleset_matches};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream wire protocol spoken by a provider endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    OpenAi,
    Anthropic,
}

impl WireProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireProtocol::OpenAi => "openai",
            WireProtocol::Anthropic => "anthropic",
        }
    }
}

/// A configured upstream endpoint. Owned by the external mapping store;
/// the core only reads point-in-time copies.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderNode {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub protocol: WireProtocol,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl std::fmt::Debug for ProviderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("protocol", &self.protocol)
            .field("api_key", &"<redacted>")
            .field("is_active", &self.is_active)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

/// Scope of a routing rule. A provider-level rule's contribution wins over
/// a model-level default for the same provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Model,
    Provider,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    Regex,
    In,
    NotIn,
    Exists,
}

/// One predicate over a `RequestContext` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: RuleOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleLogic {
    #[default]
    And,
    Or,
}

/// A group of conditions combined with AND/OR. An empty set matches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub logic: RuleLogic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// A configured matching unit: predicate plus output contribution. Rules
/// are data; evaluation never has side effects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingRule {
    pub scope: RuleScope,
    pub provider_id: String,
    pub target_model: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<RuleSet>,
}

fn default_weight() -> u32 {
    1
}

/// Result of rule evaluation: one provider eligible for the current
/// request, with its resolved target model.
#[derive(Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub provider_id: String,
    pub provider_name: String,
    pub base_url: String,
    pub protocol: WireProtocol,
    pub api_key: String,
    pub target_model: String,
    pub priority: i32,
    pub weight: u32,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("provider_id", &self.provider_id)
            .field("provider_name", &self.provider_name)
            .field("base_url", &self.base_url)
            .field("protocol", &self.protocol)
            .field("api_key", &"<redacted>")
            .field("target_model", &self.target_model)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .finish()
    }
}
