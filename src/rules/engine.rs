use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::context::RequestContext;

use super::{Candidate, ProviderNode, RoutingRule, RuleScope, ruleset_matches};

/// Model-level configuration for one requested model name, including every
/// routing rule (model- and provider-level) configured for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelMapping {
    pub requested_model: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

fn default_true() -> bool {
    true
}

/// Point-in-time view of the mapping store for one request. The engine
/// never holds configuration across requests.
#[derive(Clone, Debug)]
pub struct RoutingSnapshot {
    pub mapping: ModelMapping,
    pub providers: HashMap<String, ProviderNode>,
}

#[derive(Debug, Default)]
pub struct RuleEngine;

impl RuleEngine {
    /// Evaluates every configured rule against the context and merges the
    /// contributions into an ordered candidate list.
    ///
    /// All rules are evaluated; there is no short-circuit on first match.
    /// For a given provider a provider-level contribution overrides a
    /// model-level one; two contributions of the same scope keep the first
    /// in configured order. The result is stably sorted by priority, so
    /// identical input always yields an identical list. An empty list is a
    /// legitimate outcome, not an error.
    pub fn evaluate(&self, context: &RequestContext, snapshot: &RoutingSnapshot) -> Vec<Candidate> {
        let mut merged: Vec<(RuleScope, Candidate)> = Vec::new();

        for rule in &snapshot.mapping.rules {
            if !rule.is_active {
                continue;
            }

            let matched = match ruleset_matches(rule.when.as_ref(), context) {
                Ok(matched) => matched,
                Err(err) => {
                    // A malformed rule contributes nothing; evaluation of
                    // the remaining rules continues.
                    tracing::warn!(
                        model = %snapshot.mapping.requested_model,
                        provider_id = %rule.provider_id,
                        error = %err,
                        "skipping malformed routing rule"
                    );
                    continue;
                }
            };
            if !matched {
                continue;
            }

            let Some(provider) = snapshot.providers.get(&rule.provider_id) else {
                tracing::warn!(
                    provider_id = %rule.provider_id,
                    "routing rule references unknown provider"
                );
                continue;
            };
            if !provider.is_active {
                continue;
            }

            let candidate = Candidate {
                provider_id: provider.id.clone(),
                provider_name: provider.name.clone(),
                base_url: provider.base_url.clone(),
                protocol: provider.protocol,
                api_key: provider.api_key.clone(),
                target_model: rule.target_model.clone(),
                priority: rule.priority,
                weight: rule.weight,
            };

            match merged
                .iter_mut()
                .find(|(_, existing)| existing.provider_id == candidate.provider_id)
            {
                None => merged.push((rule.scope, candidate)),
                Some((existing_scope, existing)) => {
                    if rule.scope == RuleScope::Provider && *existing_scope == RuleScope::Model {
                        *existing_scope = rule.scope;
                        *existing = candidate;
                    }
                }
            }
        }

        let mut candidates: Vec<Candidate> =
            merged.into_iter().map(|(_, candidate)| candidate).collect();
        candidates.sort_by_key(|candidate| candidate.priority);
        candidates
    }
}
