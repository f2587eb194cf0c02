use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::context::RequestContext;

use super::{Condition, RuleLogic, RuleOp, RuleSet};

/// A malformed condition. Isolated by the engine: the owning rule
/// contributes zero candidates and evaluation of the remaining rules
/// continues.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("operator '{op}' expects an array value")]
    ExpectedArray { op: &'static str },
}

/// Evaluates a full rule set against the context. `None` and empty sets
/// match unconditionally.
pub fn ruleset_matches(
    ruleset: Option<&RuleSet>,
    context: &RequestContext,
) -> Result<bool, EvalError> {
    let Some(ruleset) = ruleset else {
        return Ok(true);
    };
    if ruleset.is_empty() {
        return Ok(true);
    }

    let mut results = Vec::with_capacity(ruleset.conditions.len());
    for condition in &ruleset.conditions {
        results.push(evaluate_condition(condition, context)?);
    }

    Ok(match ruleset.logic {
        RuleLogic::Or => results.iter().any(|matched| *matched),
        RuleLogic::And => results.iter().all(|matched| *matched),
    })
}

pub fn evaluate_condition(
    condition: &Condition,
    context: &RequestContext,
) -> Result<bool, EvalError> {
    let actual = context.lookup(&condition.field);
    let expected = &condition.value;

    Ok(match condition.op {
        RuleOp::Eq => actual.as_ref().is_some_and(|actual| values_eq(actual, expected)),
        RuleOp::Ne => !actual.as_ref().is_some_and(|actual| values_eq(actual, expected)),
        RuleOp::Gt => compare(actual.as_ref(), expected).is_some_and(std::cmp::Ordering::is_gt),
        RuleOp::Gte => compare(actual.as_ref(), expected).is_some_and(std::cmp::Ordering::is_ge),
        RuleOp::Lt => compare(actual.as_ref(), expected).is_some_and(std::cmp::Ordering::is_lt),
        RuleOp::Lte => compare(actual.as_ref(), expected).is_some_and(std::cmp::Ordering::is_le),
        RuleOp::Contains => contains(actual.as_ref(), expected),
        RuleOp::NotContains => !contains(actual.as_ref(), expected),
        RuleOp::Regex => regex_matches(actual.as_ref(), expected)?,
        RuleOp::In => in_list(actual.as_ref(), expected, "in")?,
        RuleOp::NotIn => !in_list(actual.as_ref(), expected, "not_in")?,
        RuleOp::Exists => {
            let exists = actual.is_some();
            if expected.as_bool().unwrap_or(true) {
                exists
            } else {
                !exists
            }
        }
    })
}

fn values_eq(actual: &Value, expected: &Value) -> bool {
    // Numeric equality ignores the integer/float representation split.
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a == b;
    }
    actual == expected
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (actual.as_str(), expected.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn contains(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual.and_then(|value| value.as_str()) else {
        return false;
    };
    let needle = match expected {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    actual.contains(&needle)
}

fn regex_matches(actual: Option<&Value>, expected: &Value) -> Result<bool, EvalError> {
    let pattern = match expected {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let regex = Regex::new(&pattern).map_err(|source| EvalError::InvalidRegex {
        pattern: pattern.clone(),
        source,
    })?;
    Ok(actual
        .and_then(|value| value.as_str())
        .is_some_and(|text| regex.is_match(text)))
}

fn in_list(actual: Option<&Value>, expected: &Value, op: &'static str) -> Result<bool, EvalError> {
    let Some(items) = expected.as_array() else {
        return Err(EvalError::ExpectedArray { op });
    };
    let Some(actual) = actual else {
        return Ok(false);
    };
    Ok(items.iter().any(|item| values_eq(actual, item)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    use crate::context::TokenUsage;

    fn context() -> RequestContext {
        let mut headers = BTreeMap::new();
        headers.insert("x-priority".to_string(), "high".to_string());
        RequestContext::new(
            "gpt-4o",
            headers,
            json!({"temperature": 0.9, "messages": [{"role": "system"}]}),
            TokenUsage {
                input_tokens: 150,
                output_tokens: 0,
            },
        )
    }

    fn cond(field: &str, op: RuleOp, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            op,
            value,
        }
    }

    #[test]
    fn comparison_operators() {
        let ctx = context();
        assert!(evaluate_condition(&cond("model", RuleOp::Eq, json!("gpt-4o")), &ctx).unwrap());
        assert!(evaluate_condition(&cond("model", RuleOp::Ne, json!("gpt-4")), &ctx).unwrap());
        assert!(
            evaluate_condition(&cond("token_usage.input_tokens", RuleOp::Gt, json!(100)), &ctx)
                .unwrap()
        );
        assert!(
            evaluate_condition(&cond("token_usage.input_tokens", RuleOp::Lte, json!(150)), &ctx)
                .unwrap()
        );
        assert!(
            !evaluate_condition(&cond("body.temperature", RuleOp::Lt, json!(0.5)), &ctx).unwrap()
        );
    }

    #[test]
    fn missing_field_never_satisfies_ordered_comparisons() {
        let ctx = context();
        assert!(!evaluate_condition(&cond("body.absent", RuleOp::Gt, json!(0)), &ctx).unwrap());
        assert!(!evaluate_condition(&cond("body.absent", RuleOp::Eq, json!(0)), &ctx).unwrap());
        // ne is satisfied vacuously, matching the exists semantics.
        assert!(evaluate_condition(&cond("body.absent", RuleOp::Ne, json!(0)), &ctx).unwrap());
    }

    #[test]
    fn string_operators() {
        let ctx = context();
        assert!(evaluate_condition(&cond("model", RuleOp::Contains, json!("4o")), &ctx).unwrap());
        assert!(
            evaluate_condition(&cond("model", RuleOp::NotContains, json!("claude")), &ctx).unwrap()
        );
        assert!(
            evaluate_condition(&cond("model", RuleOp::Regex, json!("^gpt-4o$")), &ctx).unwrap()
        );
        assert!(
            !evaluate_condition(&cond("model", RuleOp::Regex, json!("^claude")), &ctx).unwrap()
        );
    }

    #[test]
    fn invalid_regex_is_an_error_not_a_match() {
        let ctx = context();
        let err = evaluate_condition(&cond("model", RuleOp::Regex, json!("[broken")), &ctx)
            .expect_err("expected error");
        assert!(matches!(err, EvalError::InvalidRegex { .. }));
    }

    #[test]
    fn membership_operators() {
        let ctx = context();
        assert!(
            evaluate_condition(&cond("model", RuleOp::In, json!(["gpt-4o", "gpt-4"])), &ctx)
                .unwrap()
        );
        assert!(
            evaluate_condition(&cond("model", RuleOp::NotIn, json!(["claude-3"])), &ctx).unwrap()
        );
        let err = evaluate_condition(&cond("model", RuleOp::In, json!("gpt-4o")), &ctx)
            .expect_err("expected error");
        assert!(matches!(err, EvalError::ExpectedArray { .. }));
    }

    #[test]
    fn exists_operator() {
        let ctx = context();
        assert!(
            evaluate_condition(&cond("headers.x-priority", RuleOp::Exists, json!(true)), &ctx)
                .unwrap()
        );
        assert!(
            evaluate_condition(&cond("headers.absent", RuleOp::Exists, json!(false)), &ctx)
                .unwrap()
        );
        assert!(
            !evaluate_condition(&cond("headers.absent", RuleOp::Exists, json!(true)), &ctx)
                .unwrap()
        );
    }

    #[test]
    fn ruleset_logic_and_or() {
        let ctx = context();
        let matched = Condition {
            field: "model".to_string(),
            op: RuleOp::Eq,
            value: json!("gpt-4o"),
        };
        let unmatched = Condition {
            field: "model".to_string(),
            op: RuleOp::Eq,
            value: json!("claude-3"),
        };

        let and_set = RuleSet {
            logic: RuleLogic::And,
            conditions: vec![matched.clone(), unmatched.clone()],
        };
        let or_set = RuleSet {
            logic: RuleLogic::Or,
            conditions: vec![matched, unmatched],
        };
        assert!(!ruleset_matches(Some(&and_set), &ctx).unwrap());
        assert!(ruleset_matches(Some(&or_set), &ctx).unwrap());
        assert!(ruleset_matches(None, &ctx).unwrap());
        assert!(ruleset_matches(Some(&RuleSet::default()), &ctx).unwrap());
    }
}
