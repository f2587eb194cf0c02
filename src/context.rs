use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counts attached to a request. Output tokens stay zero until a
/// response body has actually been obtained.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Immutable snapshot of one inbound request, built once and passed by
/// reference into rule evaluation. Header names are stored lowercased.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub requested_model: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub usage: TokenUsage,
}

impl RequestContext {
    pub fn new(
        requested_model: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Value,
        usage: TokenUsage,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            requested_model: requested_model.into(),
            headers,
            body,
            usage,
        }
    }

    /// Resolves a dotted field path against the context.
    ///
    /// Supported roots:
    /// - `model` -> the requested model name
    /// - `headers.<name>` -> header value (case-insensitive name)
    /// - `body.<path>` -> request body field, with `[idx]` array access,
    ///   e.g. `body.messages[0].role`
    /// - `token_usage.input_tokens` / `output_tokens` / `total_tokens`
    pub fn lookup(&self, field_path: &str) -> Option<Value> {
        let mut parts = field_path.split('.');
        let root = parts.next()?.to_ascii_lowercase();
        let rest: Vec<&str> = parts.collect();

        match root.as_str() {
            "model" if rest.is_empty() => Some(Value::String(self.requested_model.clone())),
            "headers" => {
                let name = rest.first()?.to_ascii_lowercase();
                self.headers.get(&name).cloned().map(Value::String)
            }
            "body" => lookup_nested(&self.body, &rest).cloned(),
            "token_usage" => match rest.as_slice() {
                ["input_tokens"] => Some(Value::from(self.usage.input_tokens)),
                ["output_tokens"] => Some(Value::from(self.usage.output_tokens)),
                ["total_tokens"] => Some(Value::from(self.usage.total_tokens())),
                _ => None,
            },
            _ => None,
        }
    }
}

fn lookup_nested<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let Some((segment, rest)) = path.split_first() else {
        return Some(value);
    };

    // `key[2]` addresses an array element inside an object field.
    if let Some(open) = segment.find('[') {
        if !segment.ends_with(']') {
            return None;
        }
        let key = &segment[..open];
        let index: usize = segment[open + 1..segment.len() - 1].parse().ok()?;
        let array = value.as_object()?.get(key)?.as_array()?;
        return lookup_nested(array.get(index)?, rest);
    }

    lookup_nested(value.as_object()?.get(*segment)?, rest)
}
