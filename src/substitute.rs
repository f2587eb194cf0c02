use serde_json::Value;

/// Replaces the value of the top-level `model` field, leaving every other
/// field, its order, nesting, and unknown extensions untouched.
///
/// The transform is protocol-agnostic: it operates on the generic JSON
/// structure, not a schema, so it applies to both supported wire formats.
/// Applying it twice with the same target is idempotent. A body without a
/// `model` field (or a non-object body) is returned unchanged; validation
/// upstream guarantees the field is present on the forwarding path.
pub fn substitute_model(body: &Value, target_model: &str) -> Value {
    let mut out = body.clone();
    if let Value::Object(map) = &mut out {
        if let Some(slot) = map.get_mut("model") {
            *slot = Value::String(target_model.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replaces_only_the_model_field() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "x_vendor_extension": {"keep": ["me", 1, null]}
        });

        let out = substitute_model(&body, "upstream-model");
        assert_eq!(out["model"], json!("upstream-model"));

        let mut expected = body.clone();
        expected["model"] = json!("upstream-model");
        assert_eq!(out, expected);
        // Field order is preserved as serialized.
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            serde_json::to_string(&expected).unwrap()
        );
    }

    #[test]
    fn is_idempotent() {
        let body = json!({"model": "gpt-4o", "stream": true});
        let once = substitute_model(&body, "m");
        let twice = substitute_model(&once, "m");
        assert_eq!(once, twice);
    }

    #[test]
    fn leaves_bodies_without_model_untouched() {
        let body = json!({"messages": []});
        assert_eq!(substitute_model(&body, "m"), body);
        let body = json!("not an object");
        assert_eq!(substitute_model(&body, "m"), body);
    }
}
