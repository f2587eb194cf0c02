use std::collections::BTreeMap;

const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "x-api-key", "api-key"];

/// Masks a credential value one-way.
///
/// A `Bearer ` prefix is preserved. Tokens of 8 characters or fewer become
/// `***` outright; longer tokens keep the first 4 and last 2 characters
/// with `***...***` in between. The original value is never recoverable
/// from the masked form.
pub fn mask_credential(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let (prefix, token) = match value.get(..7) {
        Some(head) if head.eq_ignore_ascii_case("bearer ") => ("Bearer ", &value[7..]),
        _ => ("", value),
    };

    if token.chars().count() <= 8 {
        return format!("{prefix}***");
    }

    let head: String = token.chars().take(4).collect();
    let tail_start = token.chars().count() - 2;
    let tail: String = token.chars().skip(tail_start).collect();
    format!("{prefix}{head}***...***{tail}")
}

/// Returns a copy of the headers with authorization-bearing values masked.
/// All other headers pass through unchanged; the input is not mutated.
pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            if SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                (name.clone(), mask_credential(value))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}
