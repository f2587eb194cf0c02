//! Per-protocol token accounting.
//!
//! The OpenAI wire format is counted with tiktoken; the Anthropic wire
//! format uses the character estimate the upstream tokenizer is not
//! published for. Counter selection follows the wire protocol of the
//! candidate that served (or last attempted) the response.

use serde_json::Value;
use tiktoken_rs::{CoreBPE, tokenizer};

use crate::rules::WireProtocol;

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

fn clamp_usize_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

// Four characters per token, the conventional estimate.
fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

fn count_text(protocol: WireProtocol, model: &str, text: &str) -> usize {
    match protocol {
        WireProtocol::OpenAi => bpe_for_model(model).encode_with_special_tokens(text).len(),
        WireProtocol::Anthropic => estimate_text_tokens(text),
    }
}

/// Counts the input tokens of a request body per the protocol's
/// message-framing convention. Always non-negative; unknown shapes count
/// as zero rather than failing the request.
pub fn count_input(protocol: WireProtocol, model: &str, body: &Value) -> u32 {
    let tokens = match protocol {
        WireProtocol::OpenAi => count_openai_messages(model, body),
        WireProtocol::Anthropic => count_anthropic_messages(model, body),
    };
    clamp_usize_to_u32(tokens)
}

fn count_openai_messages(model: &str, body: &Value) -> usize {
    let Some(messages) = body.get("messages").and_then(|value| value.as_array()) else {
        return 0;
    };
    let bpe = bpe_for_model(model);
    let (tokens_per_message, tokens_per_name) = if model.starts_with("gpt-3.5") {
        (4i64, -1i64)
    } else {
        (3i64, 1i64)
    };

    let mut tokens: i64 = 0;
    for message in messages {
        let Some(obj) = message.as_object() else {
            continue;
        };
        tokens = tokens.saturating_add(tokens_per_message);

        if let Some(role) = obj.get("role").and_then(|value| value.as_str()) {
            tokens =
                tokens.saturating_add(bpe.encode_with_special_tokens(role).len() as i64);
        }
        if let Some(content) = obj.get("content") {
            tokens = tokens.saturating_add(count_content_parts(content, |text| {
                bpe.encode_with_special_tokens(text).len()
            }) as i64);
        }
        if let Some(name) = obj.get("name").and_then(|value| value.as_str()) {
            tokens = tokens.saturating_add(bpe.encode_with_special_tokens(name).len() as i64);
            tokens = tokens.saturating_add(tokens_per_name);
        }
    }
    tokens = tokens.saturating_add(3);
    tokens.max(0) as usize
}

fn count_anthropic_messages(model: &str, body: &Value) -> usize {
    let mut tokens = 0usize;
    if let Some(system) = body.get("system").and_then(|value| value.as_str()) {
        tokens = tokens.saturating_add(count_text(WireProtocol::Anthropic, model, system));
    }

    let Some(messages) = body.get("messages").and_then(|value| value.as_array()) else {
        return tokens;
    };
    for message in messages {
        let Some(obj) = message.as_object() else {
            continue;
        };
        if let Some(role) = obj.get("role").and_then(|value| value.as_str()) {
            tokens = tokens.saturating_add(estimate_text_tokens(role));
        }
        if let Some(content) = obj.get("content") {
            tokens = tokens.saturating_add(count_content_parts(content, estimate_text_tokens));
        }
        tokens = tokens.saturating_add(4);
    }
    tokens
}

fn count_content_parts(content: &Value, count: impl Fn(&str) -> usize) -> usize {
    match content {
        Value::String(text) => count(text),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(count(text)),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(|value| value.as_str())
                    .map(&count),
                _ => None,
            })
            .sum(),
        _ => 0,
    }
}

/// Counts output tokens of a buffered response body. Prefers the usage
/// figures the upstream reported; falls back to counting the generated
/// text locally.
pub fn count_output(protocol: WireProtocol, model: &str, body: &Value) -> u32 {
    if let Some(reported) = reported_output_tokens(body) {
        return reported;
    }

    let tokens = match protocol {
        WireProtocol::OpenAi => body
            .get("choices")
            .and_then(|value| value.as_array())
            .map(|choices| {
                choices
                    .iter()
                    .filter_map(|choice| choice.get("message").and_then(|m| m.get("content")))
                    .map(|content| {
                        count_content_parts(content, |text| {
                            count_text(protocol, model, text)
                        })
                    })
                    .sum()
            })
            .unwrap_or(0),
        WireProtocol::Anthropic => body
            .get("content")
            .map(|content| count_content_parts(content, estimate_text_tokens))
            .unwrap_or(0),
    };
    clamp_usize_to_u32(tokens)
}

// An explicitly reported zero is a real figure; the local fallback is only
// for responses that carry no usage at all.
fn reported_output_tokens(value: &Value) -> Option<u32> {
    let usage = value.get("usage")?;
    let reported = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))?
        .as_u64()?;
    Some(u32::try_from(reported).unwrap_or(u32::MAX))
}

/// Incremental output-token accumulator for streamed responses.
///
/// Chunks are SSE frames; the accumulator extracts delta text per wire
/// format and counts as chunks arrive, so counting never blocks delivery
/// to the caller. `finalize` is called on stream close, including early
/// close from a client disconnect, and prefers upstream-reported usage
/// when the stream carried it.
#[derive(Debug)]
pub struct StreamTokenCounter {
    protocol: WireProtocol,
    model: String,
    pending: String,
    counted: u64,
    reported: Option<u64>,
}

impl StreamTokenCounter {
    pub fn new(protocol: WireProtocol, model: impl Into<String>) -> Self {
        Self {
            protocol,
            model: model.into(),
            pending: String::new(),
            counted: 0,
            reported: None,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        // SSE events are newline-delimited; keep the trailing partial line
        // buffered until its terminator arrives.
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.consume_line(line.trim_end());
        }
    }

    fn consume_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        if let Some(reported) = reported_output_tokens(&event) {
            self.reported = Some(u64::from(reported));
        }

        if let Some(delta) = delta_text(self.protocol, &event) {
            self.counted = self
                .counted
                .saturating_add(count_text(self.protocol, &self.model, delta) as u64);
        }
    }

    /// Final output-token count. Non-negative; zero when the stream never
    /// produced countable content.
    pub fn finalize(&self) -> u32 {
        let total = self.reported.unwrap_or(self.counted);
        u32::try_from(total).unwrap_or(u32::MAX)
    }
}

fn delta_text(protocol: WireProtocol, event: &Value) -> Option<&str> {
    match protocol {
        WireProtocol::OpenAi => event
            .get("choices")?
            .as_array()?
            .first()?
            .get("delta")?
            .get("content")?
            .as_str(),
        WireProtocol::Anthropic => event.get("delta")?.get("text")?.as_str(),
    }
}
