use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::rules::{Candidate, WireProtocol};
use crate::substitute::substitute_model;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

// Hop-by-hop and auth headers are never copied through to the upstream;
// the provider's own credential is injected instead.
const STRIPPED_REQUEST_HEADERS: [&str; 8] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "expect",
    "authorization",
    "x-api-key",
    "api-key",
];

const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["content-length", "connection", "transfer-encoding"];

/// Result of one forwarding try. Transport failures (connect errors,
/// resets, per-attempt timeouts) come back as `transport_error` with no
/// status; the retry policy classifies them with the server-error class.
pub struct ForwardReply {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<ForwardBody>,
    pub transport_error: Option<String>,
    pub first_byte_ms: Option<u64>,
    pub total_ms: u64,
}

pub enum ForwardBody {
    Buffered(Bytes),
    /// Response head received; the body is consumed by the caller as it
    /// streams. Total latency is finalized by whoever drains the stream.
    Stream(reqwest::Response),
}

impl ForwardReply {
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|status| (200..300).contains(&status))
    }

    fn transport(message: String, started: Instant) -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            body: None,
            transport_error: Some(message),
            first_byte_ms: None,
            total_ms: elapsed_ms(started),
        }
    }

    /// Short failure description for attempt records and synthesized
    /// responses.
    pub fn error_message(&self) -> Option<String> {
        if let Some(error) = &self.transport_error {
            return Some(error.clone());
        }
        let status = self.status?;
        if (200..300).contains(&status) {
            return None;
        }
        let excerpt = match &self.body {
            Some(ForwardBody::Buffered(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                let trimmed: String = text.chars().take(200).collect();
                trimmed
            }
            _ => String::new(),
        };
        if excerpt.is_empty() {
            Some(format!("upstream returned status {status}"))
        } else {
            Some(excerpt)
        }
    }
}

/// Sends a request to one candidate. `body` is the caller's original
/// payload; implementations substitute the candidate's target model before
/// transmission so failover re-selection always carries the right name.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        candidate: &Candidate,
        body: &Value,
        headers: &BTreeMap<String, String>,
        stream: bool,
    ) -> ForwardReply;
}

/// Protocol adapter details that differ between the two wire formats.
fn upstream_path(protocol: WireProtocol) -> &'static str {
    match protocol {
        WireProtocol::OpenAi => "/v1/chat/completions",
        WireProtocol::Anthropic => "/v1/messages",
    }
}

pub struct HttpForwarder {
    client: reqwest::Client,
    per_attempt_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(per_attempt_timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            per_attempt_timeout,
        })
    }

    fn build_headers(&self, candidate: &Candidate, inbound: &BTreeMap<String, String>) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in inbound {
            let lowered = name.to_ascii_lowercase();
            if STRIPPED_REQUEST_HEADERS.contains(&lowered.as_str()) {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(lowered.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            out.insert(name, value);
        }

        out.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        match candidate.protocol {
            WireProtocol::OpenAi => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", candidate.api_key)) {
                    out.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            WireProtocol::Anthropic => {
                if let Ok(value) = HeaderValue::from_str(&candidate.api_key) {
                    out.insert(HeaderName::from_static("x-api-key"), value);
                }
                if !out.contains_key("anthropic-version") {
                    out.insert(
                        HeaderName::from_static("anthropic-version"),
                        HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
                    );
                }
            }
        }
        out
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        candidate: &Candidate,
        body: &Value,
        headers: &BTreeMap<String, String>,
        stream: bool,
    ) -> ForwardReply {
        let url = join_base_url(&candidate.base_url, upstream_path(candidate.protocol));
        let headers = self.build_headers(candidate, headers);
        let body = substitute_model(body, &candidate.target_model);
        let started = Instant::now();

        let request = self.client.post(url).headers(headers).json(&body);
        let response =
            match tokio::time::timeout(self.per_attempt_timeout, request.send()).await {
                Err(_) => {
                    return ForwardReply::transport(
                        format!(
                            "attempt timed out after {}ms",
                            self.per_attempt_timeout.as_millis()
                        ),
                        started,
                    );
                }
                Ok(Err(err)) => {
                    return ForwardReply::transport(format!("request failed: {err}"), started);
                }
                Ok(Ok(response)) => response,
            };

        let first_byte_ms = elapsed_ms(started);
        let status = response.status().as_u16();
        let response_headers = collect_headers(response.headers());

        if stream && (200..300).contains(&status) {
            return ForwardReply {
                status: Some(status),
                headers: response_headers,
                body: Some(ForwardBody::Stream(response)),
                transport_error: None,
                first_byte_ms: Some(first_byte_ms),
                total_ms: first_byte_ms,
            };
        }

        let remaining = self.per_attempt_timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, response.bytes()).await {
            Err(_) => ForwardReply::transport("timed out reading response body".to_string(), started),
            Ok(Err(err)) => {
                ForwardReply::transport(format!("failed to read response body: {err}"), started)
            }
            Ok(Ok(bytes)) => ForwardReply {
                status: Some(status),
                headers: response_headers,
                body: Some(ForwardBody::Buffered(bytes)),
                transport_error: None,
                first_byte_ms: Some(first_byte_ms),
                total_ms: elapsed_ms(started),
            },
        }
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');

    // Allow base_url to already include /v1 and still accept /v1* paths.
    if base.ends_with("/v1") {
        if let Some(rest) = path.strip_prefix("/v1/") {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}{path}")
}
