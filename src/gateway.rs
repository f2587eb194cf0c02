//! Request lifecycle orchestration.
//!
//! One `handle` call owns a request from validation to the terminal audit
//! entry: mapping lookup, token accounting, rule evaluation, round-robin
//! dispatch with retry/failover, and response delivery. Every identified
//! request produces exactly one audit entry, whatever its outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLogger, LogEntry, LogOutcome, TracingLogSink, now_millis};
use crate::config::RelayConfig;
use crate::context::{RequestContext, TokenUsage};
use crate::error::{RelayError, Result};
use crate::forward::{ForwardBody, Forwarder, HttpForwarder};
use crate::identity::CallerIdentity;
use crate::redact::redact_headers;
use crate::retry::{DispatchController, DispatchOutcome, RetryPolicy, Terminal};
use crate::rotation::InMemoryCursorStore;
use crate::rules::{RuleEngine, WireProtocol};
use crate::selector::RoundRobinSelector;
use crate::store::{InMemoryMappingStore, MappingStore};
use crate::stream::{AuditedStream, StreamAudit};
use crate::tokens::{StreamTokenCounter, count_input, count_output};

/// One identified inbound request, surface-agnostic. The HTTP layer has
/// already authenticated the caller and parsed the body.
pub struct RelayRequest {
    pub trace_id: String,
    pub caller: CallerIdentity,
    /// Wire format of the surface the request arrived on. Used only as a
    /// counting fallback when a mapping resolves no provider.
    pub surface: WireProtocol,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

pub enum RelayBody {
    Buffered(Bytes),
    Stream(AuditedStream),
}

pub struct RelayResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: RelayBody,
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

pub struct GatewayBuilder {
    store: Arc<dyn MappingStore>,
    policy: RetryPolicy,
    forwarder: Option<Arc<dyn Forwarder>>,
    logger: Option<AuditLogger>,
    selector: Option<RoundRobinSelector>,
}

impl GatewayBuilder {
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_logger(mut self, logger: AuditLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_selector(mut self, selector: RoundRobinSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let forwarder = match self.forwarder {
            Some(forwarder) => forwarder,
            None => Arc::new(HttpForwarder::new(
                crate::config::Settings::default().per_attempt_timeout(),
            )?),
        };
        Ok(Gateway {
            store: self.store,
            engine: RuleEngine,
            selector: self
                .selector
                .unwrap_or_else(|| RoundRobinSelector::new(Arc::new(InMemoryCursorStore::new()))),
            forwarder,
            logger: self
                .logger
                .unwrap_or_else(|| AuditLogger::new(Arc::new(TracingLogSink))),
            policy: self.policy,
        })
    }
}

pub struct Gateway {
    store: Arc<dyn MappingStore>,
    engine: RuleEngine,
    selector: RoundRobinSelector,
    forwarder: Arc<dyn Forwarder>,
    logger: AuditLogger,
    policy: RetryPolicy,
}

impl Gateway {
    pub fn builder(store: Arc<dyn MappingStore>) -> GatewayBuilder {
        GatewayBuilder {
            store,
            policy: RetryPolicy::default(),
            forwarder: None,
            logger: None,
            selector: None,
        }
    }

    /// Convenience constructor for the config-file deployment shape.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let settings = &config.settings;
        let policy = RetryPolicy {
            max_attempts_per_candidate: settings.retry_max_attempts_per_candidate,
            backoff: settings.backoff(),
            transport_error_failover_immediately: settings.transport_error_failover_immediately,
        };
        Self::builder(Arc::new(InMemoryMappingStore::from_config(config)))
            .with_policy(policy)
            .with_forwarder(Arc::new(HttpForwarder::new(settings.per_attempt_timeout())?))
            .build()
    }

    /// Carries a request through the full pipeline. The returned error is
    /// already audited; the HTTP layer only translates it to the caller's
    /// wire format.
    pub async fn handle(
        &self,
        request: RelayRequest,
        cancel: &CancellationToken,
    ) -> Result<RelayResponse> {
        let started = Instant::now();
        let mut entry = self.base_entry(&request);

        if !request.body.is_object() {
            return Err(self.reject(
                entry,
                RelayError::Validation {
                    reason: "request body must be a JSON object".to_string(),
                },
            ));
        }

        let Some(requested_model) = request
            .body
            .get("model")
            .and_then(|value| value.as_str())
            .map(str::to_string)
        else {
            return Err(self.reject(
                entry,
                RelayError::Validation {
                    reason: "request body has no model field".to_string(),
                },
            ));
        };
        entry.requested_model = requested_model.clone();

        let Some(snapshot) = self.store.snapshot(&requested_model).await else {
            return Err(self.reject(
                entry,
                RelayError::ModelNotFound {
                    model: requested_model,
                },
            ));
        };
        if !snapshot.mapping.is_active {
            return Err(self.reject(
                entry,
                RelayError::ModelDisabled {
                    model: requested_model,
                },
            ));
        }

        // Input tokens are counted once, before evaluation, with the wire
        // format of the first configured provider; rules may predicate on
        // the resulting counts.
        let counting_protocol = snapshot
            .mapping
            .rules
            .first()
            .and_then(|rule| snapshot.providers.get(&rule.provider_id))
            .map(|provider| provider.protocol)
            .unwrap_or(request.surface);
        let usage = TokenUsage {
            input_tokens: count_input(counting_protocol, &requested_model, &request.body),
            output_tokens: 0,
        };
        entry.usage = usage;

        let context = RequestContext::new(
            requested_model.clone(),
            request.headers.clone(),
            request.body.clone(),
            usage,
        );
        let candidates = self.engine.evaluate(&context, &snapshot);
        if candidates.is_empty() {
            return Err(self.reject(
                entry,
                RelayError::NoCandidate {
                    model: requested_model,
                },
            ));
        }

        let stream = request
            .body
            .get("stream")
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        let controller = DispatchController {
            forwarder: self.forwarder.as_ref(),
            selector: &self.selector,
            policy: self.policy,
        };
        let outcome = controller
            .dispatch(
                &requested_model,
                candidates,
                &request.body,
                &request.headers,
                stream,
                cancel,
            )
            .await;

        record_dispatch(&mut entry, &outcome);
        match outcome.terminal {
            Terminal::Cancelled => {
                entry.outcome = LogOutcome::Cancelled;
                entry.total_ms = Some(elapsed_ms(started));
                self.logger.emit(entry);
                Err(RelayError::Cancelled)
            }
            Terminal::Exhausted => {
                let last_status = outcome
                    .reply
                    .as_ref()
                    .and_then(|reply| reply.status)
                    .unwrap_or(503);
                let message = outcome
                    .reply
                    .as_ref()
                    .and_then(|reply| reply.error_message())
                    .unwrap_or_else(|| "no provider produced a response".to_string());
                entry.outcome = LogOutcome::Exhausted;
                entry.status = Some(last_status);
                entry.error = Some(message.clone());
                entry.total_ms = Some(elapsed_ms(started));
                self.logger.emit(entry);
                Err(RelayError::Exhausted {
                    last_status,
                    message,
                    trace_id: request.trace_id,
                })
            }
            Terminal::Success => {
                let (Some(reply), Some(candidate)) = (outcome.reply, outcome.candidate) else {
                    entry.outcome = LogOutcome::Exhausted;
                    entry.total_ms = Some(elapsed_ms(started));
                    self.logger.emit(entry);
                    return Err(RelayError::Exhausted {
                        last_status: 503,
                        message: "no provider produced a response".to_string(),
                        trace_id: request.trace_id,
                    });
                };
                let status = reply.status.unwrap_or(200);
                entry.outcome = LogOutcome::Success;
                entry.status = Some(status);

                match reply.body {
                    Some(ForwardBody::Stream(response)) => {
                        let counter =
                            StreamTokenCounter::new(candidate.protocol, &candidate.target_model);
                        let audit = StreamAudit::new(self.logger.clone(), entry, started);
                        Ok(RelayResponse {
                            status,
                            headers: reply.headers,
                            body: RelayBody::Stream(AuditedStream::new(response, counter, audit)),
                        })
                    }
                    body => {
                        let bytes = match body {
                            Some(ForwardBody::Buffered(bytes)) => bytes,
                            _ => Bytes::new(),
                        };
                        if let Ok(parsed) = serde_json::from_slice::<Value>(&bytes) {
                            entry.usage.output_tokens = count_output(
                                candidate.protocol,
                                &candidate.target_model,
                                &parsed,
                            );
                        }
                        entry.total_ms = Some(elapsed_ms(started));
                        self.logger.emit(entry);
                        Ok(RelayResponse {
                            status,
                            headers: reply.headers,
                            body: RelayBody::Buffered(bytes),
                        })
                    }
                }
            }
        }
    }

    fn base_entry(&self, request: &RelayRequest) -> LogEntry {
        LogEntry {
            trace_id: request.trace_id.clone(),
            request_time_ms: now_millis(),
            caller_id: request.caller.id.clone(),
            caller_name: request.caller.name.clone(),
            requested_model: String::new(),
            target_model: None,
            provider_id: None,
            provider_name: None,
            outcome: LogOutcome::Rejected,
            status: None,
            error: None,
            retry_count: 0,
            attempts: Vec::new(),
            usage: TokenUsage::default(),
            first_byte_ms: None,
            total_ms: None,
            request_headers: redact_headers(&request.headers),
        }
    }

    /// Audits a pre-dispatch rejection and passes the error back through.
    fn reject(&self, mut entry: LogEntry, error: RelayError) -> RelayError {
        entry.outcome = LogOutcome::Rejected;
        entry.error = Some(error.to_string());
        self.logger.emit(entry);
        error
    }
}

fn record_dispatch(entry: &mut LogEntry, outcome: &DispatchOutcome) {
    if let Some(candidate) = &outcome.candidate {
        entry.target_model = Some(candidate.target_model.clone());
        entry.provider_id = Some(candidate.provider_id.clone());
        entry.provider_name = Some(candidate.provider_name.clone());
    }
    entry.retry_count = outcome.retry_count;
    entry.attempts = outcome.attempts.clone();
    entry.first_byte_ms = outcome.reply.as_ref().and_then(|reply| reply.first_byte_ms);
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
