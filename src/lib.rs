pub mod audit;
pub mod config;
pub mod context;
mod error;
pub mod forward;
pub mod gateway;
pub mod http;
pub mod identity;
pub mod redact;
pub mod retry;
pub mod rotation;
pub mod rules;
pub mod selector;
pub mod store;
pub mod stream;
pub mod substitute;
pub mod tokens;

pub use audit::{
    AttemptRecord, AuditLogger, LogEntry, LogOutcome, LogSink, MemoryLogSink, TracingLogSink,
    generate_trace_id,
};
pub use config::{ApiKeyConfig, RelayConfig, Settings};
pub use context::{RequestContext, TokenUsage};
pub use error::{RelayError, Result};
pub use forward::{ForwardBody, ForwardReply, Forwarder, HttpForwarder};
pub use gateway::{Gateway, GatewayBuilder, RelayBody, RelayRequest, RelayResponse};
pub use http::{AppState, TRACE_ID_HEADER, router};
pub use identity::{CallerIdentity, IdentityResolver, StaticKeyResolver};
pub use redact::{mask_credential, redact_headers};
pub use retry::{AttemptClass, DispatchOutcome, FailoverMachine, RetryPolicy, Step, Terminal};
pub use rotation::{CursorStore, InMemoryCursorStore};
pub use rules::{
    Candidate, Condition, ModelMapping, ProviderNode, RoutingRule, RoutingSnapshot, RuleEngine,
    RuleLogic, RuleOp, RuleScope, RuleSet, WireProtocol,
};
pub use selector::RoundRobinSelector;
pub use store::{InMemoryMappingStore, MappingStore};
pub use substitute::substitute_model;
pub use tokens::{StreamTokenCounter, count_input, count_output};
