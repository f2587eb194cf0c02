//! Retry/failover control: a per-request finite state machine.
//!
//! The pure transition logic (`classify`, `FailoverMachine`) is separated
//! from I/O so the retry and failover rules stay unit-testable with a fake
//! forwarder. The driver (`DispatchController`) walks
//! select -> attempt -> backoff-wait until success, exhaustion, or
//! cancellation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::AttemptRecord;
use crate::forward::{ForwardReply, Forwarder};
use crate::rules::Candidate;
use crate::selector::RoundRobinSelector;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts_per_candidate: u32,
    pub backoff: Duration,
    pub transport_error_failover_immediately: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_candidate: 3,
            backoff: Duration::from_millis(1000),
            transport_error_failover_immediately: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptClass {
    Success,
    /// Server-error class: retry the same candidate after a backoff wait.
    RetrySame,
    /// Client-error class: no same-candidate retry, move on immediately.
    Failover,
}

/// Classifies one attempt outcome. 2xx succeeds; >= 500 retries the same
/// candidate; other statuses fail over. Transport errors and per-attempt
/// timeouts take the >= 500 class unless configured to fail over
/// immediately.
pub fn classify(status: Option<u16>, transport_error: bool, policy: &RetryPolicy) -> AttemptClass {
    if transport_error || status.is_none() {
        return if policy.transport_error_failover_immediately {
            AttemptClass::Failover
        } else {
            AttemptClass::RetrySame
        };
    }
    match status {
        Some(status) if (200..300).contains(&status) => AttemptClass::Success,
        Some(status) if status >= 500 => AttemptClass::RetrySame,
        Some(_) => AttemptClass::Failover,
        None => unreachable!("handled above"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Wait, then retry the same candidate.
    Backoff(Duration),
    /// Candidate exhausted or rejected; select the next one with the
    /// attempt count reset. No wait penalty on the switch itself.
    NextCandidate,
    Finished,
}

/// Per-candidate attempt accounting for one request.
#[derive(Debug)]
pub struct FailoverMachine {
    policy: RetryPolicy,
    attempts_on_candidate: u32,
}

impl FailoverMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts_on_candidate: 0,
        }
    }

    pub fn begin_candidate(&mut self) {
        self.attempts_on_candidate = 0;
    }

    /// 1-based index the next attempt on the current candidate will carry.
    pub fn next_attempt_index(&self) -> u32 {
        self.attempts_on_candidate + 1
    }

    pub fn on_result(&mut self, class: AttemptClass) -> Step {
        self.attempts_on_candidate += 1;
        match class {
            AttemptClass::Success => Step::Finished,
            AttemptClass::Failover => Step::NextCandidate,
            AttemptClass::RetrySame => {
                if self.attempts_on_candidate < self.policy.max_attempts_per_candidate {
                    Step::Backoff(self.policy.backoff)
                } else {
                    Step::NextCandidate
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Success,
    Exhausted,
    Cancelled,
}

pub struct DispatchOutcome {
    pub terminal: Terminal,
    /// Last reply obtained, success or failure. `None` only when no
    /// attempt completed (cancellation before any reply).
    pub reply: Option<ForwardReply>,
    /// Candidate of the last attempt.
    pub candidate: Option<Candidate>,
    pub attempts: Vec<AttemptRecord>,
    /// Total failed attempts across all candidates.
    pub retry_count: u32,
}

pub struct DispatchController<'a> {
    pub forwarder: &'a dyn Forwarder,
    pub selector: &'a RoundRobinSelector,
    pub policy: RetryPolicy,
}

impl DispatchController<'_> {
    /// Drives forwarding attempts across the candidate list until a
    /// terminal state. Every transition into an attempt produces exactly
    /// one `AttemptRecord`; the backoff wait suspends only this request.
    pub async fn dispatch(
        &self,
        key: &str,
        candidates: Vec<Candidate>,
        body: &Value,
        headers: &BTreeMap<String, String>,
        stream: bool,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut retry_count = 0u32;
        let mut last_reply: Option<ForwardReply> = None;
        let mut last_candidate: Option<Candidate> = None;
        let mut remaining = candidates;
        let mut machine = FailoverMachine::new(self.policy);

        'select: loop {
            let Some((candidate, rest)) = self.selector.select(&remaining, key) else {
                return DispatchOutcome {
                    terminal: Terminal::Exhausted,
                    reply: last_reply,
                    candidate: last_candidate,
                    attempts,
                    retry_count,
                };
            };
            remaining = rest;
            machine.begin_candidate();
            last_candidate = Some(candidate.clone());

            loop {
                let attempt_index = machine.next_attempt_index();
                let reply = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        attempts.push(cancelled_record(&candidate, attempt_index));
                        return DispatchOutcome {
                            terminal: Terminal::Cancelled,
                            reply: last_reply,
                            candidate: last_candidate,
                            attempts,
                            retry_count,
                        };
                    }
                    reply = self.forwarder.forward(&candidate, body, headers, stream) => reply,
                };

                attempts.push(attempt_record(&candidate, attempt_index, &reply));
                let class = classify(reply.status, reply.transport_error.is_some(), &self.policy);
                last_reply = Some(reply);

                match machine.on_result(class) {
                    Step::Finished => {
                        return DispatchOutcome {
                            terminal: Terminal::Success,
                            reply: last_reply,
                            candidate: last_candidate,
                            attempts,
                            retry_count,
                        };
                    }
                    Step::NextCandidate => {
                        retry_count += 1;
                        continue 'select;
                    }
                    Step::Backoff(delay) => {
                        retry_count += 1;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return DispatchOutcome {
                                    terminal: Terminal::Cancelled,
                                    reply: last_reply,
                                    candidate: last_candidate,
                                    attempts,
                                    retry_count,
                                };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

fn attempt_record(candidate: &Candidate, attempt: u32, reply: &ForwardReply) -> AttemptRecord {
    AttemptRecord {
        provider_id: candidate.provider_id.clone(),
        provider_name: candidate.provider_name.clone(),
        attempt,
        status: reply.status,
        error: reply.error_message(),
        first_byte_ms: reply.first_byte_ms,
        total_ms: Some(reply.total_ms),
        cancelled: false,
    }
}

fn cancelled_record(candidate: &Candidate, attempt: u32) -> AttemptRecord {
    AttemptRecord {
        provider_id: candidate.provider_id.clone(),
        provider_name: candidate.provider_name.clone(),
        attempt,
        status: None,
        error: Some("cancelled".to_string()),
        first_byte_ms: None,
        total_ms: None,
        cancelled: true,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::forward::ForwardBody;
    use crate::rotation::InMemoryCursorStore;
    use crate::rules::WireProtocol;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn classifies_statuses_per_protocol() {
        let policy = policy();
        assert_eq!(classify(Some(200), false, &policy), AttemptClass::Success);
        assert_eq!(classify(Some(204), false, &policy), AttemptClass::Success);
        assert_eq!(classify(Some(404), false, &policy), AttemptClass::Failover);
        assert_eq!(classify(Some(429), false, &policy), AttemptClass::Failover);
        assert_eq!(classify(Some(500), false, &policy), AttemptClass::RetrySame);
        assert_eq!(classify(Some(503), false, &policy), AttemptClass::RetrySame);
        assert_eq!(classify(None, true, &policy), AttemptClass::RetrySame);
    }

    #[test]
    fn transport_errors_can_be_configured_to_fail_over() {
        let policy = RetryPolicy {
            transport_error_failover_immediately: true,
            ..RetryPolicy::default()
        };
        assert_eq!(classify(None, true, &policy), AttemptClass::Failover);
        assert_eq!(classify(Some(500), false, &policy), AttemptClass::RetrySame);
    }

    #[test]
    fn machine_retries_same_candidate_up_to_limit_then_switches() {
        let mut machine = FailoverMachine::new(policy());
        machine.begin_candidate();
        assert_eq!(
            machine.on_result(AttemptClass::RetrySame),
            Step::Backoff(Duration::from_millis(1000))
        );
        assert_eq!(
            machine.on_result(AttemptClass::RetrySame),
            Step::Backoff(Duration::from_millis(1000))
        );
        // Third failure on the same candidate: switch, no extra wait.
        assert_eq!(machine.on_result(AttemptClass::RetrySame), Step::NextCandidate);

        machine.begin_candidate();
        assert_eq!(machine.next_attempt_index(), 1);
        assert_eq!(machine.on_result(AttemptClass::Success), Step::Finished);
    }

    #[test]
    fn client_errors_switch_without_retry() {
        let mut machine = FailoverMachine::new(policy());
        machine.begin_candidate();
        assert_eq!(machine.on_result(AttemptClass::Failover), Step::NextCandidate);
    }

    struct ScriptedForwarder {
        // provider id -> statuses returned on successive attempts.
        scripts: Mutex<HashMap<String, Vec<Option<u16>>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedForwarder {
        fn new(scripts: HashMap<String, Vec<Option<u16>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Forwarder for ScriptedForwarder {
        async fn forward(
            &self,
            candidate: &Candidate,
            _body: &Value,
            _headers: &BTreeMap<String, String>,
            _stream: bool,
        ) -> ForwardReply {
            self.calls
                .lock()
                .unwrap()
                .push((candidate.provider_id.clone(), Instant::now()));
            let status = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&candidate.provider_id)
                .and_then(|statuses| {
                    if statuses.is_empty() {
                        None
                    } else {
                        Some(statuses.remove(0))
                    }
                })
                .unwrap_or(Some(200));
            match status {
                None => ForwardReply {
                    status: None,
                    headers: BTreeMap::new(),
                    body: None,
                    transport_error: Some("connection refused".to_string()),
                    first_byte_ms: None,
                    total_ms: 0,
                },
                Some(status) => ForwardReply {
                    status: Some(status),
                    headers: BTreeMap::new(),
                    body: Some(ForwardBody::Buffered(bytes::Bytes::from_static(b"{}"))),
                    transport_error: None,
                    first_byte_ms: Some(1),
                    total_ms: 1,
                },
            }
        }
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            provider_id: id.to_string(),
            provider_name: id.to_string(),
            base_url: format!("https://{id}"),
            protocol: WireProtocol::OpenAi,
            api_key: String::new(),
            target_model: "t".to_string(),
            priority: 0,
            weight: 1,
        }
    }

    fn selector() -> RoundRobinSelector {
        RoundRobinSelector::new(Arc::new(InMemoryCursorStore::new()))
    }

    async fn dispatch(
        forwarder: &ScriptedForwarder,
        selector: &RoundRobinSelector,
        candidates: Vec<Candidate>,
        policy: RetryPolicy,
    ) -> DispatchOutcome {
        let controller = DispatchController {
            forwarder,
            selector,
            policy,
        };
        controller
            .dispatch(
                "gpt-4o",
                candidates,
                &json!({"model": "t"}),
                &BTreeMap::new(),
                false,
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_same_candidate_three_times_with_backoff() {
        let forwarder = ScriptedForwarder::new(HashMap::from([
            ("a".to_string(), vec![Some(503), Some(503), Some(503)]),
            ("b".to_string(), vec![Some(200)]),
        ]));
        let selector = selector();

        let started = tokio::time::Instant::now();
        let outcome = dispatch(
            &forwarder,
            &selector,
            vec![candidate("a"), candidate("b")],
            policy(),
        )
        .await;

        assert_eq!(outcome.terminal, Terminal::Success);
        let ids: Vec<String> = forwarder.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "a", "a", "b"]);
        // Two backoff waits of 1000ms between the three attempts on "a";
        // the switch to "b" itself adds no wait.
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
        assert_eq!(outcome.retry_count, 3);
        assert_eq!(outcome.attempts.len(), 4);
        assert_eq!(outcome.attempts[0].attempt, 1);
        assert_eq!(outcome.attempts[2].attempt, 3);
        assert_eq!(outcome.attempts[3].attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_fail_over_after_a_single_attempt() {
        let forwarder = ScriptedForwarder::new(HashMap::from([
            ("a".to_string(), vec![Some(404)]),
            ("b".to_string(), vec![Some(200)]),
        ]));
        let selector = selector();

        let started = tokio::time::Instant::now();
        let outcome = dispatch(
            &forwarder,
            &selector,
            vec![candidate("a"), candidate("b")],
            policy(),
        )
        .await;

        assert_eq!(outcome.terminal, Terminal::Success);
        let ids: Vec<String> = forwarder.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(outcome.candidate.unwrap().provider_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_preserves_all_nine_attempt_records() {
        let forwarder = ScriptedForwarder::new(HashMap::from([
            ("a".to_string(), vec![Some(500); 3]),
            ("b".to_string(), vec![Some(500); 3]),
            ("c".to_string(), vec![Some(500); 3]),
        ]));
        let selector = selector();

        let outcome = dispatch(
            &forwarder,
            &selector,
            vec![candidate("a"), candidate("b"), candidate("c")],
            policy(),
        )
        .await;

        assert_eq!(outcome.terminal, Terminal::Exhausted);
        assert_eq!(outcome.attempts.len(), 9);
        assert_eq!(outcome.retry_count, 9);
        assert_eq!(outcome.reply.unwrap().status, Some(500));
        // Each candidate was tried exactly three times.
        for id in ["a", "b", "c"] {
            let count = outcome
                .attempts
                .iter()
                .filter(|record| record.provider_id == id)
                .count();
            assert_eq!(count, 3, "candidate {id}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_take_the_server_error_class_by_default() {
        let forwarder = ScriptedForwarder::new(HashMap::from([
            ("a".to_string(), vec![None, None, None]),
            ("b".to_string(), vec![Some(200)]),
        ]));
        let selector = selector();

        let outcome = dispatch(
            &forwarder,
            &selector,
            vec![candidate("a"), candidate("b")],
            policy(),
        )
        .await;

        assert_eq!(outcome.terminal, Terminal::Success);
        let ids: Vec<String> = forwarder.calls().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "a", "a", "b"]);
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_candidate_list_is_exhausted_with_zero_attempts() {
        let forwarder = ScriptedForwarder::new(HashMap::new());
        let selector = selector();

        let outcome = dispatch(&forwarder, &selector, Vec::new(), policy()).await;
        assert_eq!(outcome.terminal, Terminal::Exhausted);
        assert!(outcome.attempts.is_empty());
        assert!(outcome.reply.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_further_attempts() {
        let forwarder = Arc::new(ScriptedForwarder::new(HashMap::from([(
            "a".to_string(),
            vec![Some(503); 3],
        )])));
        let selector = selector();
        let cancel = CancellationToken::new();

        let controller = DispatchController {
            forwarder: forwarder.as_ref(),
            selector: &selector,
            policy: policy(),
        };
        let body = json!({"model": "t"});
        let headers = BTreeMap::new();
        let dispatch = controller.dispatch(
            "gpt-4o",
            vec![candidate("a")],
            &body,
            &headers,
            false,
            &cancel,
        );
        tokio::pin!(dispatch);

        // Let the first attempt complete and enter the backoff wait.
        tokio::select! {
            biased;
            _ = &mut dispatch => panic!("dispatch finished early"),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        cancel.cancel();
        let outcome = (&mut dispatch).await;

        assert_eq!(outcome.terminal, Terminal::Cancelled);
        assert_eq!(forwarder.calls().len(), 1);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(!outcome.attempts[0].cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_any_attempt_records_a_cancelled_marker() {
        let forwarder = ScriptedForwarder::new(HashMap::new());
        let selector = selector();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let controller = DispatchController {
            forwarder: &forwarder,
            selector: &selector,
            policy: policy(),
        };
        let outcome = controller
            .dispatch(
                "gpt-4o",
                vec![candidate("a")],
                &json!({"model": "t"}),
                &BTreeMap::new(),
                false,
                &cancel,
            )
            .await;

        assert_eq!(outcome.terminal, Terminal::Cancelled);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].cancelled);
        assert!(forwarder.calls().is_empty());
    }
}
