//! The transaction state machine.
//!
//! One transaction per HTTP exchange. Phase-advancing calls evaluate the
//! applicable rules against the variable store, update the matched-rule
//! ledger and fold fired actions into the intervention resolver. Phases only
//! advance forward and none is ever evaluated twice.

use crate::body::{extract_body_variables, url_decode, BodyBuffer};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::intervention::{Intervention, InterventionResolver};
use crate::ledger::{MatchedRuleLedger, RulesInfo};
use crate::logging::{AuditEvent, LogDispatcher};
use crate::rules::{Action, Phase, RuleSet, RuleUnit};
use crate::variables::{Collection, VariableStore};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Progress of a transaction through the inspection phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TxState {
    Created,
    Connection,
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
    Completed,
    CleanedUp,
}

/// The mutable unit of work for one HTTP exchange.
///
/// A transaction holds a non-owning reference to its immutable rule set and
/// exclusively owns its variable store, body buffers and ledger, so a set can
/// be shared by many concurrent transactions without locking.
pub struct Transaction {
    id: String,
    config: EngineConfig,
    rules: Arc<RuleSet>,
    dispatcher: LogDispatcher,
    producer: String,

    state: TxState,
    store: VariableStore,
    resolver: InterventionResolver,
    ledger: MatchedRuleLedger,

    pending_request_headers: Vec<(String, String)>,
    pending_response_headers: Vec<(String, String)>,
    request_content_type: Option<String>,
    response_content_type: Option<String>,
    request_body: BodyBuffer,
    response_body: BodyBuffer,

    client_addr: Option<String>,
    client_port: Option<i32>,
    server_addr: Option<String>,
    server_port: Option<i32>,
    method: Option<String>,
    uri: Option<String>,
    http_version: Option<String>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("rules", &self.rules.len())
            .field("ledger", &self.ledger.len())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        rules: Arc<RuleSet>,
        config: EngineConfig,
        dispatcher: LogDispatcher,
        producer: String,
    ) -> Self {
        let request_body = BodyBuffer::new(config.request_body_limit, config.body_limit_action);
        let response_body = BodyBuffer::new(config.response_body_limit, config.body_limit_action);

        Self {
            id: generate_transaction_id(),
            config,
            rules,
            dispatcher,
            producer,
            state: TxState::Created,
            store: VariableStore::new(),
            resolver: InterventionResolver::new(),
            ledger: MatchedRuleLedger::new(),
            pending_request_headers: Vec::new(),
            pending_response_headers: Vec::new(),
            request_content_type: None,
            response_content_type: None,
            request_body,
            response_body,
            client_addr: None,
            client_port: None,
            server_addr: None,
            server_port: None,
            method: None,
            uri: None,
            http_version: None,
        }
    }

    /// Engine-assigned transaction id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Populate connection variables and evaluate connection-phase rules.
    ///
    /// Must be the first phase-advancing call on the transaction.
    pub fn process_connection(
        &mut self,
        client_addr: &str,
        client_port: i32,
        server_addr: &str,
        server_port: i32,
    ) -> EngineResult<Intervention> {
        self.ensure_live()?;
        if self.state != TxState::Created {
            return Err(self.invalid_state("process_connection"));
        }
        self.state = TxState::Connection;

        self.store
            .set(Collection::Connection, "client_addr", client_addr);
        self.store
            .set(Collection::Connection, "client_port", client_port.to_string());
        self.store
            .set(Collection::Connection, "server_addr", server_addr);
        self.store
            .set(Collection::Connection, "server_port", server_port.to_string());

        self.client_addr = Some(client_addr.to_string());
        self.client_port = Some(client_port);
        self.server_addr = Some(server_addr.to_string());
        self.server_port = Some(server_port);

        self.evaluate_phase(Phase::Connection)?;
        Ok(self.intervention())
    }

    /// Populate URI, method, version and query-argument variables.
    ///
    /// Expected before header processing; triggers no rule evaluation by
    /// itself. The variables become visible to the request phases.
    pub fn process_uri(
        &mut self,
        uri: &str,
        method: &str,
        http_version: &str,
    ) -> EngineResult<()> {
        self.ensure_live()?;
        if self.state > TxState::Connection {
            return Err(self.invalid_state("process_uri"));
        }

        let method = method.to_uppercase();
        self.store.set(Collection::Uri, "uri", uri);
        self.store.set(Collection::Uri, "method", &method);
        self.store.set(Collection::Uri, "http_version", http_version);

        if let Some((_, query)) = uri.split_once('?') {
            self.store.set(Collection::Uri, "query_string", query);
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = match pair.split_once('=') {
                    Some((k, v)) => (k, v),
                    None => (pair, ""),
                };
                self.store
                    .append(Collection::Uri, url_decode(key), url_decode(value));
            }
        }

        self.method = Some(method);
        self.uri = Some(uri.to_string());
        self.http_version = Some(http_version.to_string());
        Ok(())
    }

    /// Append to the pending request-header collection.
    pub fn add_request_header(&mut self, name: &str, value: &str) -> EngineResult<()> {
        self.ensure_live()?;
        if self.state >= TxState::RequestHeaders {
            return Err(self.invalid_state("add_request_header"));
        }
        self.pending_request_headers
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Freeze the request headers into the store and evaluate the
    /// request-headers phase. May only be called once per transaction.
    pub fn process_request_headers(&mut self) -> EngineResult<Intervention> {
        self.ensure_live()?;
        if self.state >= TxState::RequestHeaders {
            return Err(self.invalid_state("process_request_headers"));
        }
        self.state = TxState::RequestHeaders;

        for (name, value) in std::mem::take(&mut self.pending_request_headers) {
            if name.eq_ignore_ascii_case("content-type") {
                self.request_content_type = Some(value.clone());
            }
            self.store
                .append(Collection::RequestHeaders, name.to_lowercase(), value);
        }

        self.evaluate_phase(Phase::RequestHeaders)?;
        Ok(self.intervention())
    }

    /// Append a chunk to the bounded request-body buffer.
    pub fn append_request_body(&mut self, chunk: &[u8]) -> EngineResult<()> {
        self.ensure_live()?;
        if self.state >= TxState::RequestBody {
            return Err(self.invalid_state("append_request_body"));
        }
        self.request_body.append(chunk)
    }

    /// Feed a disk-spooled request body through the bounded append path.
    pub fn request_body_from_file(&mut self, path: impl AsRef<Path>) -> EngineResult<()> {
        self.ensure_live()?;
        if self.state >= TxState::RequestBody {
            return Err(self.invalid_state("request_body_from_file"));
        }
        let path = path.as_ref();
        let contents = std::fs::read(path).map_err(|source| EngineError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        self.request_body.append(&contents)
    }

    /// Extract request-body variables and evaluate the request-body phase.
    pub fn process_request_body(&mut self) -> EngineResult<Intervention> {
        self.ensure_live()?;
        if self.state < TxState::RequestHeaders || self.state >= TxState::RequestBody {
            return Err(self.invalid_state("process_request_body"));
        }
        self.state = TxState::RequestBody;

        extract_body_variables(
            &mut self.store,
            Collection::RequestBody,
            self.request_content_type.as_deref(),
            self.request_body.as_bytes(),
        );

        self.evaluate_phase(Phase::RequestBody)?;
        Ok(self.intervention())
    }

    /// Append to the pending response-header collection.
    pub fn add_response_header(&mut self, name: &str, value: &str) -> EngineResult<()> {
        self.ensure_live()?;
        if self.state >= TxState::ResponseHeaders {
            return Err(self.invalid_state("add_response_header"));
        }
        self.pending_response_headers
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Freeze the response headers and status into the store and evaluate the
    /// response-headers phase.
    pub fn process_response_headers(
        &mut self,
        code: i32,
        protocol: &str,
    ) -> EngineResult<Intervention> {
        self.ensure_live()?;
        if self.state < TxState::RequestHeaders || self.state >= TxState::ResponseHeaders {
            return Err(self.invalid_state("process_response_headers"));
        }
        self.state = TxState::ResponseHeaders;

        self.store
            .set(Collection::ResponseHeaders, "status", code.to_string());
        self.store
            .set(Collection::ResponseHeaders, "protocol", protocol);
        for (name, value) in std::mem::take(&mut self.pending_response_headers) {
            if name.eq_ignore_ascii_case("content-type") {
                self.response_content_type = Some(value.clone());
            }
            self.store
                .append(Collection::ResponseHeaders, name.to_lowercase(), value);
        }

        self.evaluate_phase(Phase::ResponseHeaders)?;
        Ok(self.intervention())
    }

    /// Append a chunk to the bounded response-body buffer.
    pub fn append_response_body(&mut self, chunk: &[u8]) -> EngineResult<()> {
        self.ensure_live()?;
        if self.state >= TxState::ResponseBody {
            return Err(self.invalid_state("append_response_body"));
        }
        self.response_body.append(chunk)
    }

    /// Extract response-body variables and evaluate the response-body phase.
    pub fn process_response_body(&mut self) -> EngineResult<Intervention> {
        self.ensure_live()?;
        if self.state < TxState::ResponseHeaders || self.state >= TxState::ResponseBody {
            return Err(self.invalid_state("process_response_body"));
        }
        self.state = TxState::ResponseBody;

        extract_body_variables(
            &mut self.store,
            Collection::ResponseBody,
            self.response_content_type.as_deref(),
            self.response_body.as_bytes(),
        );

        self.evaluate_phase(Phase::ResponseBody)?;
        Ok(self.intervention())
    }

    /// The accumulated response body.
    #[must_use]
    pub fn response_body(&self) -> &[u8] {
        self.response_body.as_bytes()
    }

    /// Length of the accumulated response body.
    #[must_use]
    pub fn response_body_len(&self) -> usize {
        self.response_body.len()
    }

    /// Evaluate logging-phase rules, flush the ledger through the logging
    /// dispatcher and complete the transaction.
    ///
    /// Callers may invoke this early when abandoning an exchange after a
    /// disruptive intervention; the audit event is dispatched at most once.
    pub fn process_logging(&mut self) -> EngineResult<Intervention> {
        self.ensure_live()?;
        if self.state >= TxState::Completed {
            return Err(self.invalid_state("process_logging"));
        }

        let evaluation = self.evaluate_phase(Phase::Logging);
        self.state = TxState::Completed;

        if self.config.audit_enabled {
            let event = self.audit_event();
            self.dispatcher.dispatch(&event);
        }

        evaluation?;
        Ok(self.intervention())
    }

    /// The current effective intervention. Read-only and idempotent.
    #[must_use]
    pub fn intervention(&self) -> Intervention {
        self.resolver.intervention()
    }

    /// Ordered snapshot of all matched-rule records.
    #[must_use]
    pub fn matched_rules(&self) -> RulesInfo {
        self.ledger.snapshot()
    }

    /// Release all transaction-owned resources.
    ///
    /// Safe to call from any state and idempotent; any other operation after
    /// cleanup fails with [`EngineError::UseAfterCleanup`].
    pub fn cleanup(&mut self) {
        self.state = TxState::CleanedUp;
        self.store.clear();
        self.ledger.clear();
        self.resolver = InterventionResolver::new();
        self.pending_request_headers.clear();
        self.pending_response_headers.clear();
        self.request_body.clear();
        self.response_body.clear();
    }

    fn ensure_live(&self) -> EngineResult<()> {
        if self.state == TxState::CleanedUp {
            return Err(EngineError::UseAfterCleanup);
        }
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            operation,
            state: format!("{:?}", self.state),
        }
    }

    /// Run the rules of one phase.
    ///
    /// Rules execute in ascending id order unless a `skip-to` action jumps
    /// within the phase; total steps are capped to guard against loops, and
    /// hitting the cap abandons the phase without failing the transaction.
    fn evaluate_phase(&mut self, phase: Phase) -> EngineResult<()> {
        self.resolver.begin_phase();

        let set = Arc::clone(&self.rules);
        let units = set.rules_for_phase(phase);
        if units.is_empty() {
            return Ok(());
        }
        debug!(transaction = %self.id, phase = %phase, rules = units.len(), "evaluating phase");

        let cap = self.config.evaluation_step_cap;
        let mut steps = 0usize;
        let mut index = 0usize;
        // Chained rules that matched and await the rest of their chain
        let mut pending: Vec<(Arc<RuleUnit>, String)> = Vec::new();

        while index < units.len() {
            steps += 1;
            if steps > cap {
                warn!(
                    transaction = %self.id,
                    phase = %phase,
                    cap,
                    "evaluation step cap exceeded, abandoning phase"
                );
                return Err(EngineError::EvaluationStepCapExceeded { phase, cap });
            }

            let rule = &units[index];
            let Some(matched) = rule.evaluate(&self.store) else {
                if !pending.is_empty() {
                    pending.clear();
                }
                index += 1;
                continue;
            };

            if rule.is_chained() {
                pending.push((Arc::clone(rule), matched.parameter));
                index += 1;
                continue;
            }

            let mut jump = None;
            let mut stop_phase = false;
            for (chained, parameter) in pending.drain(..) {
                self.fire_rule(&chained, &parameter, &mut jump, &mut stop_phase);
            }
            self.fire_rule(rule, &matched.parameter, &mut jump, &mut stop_phase);

            if stop_phase {
                debug!(transaction = %self.id, phase = %phase, rule = rule.id, "allow action, phase short-circuited");
                break;
            }

            if let Some(target) = jump {
                match units.iter().position(|r| r.id == target) {
                    Some(position) => {
                        index = position;
                        continue;
                    }
                    None => {
                        warn!(rule = target, phase = %phase, "skip-to target not found in phase");
                    }
                }
            }
            index += 1;
        }

        Ok(())
    }

    /// Execute a matched rule's action list in declared order.
    fn fire_rule(
        &mut self,
        rule: &RuleUnit,
        parameter: &str,
        jump: &mut Option<i64>,
        stop_phase: &mut bool,
    ) {
        if rule.is_recordable() {
            self.ledger
                .record(rule.id, rule.score, &rule.message, parameter);
        }

        for action in &rule.actions {
            match action {
                // Ledger recording happens once per firing, above
                Action::Log | Action::Chain => {}
                Action::Allow => *stop_phase = true,
                Action::Block { status } => self.resolver.disrupt(*status, "", &rule.message),
                Action::Redirect { status, url } => {
                    self.resolver.disrupt(*status, url, &rule.message)
                }
                Action::Pause { ms } => self.resolver.add_pause(*ms),
                Action::SkipTo { target } => *jump = Some(*target),
                Action::SetVar { key, value } => {
                    self.store.set(Collection::Tx, key.clone(), value.clone());
                }
            }
        }
    }

    fn audit_event(&self) -> AuditEvent {
        AuditEvent {
            transaction_id: self.id.clone(),
            timestamp: Utc::now(),
            producer: self.producer.clone(),
            client_addr: self.client_addr.clone(),
            client_port: self.client_port,
            server_addr: self.server_addr.clone(),
            server_port: self.server_port,
            method: self.method.clone(),
            uri: self.uri.clone(),
            http_version: self.http_version.clone(),
            intervention: self.intervention(),
            matched_rules: self.ledger.snapshot().items,
        }
    }
}

fn generate_transaction_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tx-{:x}-{:04x}", timestamp, seq)
}
