//! Audit events and the logging dispatcher.
//!
//! The dispatcher is purely a sink: it forwards structured events to the
//! caller-registered callback and has no influence on control flow or on the
//! intervention decision.

use crate::intervention::Intervention;
use crate::ledger::RuleInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Structured audit record for one transaction, flushed at the logging phase.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Engine-assigned transaction id.
    pub transaction_id: String,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,

    /// Engine build identity plus connector information, if set.
    pub producer: String,

    /// Client address, if the connection phase ran.
    pub client_addr: Option<String>,

    /// Client port.
    pub client_port: Option<i32>,

    /// Server address.
    pub server_addr: Option<String>,

    /// Server port.
    pub server_port: Option<i32>,

    /// HTTP method, if fed via the URI call.
    pub method: Option<String>,

    /// Request URI.
    pub uri: Option<String>,

    /// HTTP version string.
    pub http_version: Option<String>,

    /// The final effective intervention.
    pub intervention: Intervention,

    /// All matched-rule records in firing order.
    pub matched_rules: Vec<RuleInfo>,
}

impl AuditEvent {
    /// Serialize the event as a JSON record.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Receiver for audit events.
///
/// A single sink is registered per engine and invoked synchronously from the
/// logging phase, at most once per transaction. The sink may block; the
/// engine never retries a dispatch.
pub trait LogSink: Send + Sync {
    /// Handle one audit event.
    fn on_event(&self, event: &AuditEvent);
}

impl<F> LogSink for F
where
    F: Fn(&AuditEvent) + Send + Sync,
{
    fn on_event(&self, event: &AuditEvent) {
        self(event)
    }
}

/// Forwards audit events to the registered sink.
#[derive(Clone, Default)]
pub struct LogDispatcher {
    sink: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for LogDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDispatcher")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl LogDispatcher {
    /// Create a dispatcher with no sink; events are dropped until one is set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the sink that receives audit events.
    pub fn set_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sink = Some(sink);
    }

    /// Check if a sink is registered.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Forward one event to the sink, if any.
    pub fn dispatch(&self, event: &AuditEvent) {
        match &self.sink {
            Some(sink) => sink.on_event(event),
            None => debug!(
                transaction_id = %event.transaction_id,
                "no log sink registered, dropping audit event"
            ),
        }
    }
}
