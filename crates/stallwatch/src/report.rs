//! Diagnostics boundary: attribute values, the sink and context-provider
//! contracts, and the default tracing-backed sink.
//!
//! Everything here is fire-and-forget.  A broken sink or context provider
//! degrades reporting but can never reach back into detection: the traits
//! are infallible at this boundary and are only ever called from the
//! reporter thread, never from the monitor's timing loop or the primary
//! thread.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single attribute value: string or number, mirroring what typical
/// crash/analytics backends accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Float(f64),
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<u64> for AttrValue {
    fn from(n: u64) -> Self {
        i64::try_from(n).map_or(Self::Float(n as f64), Self::Int)
    }
}

impl From<f64> for AttrValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Ordered attribute map attached to every report.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Best-effort description of current application state, used to enrich
/// reports (e.g. the identifier of the active screen).
pub trait ContextProvider: Send + Sync {
    /// Must be cheap and non-blocking; may return an empty string.
    fn current_context_label(&self) -> String;
}

/// Context provider that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

impl ContextProvider for NoContext {
    fn current_context_label(&self) -> String {
        String::new()
    }
}

/// A context provider with a fixed label.  Handy for hosts whose context
/// never changes, and for tests.
#[derive(Debug, Clone)]
pub struct StaticContext(pub String);

impl ContextProvider for StaticContext {
    fn current_context_label(&self) -> String {
        self.0.clone()
    }
}

/// External diagnostics backend (crash reporter, analytics pipeline, ...).
///
/// Implementations must swallow their own failures; nothing is surfaced
/// back to the caller.  Calls may be slow (network I/O) — they run on the
/// reporter thread, off the detection path.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, kind: &str, attributes: &Attributes);
}

/// Default sink that emits reports as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, kind: &str, attributes: &Attributes) {
        let detail = serde_json::to_string(attributes).unwrap_or_default();
        tracing::warn!(kind, attributes = %detail, "diagnostics report");
    }
}
