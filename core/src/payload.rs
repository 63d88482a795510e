//! Wire shapes consumed by the tree builder and the zoom controller.
//!
//! Timestamps on the wire are epoch seconds; the tree works in milliseconds.

use crate::error::{Result, TraceTreeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A measurement attached to a transaction (`{"value": 120, "unit": "millisecond"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Measurement {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Measurement {
    pub fn millis(value: f64) -> Self {
        Self {
            value,
            unit: Some("millisecond".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TraceError {
    pub event_id: String,
    #[serde(default)]
    pub issue_id: Option<u64>,
    #[serde(default)]
    pub project_slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    /// Span the error was raised in, when known.
    #[serde(default)]
    pub span: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Performance issue occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TraceOccurrence {
    pub event_id: String,
    #[serde(default)]
    pub issue_id: Option<u64>,
    #[serde(default)]
    pub project_slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub culprit: Option<String>,
    #[serde(default)]
    pub span: Vec<String>,
    #[serde(default)]
    pub suspect_spans: Vec<String>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
}

impl TraceOccurrence {
    pub fn involves_span(&self, span_id: &str) -> bool {
        self.span.iter().chain(&self.suspect_spans).any(|s| s == span_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Transaction {
    pub event_id: String,
    #[serde(default)]
    pub project_slug: Option<String>,
    #[serde(default)]
    pub project_id: Option<u64>,
    #[serde(default)]
    pub transaction: String,
    #[serde(rename = "transaction.op", default)]
    pub op: String,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub parent_event_id: Option<String>,
    #[serde(default)]
    pub start_timestamp: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub sdk_name: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub profiler_id: Option<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, Measurement>,
    #[serde(default)]
    pub errors: Vec<TraceError>,
    #[serde(default)]
    pub performance_issues: Vec<TraceOccurrence>,
    #[serde(default)]
    pub children: Vec<Transaction>,
    /// Spans shipped inline with the transaction, if the producer embedded them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spans: Option<Vec<Span>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Span {
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub start_timestamp: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub exclusive_time: Option<f64>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    /// `http.request.prefetch` may arrive as a bool or as a string.
    pub fn is_prefetch(&self) -> bool {
        match self.data.get("http.request.prefetch") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s == "true",
            _ => false,
        }
    }
}

/// Span from the event analytics platform, where segments are spans flagged
/// `is_transaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EapSpan {
    pub event_id: String,
    pub is_transaction: bool,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub project_slug: Option<String>,
    #[serde(default)]
    pub project_id: Option<u64>,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_timestamp: Option<f64>,
    #[serde(default)]
    pub end_timestamp: Option<f64>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub profiler_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<TraceError>,
    #[serde(default)]
    pub occurrences: Vec<TraceOccurrence>,
    /// Flat `"measurements.fcp": 100` style values, always milliseconds.
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub children: Vec<EapSpan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EapTraceItem {
    Span(EapSpan),
    Error(TraceError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TraceSplitResults {
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub orphan_errors: Vec<TraceError>,
}

/// Body of a trace fetch: either the classic transaction tree or a flat EAP list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TracePayload {
    Eap(Vec<EapTraceItem>),
    Classic(TraceSplitResults),
}

impl TracePayload {
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Ok(serde_json::from_value(value)?)
            }
            other => Err(TraceTreeError::MalformedTrace(format!(
                "expected an object or an array, got {}",
                other
            ))),
        }
    }
}

impl From<TraceSplitResults> for TracePayload {
    fn from(trace: TraceSplitResults) -> Self {
        TracePayload::Classic(trace)
    }
}

impl From<Vec<EapTraceItem>> for TracePayload {
    fn from(items: Vec<EapTraceItem>) -> Self {
        TracePayload::Eap(items)
    }
}

/// Trace-level metadata returned alongside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TraceMeta {
    /// transaction event id -> number of spans it owns
    #[serde(default)]
    pub transaction_child_count_map: HashMap<String, u64>,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub performance_issues: u64,
    #[serde(default)]
    pub projects: u64,
    #[serde(default)]
    pub transactions: u64,
    #[serde(default)]
    pub span_count: u64,
    #[serde(default)]
    pub span_count_map: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReplayRecord {
    pub fn start_ms(&self) -> f64 {
        self.started_at.timestamp_millis() as f64
    }

    pub fn end_ms(&self) -> f64 {
        self.finished_at.timestamp_millis() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TraceMetadata {
    #[serde(default)]
    pub meta: Option<TraceMeta>,
    #[serde(default)]
    pub replay: Option<ReplayRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Event returned by the span fetch (`{project_slug}:{event_id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventTransaction {
    #[serde(default, alias = "eventID")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<EventEntry>,
}

impl EventTransaction {
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            event_id: None,
            entries: vec![EventEntry {
                kind: "spans".to_string(),
                data: serde_json::to_value(spans).unwrap_or_default(),
            }],
        }
    }

    /// Spans carried in the `spans` entry; no entry means no spans.
    pub fn spans(&self) -> std::result::Result<Vec<Span>, serde_json::Error> {
        match self.entries.iter().find(|entry| entry.kind == "spans") {
            Some(entry) if !entry.data.is_null() => serde_json::from_value(entry.data.clone()),
            _ => Ok(Vec::new()),
        }
    }
}
