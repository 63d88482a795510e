use crate::payload::{EapSpan, EventTransaction, Span, TraceError, TraceOccurrence, Transaction};
use petgraph::stable_graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handle to a node inside a [`crate::TraceTree`] arena.
pub type NodeId = NodeIndex;

/// Half-open timing interval in milliseconds: `[start, start + duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Space {
    pub start: f64,
    pub duration: f64,
}

impl Space {
    pub fn new(start: f64, duration: f64) -> Self {
        Self {
            start,
            duration: duration.max(0.0),
        }
    }

    pub fn point(at: f64) -> Self {
        Self::new(at, 0.0)
    }

    pub fn from_bounds(start: f64, end: f64) -> Self {
        Self::new(start, end - start)
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn union(&self, other: &Space) -> Space {
        Space::from_bounds(self.start.min(other.start), self.end().max(other.end()))
    }

    pub fn as_array(&self) -> [f64; 2] {
        [self.start, self.duration]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Loading,
    Resolved,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReparentReason {
    #[serde(rename = "pageload server handler")]
    PageloadServerHandler,
}

impl ReparentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReparentReason::PageloadServerHandler => "pageload server handler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Profile {
    Transaction { profile_id: String },
    Continuous { profiler_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsCount {
    pub op: String,
    pub count: usize,
}

/// Chain of single-child spans sharing `(op, description)`, collapsed into one row.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentAutogroup {
    pub op: String,
    pub description: Option<String>,
    pub head: NodeId,
    pub tail: NodeId,
    pub group_count: usize,
}

/// Run of identical sibling spans collapsed into one row. The run is the
/// group's children.
#[derive(Debug, Clone, PartialEq)]
pub struct SiblingAutogroup {
    pub op: String,
    pub description: Option<String>,
    pub group_count: usize,
}

/// Gap between two sibling spans that nothing was instrumented for.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingInstrumentation {
    pub previous_span_id: String,
    pub next_span_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Root,
    Transaction(Transaction),
    Span(Span),
    EapSpan(EapSpan),
    TraceError(TraceError),
    ParentAutogroup(ParentAutogroup),
    SiblingAutogroup(SiblingAutogroup),
    MissingInstrumentation(MissingInstrumentation),
}

impl NodeValue {
    pub fn is_transaction(&self) -> bool {
        matches!(self, NodeValue::Transaction(_))
    }

    /// Classic transactions and EAP segments both own a span tree.
    pub fn is_transaction_like(&self) -> bool {
        match self {
            NodeValue::Transaction(_) => true,
            NodeValue::EapSpan(span) => span.is_transaction,
            _ => false,
        }
    }

    pub fn is_autogroup(&self) -> bool {
        matches!(
            self,
            NodeValue::ParentAutogroup(_) | NodeValue::SiblingAutogroup(_)
        )
    }

    /// Span-like values that may take part in autogrouping and gap detection.
    pub fn is_span_like(&self) -> bool {
        match self {
            NodeValue::Span(_) => true,
            NodeValue::EapSpan(span) => !span.is_transaction,
            _ => false,
        }
    }

    pub fn op(&self) -> Option<&str> {
        match self {
            NodeValue::Transaction(txn) => Some(txn.op.as_str()),
            NodeValue::Span(span) => span.op.as_deref(),
            NodeValue::EapSpan(span) => Some(span.op.as_str()),
            NodeValue::ParentAutogroup(group) => Some(group.op.as_str()),
            NodeValue::SiblingAutogroup(group) => Some(group.op.as_str()),
            _ => None,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            NodeValue::Span(span) => span.description.as_deref(),
            NodeValue::EapSpan(span) => span.description.as_deref(),
            NodeValue::ParentAutogroup(group) => group.description.as_deref(),
            NodeValue::SiblingAutogroup(group) => group.description.as_deref(),
            _ => None,
        }
    }

    /// Identifier of the span this value stands for, if any.
    pub fn span_id(&self) -> Option<&str> {
        match self {
            NodeValue::Span(span) => Some(span.span_id.as_str()),
            NodeValue::EapSpan(span) => Some(span.event_id.as_str()),
            NodeValue::Transaction(txn) => txn.span_id.as_deref(),
            _ => None,
        }
    }

    /// Start and end in epoch seconds, as far as the value knows them.
    fn timestamps(&self) -> (Option<f64>, Option<f64>) {
        match self {
            NodeValue::Transaction(txn) => (txn.start_timestamp, txn.timestamp),
            NodeValue::Span(span) => (span.start_timestamp, span.timestamp),
            NodeValue::EapSpan(span) => (span.start_timestamp, span.end_timestamp),
            NodeValue::TraceError(error) => (None, error.timestamp),
            _ => (None, None),
        }
    }

    /// Timing interval in milliseconds, or `None` when the value carries no
    /// timestamps at all.
    pub fn timing(&self) -> Option<Space> {
        match self.timestamps() {
            (Some(start), Some(end)) => Some(Space::from_bounds(start * 1e3, end * 1e3)),
            (None, Some(at)) | (Some(at), None) => Some(Space::point(at * 1e3)),
            (None, None) => None,
        }
    }
}

/// Fetch key and span count inherited from the owning transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeMetadata {
    pub project_slug: Option<String>,
    pub event_id: Option<String>,
    pub spans: Option<u64>,
}

/// Pre-zoom placement of a transaction's direct children.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct ZoomState {
    pub(crate) direct_children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct TraceTreeNode {
    pub value: NodeValue,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub space: Space,
    pub errors: BTreeMap<String, TraceError>,
    pub occurrences: BTreeMap<String, TraceOccurrence>,
    pub profiles: Vec<Profile>,
    pub metadata: NodeMetadata,
    pub expanded: bool,
    pub can_fetch: bool,
    pub fetch_status: FetchStatus,
    pub zoomed_in: bool,
    pub reparent_reason: Option<ReparentReason>,
    pub ops_breakdown: Vec<OpsCount>,
    pub event: Option<Arc<EventTransaction>>,
    pub depth: Option<usize>,
    pub connectors: Option<Vec<usize>>,
    pub(crate) zoom: Option<ZoomState>,
}

impl TraceTreeNode {
    pub fn new(value: NodeValue, metadata: NodeMetadata) -> Self {
        let can_fetch = match metadata.spans {
            Some(spans) => spans > 1,
            None => value.is_transaction(),
        };
        let space = value.timing().unwrap_or_default();

        let mut node = Self {
            value,
            parent: None,
            children: Vec::new(),
            space,
            errors: BTreeMap::new(),
            occurrences: BTreeMap::new(),
            profiles: Vec::new(),
            metadata,
            expanded: true,
            can_fetch,
            fetch_status: FetchStatus::Idle,
            zoomed_in: false,
            reparent_reason: None,
            ops_breakdown: Vec::new(),
            event: None,
            depth: None,
            connectors: None,
            zoom: None,
        };
        node.collect_issues();
        node.collect_profiles();
        node.expanded = !node.collapsed_by_default();
        node
    }

    pub fn root() -> Self {
        Self::new(NodeValue::Root, NodeMetadata::default())
    }

    fn collect_issues(&mut self) {
        let (errors, occurrences): (Vec<TraceError>, Vec<TraceOccurrence>) = match &self.value {
            NodeValue::Transaction(txn) => (txn.errors.clone(), txn.performance_issues.clone()),
            NodeValue::EapSpan(span) => (span.errors.clone(), span.occurrences.clone()),
            NodeValue::TraceError(error) => (vec![error.clone()], Vec::new()),
            _ => return,
        };
        for error in errors {
            self.add_error(error);
        }
        for occurrence in occurrences {
            self.add_occurrence(occurrence);
        }
    }

    fn collect_profiles(&mut self) {
        let (profile_id, profiler_id) = match &self.value {
            NodeValue::Transaction(txn) => (txn.profile_id.as_deref(), txn.profiler_id.as_deref()),
            NodeValue::EapSpan(span) if span.is_transaction => {
                (span.profile_id.as_deref(), span.profiler_id.as_deref())
            }
            _ => return,
        };

        let mut profiles = Vec::new();
        if let Some(id) = profile_id.map(str::trim).filter(|id| !id.is_empty()) {
            profiles.push(Profile::Transaction {
                profile_id: id.to_string(),
            });
        }
        if let Some(id) = profiler_id.map(str::trim).filter(|id| !id.is_empty()) {
            profiles.push(Profile::Continuous {
                profiler_id: id.to_string(),
            });
        }
        self.profiles = profiles;
    }

    fn collapsed_by_default(&self) -> bool {
        match &self.value {
            NodeValue::EapSpan(span) => span.is_transaction,
            // OkHttp emits a TCP connection span per request on Android; its
            // children are connection noise.
            NodeValue::Span(span) => {
                span.op.as_deref() == Some("http.client")
                    && span.origin.as_deref() == Some("auto.http.okhttp")
            }
            _ => false,
        }
    }

    /// Errors are deduplicated by event id.
    pub fn add_error(&mut self, error: TraceError) {
        self.errors.entry(error.event_id.clone()).or_insert(error);
    }

    pub fn add_occurrence(&mut self, occurrence: TraceOccurrence) {
        self.occurrences
            .entry(occurrence.event_id.clone())
            .or_insert(occurrence);
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || !self.occurrences.is_empty()
    }

    pub fn max_issue_severity(&self) -> &'static str {
        let level = |wanted: &str| {
            self.errors
                .values()
                .any(|error| error.level.as_deref() == Some(wanted))
        };
        if level("fatal") {
            "fatal"
        } else if level("error") {
            "error"
        } else {
            "default"
        }
    }

    pub fn invalidate(&mut self) {
        self.depth = None;
        self.connectors = None;
    }

    /// Row label used by [`crate::TraceTree::serialize`].
    pub fn label(&self) -> String {
        match &self.value {
            NodeValue::Root => "trace root".to_string(),
            NodeValue::Transaction(txn) => {
                let op = if txn.op.is_empty() { "unknown op" } else { &txn.op };
                let name = if txn.transaction.is_empty() {
                    "unknown transaction"
                } else {
                    &txn.transaction
                };
                match self.reparent_reason {
                    Some(reason) => format!("{} - {} ({})", op, name, reason.as_str()),
                    None => format!("{} - {}", op, name),
                }
            }
            NodeValue::Span(span) => format!(
                "{}{} - {}",
                if span.is_prefetch() { "prefetch " } else { "" },
                span.op.as_deref().unwrap_or("unknown span"),
                span.description.as_deref().unwrap_or("unknown description")
            ),
            NodeValue::EapSpan(span) => format!(
                "{} - {}",
                if span.op.is_empty() { "unknown op" } else { &span.op },
                span.description.as_deref().unwrap_or("unknown description")
            ),
            NodeValue::TraceError(error) => error
                .title
                .clone()
                .or_else(|| error.description.clone())
                .unwrap_or_else(|| "unknown title".to_string()),
            NodeValue::ParentAutogroup(group) => {
                format!("parent autogroup ({}: {})", group.op, group.group_count)
            }
            NodeValue::SiblingAutogroup(group) => {
                format!("sibling autogroup ({}: {})", group.op, group.group_count)
            }
            NodeValue::MissingInstrumentation(_) => "missing instrumentation".to_string(),
        }
    }
}
