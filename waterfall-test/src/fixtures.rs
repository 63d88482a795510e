use waterfall_core::payload::{
    EapSpan, EapTraceItem, Measurement, Span, TraceError, TraceMetadata, TracePayload,
    TraceSplitResults, Transaction,
};
use waterfall_core::{Config, NodeId, TraceTree};

/// Epoch seconds every fixture is offset from.
pub const START: f64 = 1_709_164_800.0;

pub const PROJECT: &str = "project";

pub fn transaction(event_id: &str, name: &str, start: f64, end: f64) -> Transaction {
    Transaction {
        event_id: event_id.to_string(),
        project_slug: Some(PROJECT.to_string()),
        transaction: name.to_string(),
        op: "http.server".to_string(),
        start_timestamp: Some(START + start),
        timestamp: Some(START + end),
        ..Default::default()
    }
}

pub fn span(span_id: &str, op: &str, description: &str, start: f64, end: f64) -> Span {
    Span {
        span_id: span_id.to_string(),
        op: Some(op.to_string()),
        description: Some(description.to_string()),
        start_timestamp: Some(START + start),
        timestamp: Some(START + end),
        ..Default::default()
    }
}

pub fn child_span(parent: &str, span_id: &str, op: &str, description: &str, start: f64, end: f64) -> Span {
    Span {
        parent_span_id: Some(parent.to_string()),
        ..span(span_id, op, description, start, end)
    }
}

pub fn trace_error(event_id: &str, title: &str, level: &str, at: f64) -> TraceError {
    TraceError {
        event_id: event_id.to_string(),
        project_slug: Some(PROJECT.to_string()),
        title: Some(title.to_string()),
        level: Some(level.to_string()),
        timestamp: Some(START + at),
        ..Default::default()
    }
}

pub fn eap_span(event_id: &str, op: &str, is_transaction: bool, start: f64, end: f64) -> EapSpan {
    EapSpan {
        event_id: event_id.to_string(),
        is_transaction,
        project_slug: Some(PROJECT.to_string()),
        op: op.to_string(),
        description: Some(format!("{op} {event_id}")),
        start_timestamp: Some(START + start),
        end_timestamp: Some(START + end),
        ..Default::default()
    }
}

pub fn millis(value: f64) -> Measurement {
    Measurement::millis(value)
}

pub fn classic(transactions: Vec<Transaction>) -> TracePayload {
    TracePayload::Classic(TraceSplitResults {
        transactions,
        orphan_errors: vec![],
    })
}

pub fn eap(items: Vec<EapSpan>) -> TracePayload {
    TracePayload::Eap(items.into_iter().map(EapTraceItem::Span).collect())
}

/// Builds with the settings `Config::load` finds, so a run can point
/// `WATERFALL_CONFIG` at an alternative tuning.
pub fn build(payload: TracePayload) -> TraceTree {
    TraceTree::from_trace_with_config(payload, TraceMetadata::default(), Config::load())
}

/// A `parent` transaction (0s..2s, span id `parent-span-id`) with a single
/// nested `child` transaction (1s..4s).
pub fn nested_transactions() -> TraceTree {
    let mut parent = transaction("parent-event-id", "parent", 0.0, 2.0);
    parent.span_id = Some("parent-span-id".to_string());
    parent.children = vec![transaction("child-event-id", "child", 1.0, 4.0)];
    build(classic(vec![parent]))
}

pub fn node(tree: &TraceTree, id: &str) -> NodeId {
    tree.find_by_id(id)
        .unwrap_or_else(|| panic!("no node with id {id}"))
}

/// Snapshot labels flattened in visible order.
pub fn visible_labels(tree: &mut TraceTree) -> Vec<String> {
    tree.build();
    tree.list().iter().map(|&id| tree[id].label()).collect()
}
