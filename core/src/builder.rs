//! Turns trace payloads into a [`TraceTree`].

use crate::config::Config;
use crate::error::Result;
use crate::node::{
    NodeId, NodeMetadata, NodeValue, OpsCount, ReparentReason, Space, TraceTreeNode, ZoomState,
};
use crate::payload::{
    EapSpan, EapTraceItem, EventTransaction, Measurement, ReplayRecord, Span, TraceError,
    TraceMetadata, TracePayload, TraceSplitResults, Transaction,
};
use crate::tree::TraceTree;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const WEB_VITALS: &[&str] = &[
    "fp", "fcp", "lcp", "fid", "cls", "ttfb", "ttfb.requesttime", "inp",
];

const MOBILE_VITALS: &[&str] = &[
    "app_start_cold",
    "app_start_warm",
    "time_to_initial_display",
    "time_to_full_display",
    "frames_total",
    "frames_slow",
    "frames_frozen",
    "frames_slow_rate",
    "frames_frozen_rate",
    "stall_count",
    "stall_total_time",
    "stall_longest_time",
    "stall_percentage",
];

/// Vitals drawn as markers on the timeline.
const RENDERABLE_MEASUREMENTS: &[&str] = &[
    "fp",
    "fcp",
    "lcp",
    "ttfb",
    "time_to_initial_display",
    "time_to_full_display",
];

const EAP_MEASUREMENT_PREFIX: &str = "measurements.";

/// A vital recorded on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Vital {
    pub key: String,
    pub measurement: Measurement,
}

/// Timeline marker derived from a renderable vital.
#[derive(Debug, Clone, PartialEq)]
pub struct Indicator {
    /// Absolute position in milliseconds.
    pub start: f64,
    pub kind: String,
    pub label: String,
    pub measurement: Measurement,
    pub node: NodeId,
}

fn indicator_label(key: &str) -> String {
    match key {
        "time_to_initial_display" => "TTID".to_string(),
        "time_to_full_display" => "TTFD".to_string(),
        other => other.to_uppercase(),
    }
}

/// Offset in milliseconds, or `None` for units that are not durations.
fn measurement_millis(measurement: &Measurement) -> Option<f64> {
    match measurement.unit.as_deref() {
        None | Some("millisecond") => Some(measurement.value),
        Some("nanosecond") => Some(measurement.value / 1e6),
        Some("microsecond") => Some(measurement.value / 1e3),
        Some("second") => Some(measurement.value * 1e3),
        Some(_) => None,
    }
}

impl TraceTree {
    pub fn from_trace(payload: TracePayload, metadata: TraceMetadata) -> Self {
        Self::from_trace_with_config(payload, metadata, Config::default())
    }

    pub fn from_trace_with_config(
        payload: TracePayload,
        metadata: TraceMetadata,
        config: Config,
    ) -> Self {
        let mut tree = TraceTree::new(config);
        let root = tree.root();

        match payload {
            TracePayload::Classic(trace) => tree.build_classic(trace, &metadata),
            TracePayload::Eap(items) => tree.build_eap(items),
        }

        tree.sort_subtree(root, true);
        tree.indicators.sort_by(|a, b| a.start.total_cmp(&b.start));
        tree.compute_root_space(metadata.replay.as_ref());

        tracing::debug!(
            nodes = tree.node_count(),
            indicators = tree.indicators.len(),
            "built trace tree spanning {:?}",
            tree[root].space
        );
        tree
    }

    /// Parses a trace fetch body and builds it with the default config.
    pub fn from_json(body: &str, metadata: TraceMetadata) -> Result<Self> {
        let payload = TracePayload::from_json(body)?;
        Ok(Self::from_trace(payload, metadata))
    }

    // Classic traces --------------------------------------------------------

    fn build_classic(&mut self, trace: TraceSplitResults, metadata: &TraceMetadata) {
        let root = self.root();
        let counts = metadata
            .meta
            .as_ref()
            .map(|meta| &meta.transaction_child_count_map);

        for transaction in trace.transactions {
            self.visit_transaction(root, transaction, counts);
        }

        for error in trace.orphan_errors {
            self[root].add_error(error.clone());
            let node = self.add_node(TraceTreeNode::new(
                NodeValue::TraceError(error),
                NodeMetadata::default(),
            ));
            self.append_child(root, node);
        }

        self.swap_pageload_server_handlers();
    }

    fn visit_transaction(
        &mut self,
        parent: NodeId,
        mut transaction: Transaction,
        counts: Option<&HashMap<String, u64>>,
    ) -> NodeId {
        let children = std::mem::take(&mut transaction.children);
        let spans = transaction.spans.take();
        let measurements = std::mem::take(&mut transaction.measurements);

        let metadata = NodeMetadata {
            project_slug: transaction.project_slug.clone(),
            event_id: Some(transaction.event_id.clone()),
            spans: counts.and_then(|counts| counts.get(&transaction.event_id).copied()),
        };
        let node = TraceTreeNode::new(NodeValue::Transaction(transaction), metadata);
        self.record_issues_on_root(&node);

        let id = self.add_node(node);
        self.append_child(parent, id);
        self.collect_measurements(id, measurements);

        for child in children {
            self.visit_transaction(id, child, counts);
        }

        if let Some(spans) = spans {
            self.from_spans(id, spans, None);
        }
        id
    }

    /// A browser pageload is the real entry point of a trace even when the
    /// server handler that rendered the page started it.
    fn swap_pageload_server_handlers(&mut self) {
        let root = self.root();
        for server in self[root].children.clone() {
            let is_server = matches!(
                &self[server].value,
                NodeValue::Transaction(txn) if txn.op == "http.server"
            );
            if !is_server {
                continue;
            }

            let pageload = self[server].children.iter().copied().find(|&child| {
                matches!(&self[child].value, NodeValue::Transaction(txn) if txn.op == "pageload")
            });
            let Some(pageload) = pageload else {
                continue;
            };

            let Some((_, at)) = self.detach(server) else {
                continue;
            };
            self.detach(pageload);
            self.insert_child(root, at, pageload);
            self.append_child(pageload, server);
            self[server].reparent_reason = Some(ReparentReason::PageloadServerHandler);
        }
    }

    // EAP traces ------------------------------------------------------------

    fn build_eap(&mut self, items: Vec<EapTraceItem>) {
        let root = self.root();

        // Nested children are flattened, remembering who nested them.
        let mut flat: Vec<(EapSpan, Option<String>)> = Vec::new();
        let mut orphan_errors: Vec<TraceError> = Vec::new();
        let mut stack: Vec<(EapSpan, Option<String>)> = Vec::new();
        for item in items.into_iter().rev() {
            match item {
                EapTraceItem::Span(span) => stack.push((span, None)),
                EapTraceItem::Error(error) => orphan_errors.push(error),
            }
        }
        orphan_errors.reverse();
        while let Some((mut span, nested_parent)) = stack.pop() {
            let children = std::mem::take(&mut span.children);
            for child in children.into_iter().rev() {
                stack.push((child, Some(span.event_id.clone())));
            }
            flat.push((span, nested_parent));
        }

        let mut by_id: HashMap<String, NodeId> = HashMap::new();
        let mut created = Vec::with_capacity(flat.len());
        for (mut span, nested_parent) in flat {
            let measurements = std::mem::take(&mut span.measurements);
            let link = nested_parent.or_else(|| span.parent_span_id.clone());
            let metadata = NodeMetadata {
                project_slug: span.project_slug.clone(),
                event_id: Some(span.event_id.clone()),
                spans: None,
            };
            let event_id = span.event_id.clone();
            let node = TraceTreeNode::new(NodeValue::EapSpan(span), metadata);
            self.record_issues_on_root(&node);

            let id = self.add_node(node);
            by_id.entry(event_id).or_insert(id);
            created.push((id, link, measurements));
        }

        for (id, link, measurements) in created {
            let parent = match link.as_ref().and_then(|link| by_id.get(link).copied()) {
                Some(candidate) if !self.is_ancestor_or_self(id, candidate) => Some(candidate),
                Some(_) => {
                    tracing::warn!(
                        "EAP span link {:?} would form a cycle, attaching to root",
                        link
                    );
                    None
                }
                None => None,
            };
            self.append_child(parent.unwrap_or(root), id);

            let converted = measurements.into_iter().map(|(key, value)| {
                let key = key
                    .strip_prefix(EAP_MEASUREMENT_PREFIX)
                    .unwrap_or(&key)
                    .to_string();
                (key, Measurement { value, unit: None })
            });
            self.collect_measurements(id, converted.collect());
        }

        for error in orphan_errors {
            self[root].add_error(error.clone());
            let node = self.add_node(TraceTreeNode::new(
                NodeValue::TraceError(error),
                NodeMetadata::default(),
            ));
            self.append_child(root, node);
        }

        self.propagate_eap_issues();
        self.compute_ops_breakdown();
    }

    /// True when `node` is `candidate` or one of its current ancestors.
    fn is_ancestor_or_self(&self, node: NodeId, candidate: NodeId) -> bool {
        candidate == node || self.ancestors(candidate).any(|id| id == node)
    }

    /// A collapsed segment still has to surface the issues of its spans.
    fn propagate_eap_issues(&mut self) {
        let mut moves = Vec::new();
        self.for_each_child(self.root(), |id, node| {
            if !matches!(node.value, NodeValue::EapSpan(_)) || !node.has_errors() {
                return;
            }
            moves.push((id, node.errors.clone(), node.occurrences.clone()));
        });

        for (id, errors, occurrences) in moves {
            let Some(segment) = self.parent_transaction(id) else {
                continue;
            };
            let target = &mut self[segment];
            for error in errors.into_values() {
                target.add_error(error);
            }
            for occurrence in occurrences.into_values() {
                target.add_occurrence(occurrence);
            }
        }
    }

    fn compute_ops_breakdown(&mut self) {
        let nodes = self.find_all(self.root(), |node| matches!(node.value, NodeValue::EapSpan(_)));
        for id in nodes {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            self.for_each_child(id, |_, child| {
                if let NodeValue::EapSpan(span) = &child.value {
                    *counts.entry(span.op.clone()).or_default() += 1;
                }
            });

            let mut breakdown: Vec<OpsCount> = counts
                .into_iter()
                .map(|(op, count)| OpsCount { op, count })
                .collect();
            breakdown.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.op.cmp(&b.op)));
            self[id].ops_breakdown = breakdown;
        }
    }

    // Shared helpers --------------------------------------------------------

    fn record_issues_on_root(&mut self, node: &TraceTreeNode) {
        let root = self.root();
        for error in node.errors.values() {
            self[root].add_error(error.clone());
        }
        for occurrence in node.occurrences.values() {
            self[root].add_occurrence(occurrence.clone());
        }
    }

    fn collect_measurements(&mut self, node: NodeId, measurements: BTreeMap<String, Measurement>) {
        let start = self[node].space.start;
        let mut vitals = Vec::new();

        for (key, measurement) in measurements {
            if !WEB_VITALS.contains(&key.as_str()) && !MOBILE_VITALS.contains(&key.as_str()) {
                continue;
            }

            if RENDERABLE_MEASUREMENTS.contains(&key.as_str()) {
                if let Some(offset) = measurement_millis(&measurement) {
                    self.indicators.push(Indicator {
                        start: start + offset,
                        kind: key.clone(),
                        label: indicator_label(&key),
                        measurement: measurement.clone(),
                        node,
                    });
                }
            }
            vitals.push(Vital { key, measurement });
        }

        if !vitals.is_empty() {
            self.vitals.entry(node).or_default().extend(vitals);
        }
    }

    /// Stable sort by start time over the subtree of `node`. Nested
    /// transactions keep their own order unless `into_transactions`.
    pub(crate) fn sort_subtree(&mut self, node: NodeId, into_transactions: bool) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let mut children = std::mem::take(&mut self[id].children);
            children.sort_by(|a, b| self[*a].space.start.total_cmp(&self[*b].space.start));
            stack.extend(
                children
                    .iter()
                    .copied()
                    .filter(|&child| into_transactions || !self[child].value.is_transaction()),
            );
            self[id].children = children;
        }
    }

    fn compute_root_space(&mut self, replay: Option<&ReplayRecord>) {
        let mut start = f64::INFINITY;
        let mut end = f64::NEG_INFINITY;
        let mut error_points = Vec::new();

        self.for_each_child(self.root(), |_, node| match &node.value {
            NodeValue::Transaction(_) | NodeValue::Span(_) | NodeValue::EapSpan(_) => {
                if node.value.timing().is_some() {
                    start = start.min(node.space.start);
                    end = end.max(node.space.end());
                }
            }
            NodeValue::TraceError(error) => {
                if let Some(timestamp) = error.timestamp {
                    error_points.push(timestamp * 1e3);
                }
            }
            _ => {}
        });

        for indicator in &self.indicators {
            start = start.min(indicator.start);
            end = end.max(indicator.start);
        }

        if let Some(replay) = replay {
            start = start.min(replay.start_ms());
            end = end.max(replay.end_ms());
        }

        let root = self.root();
        if start.is_finite() {
            for point in error_points {
                start = start.min(point);
                end = end.max(point);
            }
            self[root].space = Space::from_bounds(start, end);
        } else if let Some(latest) = error_points.into_iter().reduce(f64::max) {
            tracing::debug!("trace has no timeline, anchoring root at its latest error");
            self[root].space = Space::point(latest);
        } else {
            self[root].space = Space::default();
        }
    }

    // Span subtrees ---------------------------------------------------------

    /// Materializes `spans` under the transaction `parent` and moves child
    /// transactions under the span they were started from.
    ///
    /// Returns the bounds of the new spans, or `None` when `parent` is
    /// already zoomed in or no span carries a timestamp.
    pub fn from_spans(
        &mut self,
        parent: NodeId,
        spans: Vec<Span>,
        event: Option<Arc<EventTransaction>>,
    ) -> Option<Space> {
        if self[parent].zoomed_in {
            return None;
        }

        let direct_children = self[parent].children.clone();
        self[parent].zoom = Some(ZoomState {
            direct_children: direct_children.clone(),
        });
        if let Some(event) = event {
            self[parent].event = Some(event);
        }

        let metadata = NodeMetadata {
            project_slug: self[parent].metadata.project_slug.clone(),
            event_id: self[parent].metadata.event_id.clone(),
            spans: None,
        };
        let owner_errors: Vec<TraceError> = self[parent].errors.values().cloned().collect();
        let owner_occurrences: Vec<_> = self[parent].occurrences.values().cloned().collect();

        let mut by_id: HashMap<String, NodeId> = HashMap::new();
        let mut created = Vec::with_capacity(spans.len());
        let mut bounds: Option<Space> = None;

        for span in spans {
            let span_id = span.span_id.clone();
            let link = span.parent_span_id.clone();
            let mut node = TraceTreeNode::new(NodeValue::Span(span), metadata.clone());

            for error in owner_errors.iter().filter(|e| e.span.as_deref() == Some(span_id.as_str())) {
                node.add_error(error.clone());
            }
            for occurrence in owner_occurrences.iter().filter(|o| o.involves_span(&span_id)) {
                node.add_occurrence(occurrence.clone());
            }
            if node.value.timing().is_some() {
                bounds = Some(bounds.map_or(node.space, |b| b.union(&node.space)));
            }

            let id = self.add_node(node);
            by_id.entry(span_id).or_insert(id);
            created.push((id, link));
        }

        for (id, link) in created {
            let span_parent = link
                .and_then(|link| by_id.get(&link).copied())
                .filter(|&candidate| !self.is_ancestor_or_self(id, candidate));
            self.append_child(span_parent.unwrap_or(parent), id);
        }

        for child in direct_children {
            let target = match &self[child].value {
                NodeValue::Transaction(txn) => txn
                    .parent_span_id
                    .as_ref()
                    .and_then(|span_id| by_id.get(span_id).copied()),
                _ => None,
            };
            if let Some(span) = target {
                self.detach(child);
                self.append_child(span, child);
            }
        }

        self.sort_subtree(parent, false);
        self[parent].zoomed_in = true;
        self.invalidate(parent, true);
        bounds
    }

    // Merging ---------------------------------------------------------------

    /// Grafts the top-level nodes of `other` after the current ones.
    pub fn append_tree(&mut self, mut other: TraceTree) {
        let root = self.root();
        let had_children = !self[root].children.is_empty();

        let mut order = Vec::new();
        other.for_each_child(other.root(), |id, _| order.push(id));

        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        remap.insert(other.root(), root);
        for old in order {
            let Some(mut node) = other.graph.remove_node(old) else {
                continue;
            };
            let old_parent = node.parent.take();
            node.children.clear();
            node.invalidate();

            let new = self.add_node(node);
            remap.insert(old, new);
            if let Some(parent) = old_parent.and_then(|p| remap.get(&p).copied()) {
                self.append_child(parent, new);
            }
        }

        for &new in remap.values() {
            let node = &mut self[new];
            if let NodeValue::ParentAutogroup(group) = &mut node.value {
                group.head = remap.get(&group.head).copied().unwrap_or(group.head);
                group.tail = remap.get(&group.tail).copied().unwrap_or(group.tail);
            }
            if let Some(zoom) = &mut node.zoom {
                for id in zoom.direct_children.iter_mut() {
                    *id = remap.get(id).copied().unwrap_or(*id);
                }
            }
        }

        for (old, vitals) in other.vitals.drain() {
            if let Some(&new) = remap.get(&old) {
                self.vitals.insert(new, vitals);
            }
        }
        for mut indicator in other.indicators.drain(..) {
            if let Some(&new) = remap.get(&indicator.node) {
                indicator.node = new;
                self.indicators.push(indicator);
            }
        }
        self.indicators.sort_by(|a, b| a.start.total_cmp(&b.start));

        let other_root = &other.graph[other.root()];
        let errors: Vec<_> = other_root.errors.values().cloned().collect();
        let occurrences: Vec<_> = other_root.occurrences.values().cloned().collect();
        let other_space = other_root.space;

        let node = &mut self[root];
        for error in errors {
            node.add_error(error);
        }
        for occurrence in occurrences {
            node.add_occurrence(occurrence);
        }
        node.space = if had_children {
            node.space.union(&other_space)
        } else {
            other_space
        };
        self.invalidate(root, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ReplayRecord, TraceMeta, TraceOccurrence};
    use chrono::{TimeZone, Utc};

    const START: f64 = 1_709_164_800.0;

    fn txn(event_id: &str, start: f64, end: f64, children: Vec<Transaction>) -> Transaction {
        Transaction {
            event_id: event_id.to_string(),
            project_slug: Some("project".to_string()),
            transaction: event_id.to_string(),
            op: "http.server".to_string(),
            start_timestamp: Some(start),
            timestamp: Some(end),
            children,
            ..Default::default()
        }
    }

    fn classic(transactions: Vec<Transaction>, orphan_errors: Vec<TraceError>) -> TracePayload {
        TracePayload::Classic(TraceSplitResults {
            transactions,
            orphan_errors,
        })
    }

    fn span(id: &str, parent: Option<&str>, start: f64, end: f64) -> Span {
        Span {
            span_id: id.to_string(),
            parent_span_id: parent.map(str::to_string),
            start_timestamp: Some(start),
            timestamp: Some(end),
            op: Some("db".to_string()),
            description: Some("select".to_string()),
            ..Default::default()
        }
    }

    fn eap(event_id: &str, is_transaction: bool, op: &str, children: Vec<EapSpan>) -> EapSpan {
        EapSpan {
            event_id: event_id.to_string(),
            is_transaction,
            op: op.to_string(),
            children,
            ..Default::default()
        }
    }

    #[test]
    fn test_root_space_covers_nested_transactions() {
        let tree = TraceTree::from_trace(
            classic(
                vec![txn("a", START, START + 2.0, vec![txn("b", START + 1.0, START + 4.0, vec![])])],
                vec![],
            ),
            TraceMetadata::default(),
        );
        let root = &tree[tree.root()];
        assert_eq!(root.space, Space::new(START * 1e3, 4000.0));
        assert_eq!(root.children().len(), 1);
        tree.validate().unwrap();
    }

    #[test]
    fn test_errors_only_trace_anchors_at_latest_error() {
        let error = |id: &str, ts: f64| TraceError {
            event_id: id.to_string(),
            timestamp: Some(ts),
            ..Default::default()
        };
        let tree = TraceTree::from_trace(
            classic(vec![], vec![error("e1", START), error("e2", START + 5.0)]),
            TraceMetadata::default(),
        );
        assert_eq!(tree[tree.root()].space, Space::new((START + 5.0) * 1e3, 0.0));
        assert_eq!(tree[tree.root()].errors.len(), 2);

        let empty = TraceTree::from_trace(classic(vec![], vec![]), TraceMetadata::default());
        assert_eq!(empty[empty.root()].space, Space::default());
    }

    #[test]
    fn test_orphan_error_extends_end() {
        let tree = TraceTree::from_trace(
            classic(
                vec![txn("a", START, START + 1.0, vec![])],
                vec![TraceError {
                    event_id: "e".into(),
                    level: Some("error".into()),
                    timestamp: Some(START + 5.0),
                    ..Default::default()
                }],
            ),
            TraceMetadata::default(),
        );
        assert_eq!(tree[tree.root()].space, Space::new(START * 1e3, 5000.0));
    }

    #[test]
    fn test_replay_extends_start() {
        let started_at = Utc.timestamp_opt(START as i64, 0).unwrap();
        let finished_at = Utc.timestamp_opt(START as i64 + 5, 0).unwrap();
        let tree = TraceTree::from_trace(
            classic(vec![txn("a", START + 0.1, START + 0.1, vec![])], vec![]),
            TraceMetadata {
                meta: None,
                replay: Some(ReplayRecord {
                    started_at,
                    finished_at,
                }),
            },
        );
        assert_eq!(tree[tree.root()].space, Space::new(START * 1e3, 5000.0));
    }

    #[test]
    fn test_measurements_become_sorted_indicators() {
        let mut transaction = txn("a", START, START + 1.0, vec![]);
        transaction.measurements.insert(
            "ttfb".into(),
            Measurement {
                value: -5000.0,
                unit: Some("millisecond".into()),
            },
        );
        transaction
            .measurements
            .insert("lcp".into(), Measurement {
                value: 5.0,
                unit: Some("second".into()),
            });
        transaction
            .measurements
            .insert("cls".into(), Measurement {
                value: 0.1,
                unit: None,
            });
        transaction
            .measurements
            .insert("custom".into(), Measurement::millis(1.0));

        let tree = TraceTree::from_trace(classic(vec![transaction], vec![]), TraceMetadata::default());
        let node = tree[tree.root()].children()[0];

        assert_eq!(tree.indicators.len(), 2);
        assert_eq!(tree.indicators[0].label, "TTFB");
        assert_eq!(tree.indicators[0].start, START * 1e3 - 5000.0);
        assert_eq!(tree.indicators[1].label, "LCP");
        assert_eq!(tree.vitals[&node].len(), 3);
        assert_eq!(tree[tree.root()].space, Space::new(START * 1e3 - 5000.0, 10_000.0));
        assert_eq!(tree[node].space, Space::new(START * 1e3, 1000.0));
    }

    #[test]
    fn test_children_sorted_by_start() {
        let tree = TraceTree::from_trace(
            classic(
                vec![txn("last", 1.0, 2.0, vec![]), txn("first", 0.0, 1.0, vec![])],
                vec![],
            ),
            TraceMetadata::default(),
        );
        let labels: Vec<String> = tree[tree.root()]
            .children()
            .iter()
            .map(|&id| tree[id].label())
            .collect();
        assert_eq!(labels, vec!["http.server - first", "http.server - last"]);
    }

    #[test]
    fn test_can_fetch_from_child_count_map() {
        let mut meta = TraceMeta::default();
        meta.transaction_child_count_map.insert("many".into(), 10);
        meta.transaction_child_count_map.insert("one".into(), 1);
        let tree = TraceTree::from_trace(
            classic(
                vec![
                    txn("many", 0.0, 1.0, vec![]),
                    txn("one", 0.0, 1.0, vec![]),
                    txn("unknown", 0.0, 1.0, vec![]),
                ],
                vec![],
            ),
            TraceMetadata {
                meta: Some(meta),
                replay: None,
            },
        );
        let can_fetch = |id: &str| tree[tree.find_by_id(id).unwrap()].can_fetch;
        assert!(can_fetch("many"));
        assert!(!can_fetch("one"));
        assert!(can_fetch("unknown"));
    }

    #[test]
    fn test_pageload_swaps_with_server_handler() {
        let mut server = txn("server", 2.0, 3.0, vec![]);
        let mut pageload = txn("pageload", 1.0, 5.0, vec![txn("api", 4.0, 5.0, vec![])]);
        pageload.op = "pageload".into();
        server.children.push(pageload);

        let tree = TraceTree::from_trace(classic(vec![server], vec![]), TraceMetadata::default());
        let root = tree.root();
        let top = tree[root].children()[0];
        assert_eq!(tree.find_by_id("pageload"), Some(top));

        let server = tree.find_by_id("server").unwrap();
        assert_eq!(tree[server].parent(), Some(top));
        assert_eq!(
            tree[server].reparent_reason,
            Some(ReparentReason::PageloadServerHandler)
        );
        assert_eq!(tree[top].children()[0], server);
        tree.validate().unwrap();
    }

    #[test]
    fn test_embedded_spans_are_built() {
        let mut transaction = txn("a", START, START + 2.0, vec![]);
        transaction.spans = Some(vec![
            span("s1", None, START, START + 1.0),
            span("s2", Some("s1"), START + 0.5, START + 0.7),
        ]);
        let tree = TraceTree::from_trace(classic(vec![transaction], vec![]), TraceMetadata::default());
        let txn_id = tree.find_by_id("a").unwrap();
        let s1 = tree.find_by_id("s1").unwrap();
        let s2 = tree.find_by_id("s2").unwrap();

        assert!(tree[txn_id].zoomed_in);
        assert_eq!(tree[s1].parent(), Some(txn_id));
        assert_eq!(tree[s2].parent(), Some(s1));
        assert!(!tree[s1].can_fetch);
        tree.validate().unwrap();
    }

    #[test]
    fn test_from_spans_reparents_matching_transactions() {
        let mut child = txn("child", START + 0.2, START + 0.4, vec![]);
        child.parent_span_id = Some("0000".into());
        let mut stray = txn("stray", START + 0.1, START + 0.3, vec![]);
        stray.parent_span_id = Some("does not exist".into());

        let mut tree = TraceTree::from_trace(
            classic(vec![txn("root", START, START + 1.0, vec![child, stray])], vec![]),
            TraceMetadata::default(),
        );
        let root_txn = tree.find_by_id("root").unwrap();
        let bounds = tree.from_spans(
            root_txn,
            vec![span("0000", None, START, START + 0.5)],
            None,
        );
        assert_eq!(bounds, Some(Space::new(START * 1e3, 500.0)));

        let span_node = tree.find_by_id("0000").unwrap();
        let child = tree.find_by_id("child").unwrap();
        let stray = tree.find_by_id("stray").unwrap();
        assert_eq!(tree[child].parent(), Some(span_node));
        assert_eq!(tree[stray].parent(), Some(root_txn));
        assert!(tree[root_txn].zoomed_in);

        assert_eq!(tree.from_spans(root_txn, vec![span("x", None, 0.0, 1.0)], None), None);
        assert!(tree.find_by_id("x").is_none());
        tree.validate().unwrap();
    }

    #[test]
    fn test_from_spans_attaches_owner_issues() {
        let mut transaction = txn("a", START, START + 1.0, vec![]);
        transaction.errors.push(TraceError {
            event_id: "err".into(),
            span: Some("s1".into()),
            ..Default::default()
        });
        transaction.performance_issues.push(TraceOccurrence {
            event_id: "occ".into(),
            suspect_spans: vec!["s2".into()],
            ..Default::default()
        });
        let mut tree = TraceTree::from_trace(classic(vec![transaction], vec![]), TraceMetadata::default());
        let a = tree.find_by_id("a").unwrap();
        tree.from_spans(
            a,
            vec![span("s1", None, START, START + 0.1), span("s2", None, START, START + 0.1)],
            None,
        );

        let s1 = tree.find(a, |n| n.value.span_id() == Some("s1")).unwrap();
        let s2 = tree.find(a, |n| n.value.span_id() == Some("s2")).unwrap();
        assert!(tree[s1].errors.contains_key("err"));
        assert!(tree[s2].occurrences.contains_key("occ"));
        assert!(tree[s1].occurrences.is_empty());
    }

    #[test]
    fn test_span_cycle_falls_back_to_transaction() {
        let mut tree = TraceTree::from_trace(
            classic(vec![txn("a", START, START + 1.0, vec![])], vec![]),
            TraceMetadata::default(),
        );
        let a = tree.find_by_id("a").unwrap();
        tree.from_spans(
            a,
            vec![
                span("s1", Some("s2"), START, START + 0.1),
                span("s2", Some("s1"), START, START + 0.1),
            ],
            None,
        );
        tree.validate().unwrap();
        let s1 = tree.find_by_id("s1").unwrap();
        let s2 = tree.find_by_id("s2").unwrap();
        assert_eq!(tree[s1].parent(), Some(s2));
        assert_eq!(tree[s2].parent(), Some(a));
    }

    #[test]
    fn test_eap_issues_propagate_to_segment_and_root() {
        let mut child = eap("eap-span-2", false, "db", vec![]);
        child.errors.push(TraceError {
            event_id: "eap-error-1".into(),
            ..Default::default()
        });
        let mut segment = eap("eap-span-1", true, "http.server", vec![child]);
        segment.description = Some("EAP span with error".into());

        let tree = TraceTree::from_trace(
            TracePayload::Eap(vec![EapTraceItem::Span(segment)]),
            TraceMetadata::default(),
        );
        let segment = tree.find_by_id("eap-span-1").unwrap();
        assert_eq!(tree[tree.root()].errors.len(), 1);
        assert_eq!(tree[segment].errors.len(), 1);
        assert!(!tree[segment].expanded);
        assert_eq!(tree.find_by_id("eap-error-1"), Some(segment));
    }

    #[test]
    fn test_eap_flat_links_and_ops_breakdown() {
        let mut flat_child = eap("s4", false, "op-3", vec![]);
        flat_child.parent_span_id = Some("s2".into());
        let tree = TraceTree::from_trace(
            TracePayload::Eap(vec![
                EapTraceItem::Span(eap(
                    "s1",
                    true,
                    "op-1",
                    vec![eap("s2", false, "op-2", vec![]), eap("s3", true, "op-2", vec![])],
                )),
                EapTraceItem::Span(flat_child),
            ]),
            TraceMetadata::default(),
        );
        let id = |event_id: &str| tree.find_by_id(event_id).unwrap();

        assert_eq!(tree[id("s4")].parent(), Some(id("s2")));
        assert_eq!(
            tree[id("s1")].ops_breakdown,
            vec![
                OpsCount { op: "op-2".into(), count: 2 },
                OpsCount { op: "op-3".into(), count: 1 },
            ]
        );
        assert_eq!(
            tree[id("s2")].ops_breakdown,
            vec![OpsCount { op: "op-3".into(), count: 1 }]
        );
        assert!(tree[id("s3")].ops_breakdown.is_empty());
        tree.validate().unwrap();
    }

    #[test]
    fn test_eap_parent_cycle_is_broken_at_root() {
        let mut a = eap("a", false, "db", vec![]);
        a.parent_span_id = Some("b".into());
        let mut b = eap("b", false, "db", vec![]);
        b.parent_span_id = Some("a".into());
        let mut selfish = eap("c", false, "db", vec![]);
        selfish.parent_span_id = Some("c".into());

        let tree = TraceTree::from_trace(
            TracePayload::Eap(vec![
                EapTraceItem::Span(a),
                EapTraceItem::Span(b),
                EapTraceItem::Span(selfish),
            ]),
            TraceMetadata::default(),
        );
        let id = |event_id: &str| tree.find_by_id(event_id).unwrap();

        // `a` links first; `b` linking back to `a` would close the loop.
        assert_eq!(tree[id("a")].parent(), Some(id("b")));
        assert_eq!(tree[id("b")].parent(), Some(tree.root()));
        assert_eq!(tree[id("c")].parent(), Some(tree.root()));
        assert_eq!(tree.node_count(), 4);
        tree.validate().unwrap();
    }

    #[test]
    fn test_eap_measurements_strip_prefix() {
        let mut segment = eap("s1", true, "pageload", vec![]);
        segment.start_timestamp = Some(START);
        segment.end_timestamp = Some(START + 2.0);
        segment.measurements.insert("measurements.fcp".into(), 100.0);
        segment.measurements.insert("measurements.lcp".into(), 200.0);

        let tree = TraceTree::from_trace(
            TracePayload::Eap(vec![EapTraceItem::Span(segment)]),
            TraceMetadata::default(),
        );
        let s1 = tree.find_by_id("s1").unwrap();
        assert_eq!(tree.vitals.len(), 1);
        let keys: Vec<&str> = tree.vitals[&s1].iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["fcp", "lcp"]);
        assert_eq!(tree.indicators[0].label, "FCP");
        assert_eq!(tree.indicators[0].start, START * 1e3 + 100.0);
    }

    #[test]
    fn test_eap_orphan_errors() {
        let tree = TraceTree::from_trace(
            TracePayload::Eap(vec![
                EapTraceItem::Error(TraceError {
                    event_id: "e1".into(),
                    level: Some("error".into()),
                    ..Default::default()
                }),
                EapTraceItem::Error(TraceError {
                    event_id: "e2".into(),
                    level: Some("info".into()),
                    ..Default::default()
                }),
            ]),
            TraceMetadata::default(),
        );
        assert_eq!(tree[tree.root()].children().len(), 2);
        assert_eq!(tree[tree.root()].max_issue_severity(), "error");
    }

    #[test]
    fn test_append_tree_extends_space() {
        let mut tree = TraceTree::from_trace(
            classic(vec![txn("a", START, START + 1.0, vec![])], vec![]),
            TraceMetadata::default(),
        );
        let other = TraceTree::from_trace(
            classic(vec![txn("b", START, START + 10.0, vec![])], vec![]),
            TraceMetadata::default(),
        );
        tree.append_tree(other);

        let root = tree.root();
        assert_eq!(tree[root].children().len(), 2);
        assert_eq!(tree[root].space, Space::new(START * 1e3, 10_000.0));
        assert!(tree.find_by_id("b").is_some());
        tree.validate().unwrap();
    }

    #[test]
    fn test_from_json() {
        let tree = TraceTree::from_json(
            r#"{"transactions": [{"event_id": "a", "start_timestamp": 1.0, "timestamp": 2.0}]}"#,
            TraceMetadata::default(),
        )
        .unwrap();
        assert!(tree.find_by_id("a").is_some());
        assert!(TraceTree::from_json("[1, 2", TraceMetadata::default()).is_err());
    }
}
