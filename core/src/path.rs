//! Stable, typed paths to nodes and re-expansion along them.

use crate::error::{Result, TraceTreeError};
use crate::node::{NodeId, NodeValue, TraceTreeNode};
use crate::tree::TraceTree;
use crate::zoom::ZoomContext;
use std::fmt;
use std::str::FromStr;

/// One token of a node path, e.g. `txn-<event_id>` or `span-<span_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Transaction(String),
    Span(String),
    /// Parent autogroups are named after their head, sibling autogroups
    /// after their first member.
    Autogroup(String),
    /// Named after the span preceding the gap.
    MissingInstrumentation(String),
    Error(String),
    TraceRoot,
}

impl PathSegment {
    /// Segments that only exist once the owning transaction is zoomed in.
    fn needs_spans(&self) -> bool {
        matches!(
            self,
            PathSegment::Span(_) | PathSegment::Autogroup(_) | PathSegment::MissingInstrumentation(_)
        )
    }

    fn matches(&self, tree: &TraceTree, node: &TraceTreeNode) -> bool {
        match (self, &node.value) {
            (PathSegment::TraceRoot, NodeValue::Root) => true,
            (PathSegment::Transaction(id), NodeValue::Transaction(txn)) => txn.event_id == *id,
            (PathSegment::Transaction(id), NodeValue::EapSpan(span)) => {
                span.is_transaction && span.event_id == *id
            }
            (PathSegment::Span(id), NodeValue::Span(span)) => span.span_id == *id,
            (PathSegment::Span(id), NodeValue::EapSpan(span)) => {
                !span.is_transaction && span.event_id == *id
            }
            (PathSegment::Autogroup(id), NodeValue::ParentAutogroup(group)) => {
                tree.get(group.head).and_then(|head| head.value.span_id()) == Some(id.as_str())
            }
            (PathSegment::Autogroup(id), NodeValue::SiblingAutogroup(_)) => node
                .children
                .first()
                .and_then(|&first| tree[first].value.span_id())
                == Some(id.as_str()),
            (PathSegment::MissingInstrumentation(id), NodeValue::MissingInstrumentation(gap)) => {
                gap.previous_span_id == *id
            }
            (PathSegment::Error(id), NodeValue::TraceError(error)) => error.event_id == *id,
            _ => false,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Transaction(id) => write!(f, "txn-{}", id),
            PathSegment::Span(id) => write!(f, "span-{}", id),
            PathSegment::Autogroup(id) => write!(f, "ag-{}", id),
            PathSegment::MissingInstrumentation(id) => write!(f, "ms-{}", id),
            PathSegment::Error(id) => write!(f, "error-{}", id),
            PathSegment::TraceRoot => f.write_str("trace-root"),
        }
    }
}

impl FromStr for PathSegment {
    type Err = TraceTreeError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "trace-root" {
            return Ok(PathSegment::TraceRoot);
        }
        let (kind, id) = s
            .split_once('-')
            .filter(|(_, id)| !id.is_empty())
            .ok_or_else(|| TraceTreeError::InvalidPathSegment(s.to_string()))?;
        let id = id.to_string();
        match kind {
            "txn" => Ok(PathSegment::Transaction(id)),
            "span" => Ok(PathSegment::Span(id)),
            "ag" => Ok(PathSegment::Autogroup(id)),
            "ms" => Ok(PathSegment::MissingInstrumentation(id)),
            "error" => Ok(PathSegment::Error(id)),
            _ => Err(TraceTreeError::InvalidPathSegment(s.to_string())),
        }
    }
}

impl TraceTree {
    /// Token identifying `node` within its owning transaction.
    pub fn path_segment(&self, node: NodeId) -> Option<PathSegment> {
        let segment = match &self[node].value {
            NodeValue::Root => PathSegment::TraceRoot,
            NodeValue::Transaction(txn) => PathSegment::Transaction(txn.event_id.clone()),
            NodeValue::EapSpan(span) if span.is_transaction => {
                PathSegment::Transaction(span.event_id.clone())
            }
            NodeValue::EapSpan(span) => PathSegment::Span(span.event_id.clone()),
            NodeValue::Span(span) => PathSegment::Span(span.span_id.clone()),
            NodeValue::ParentAutogroup(group) => {
                PathSegment::Autogroup(self.get(group.head)?.value.span_id()?.to_string())
            }
            NodeValue::SiblingAutogroup(_) => {
                let first = *self[node].children.first()?;
                PathSegment::Autogroup(self[first].value.span_id()?.to_string())
            }
            NodeValue::MissingInstrumentation(gap) => {
                PathSegment::MissingInstrumentation(gap.previous_span_id.clone())
            }
            NodeValue::TraceError(error) => PathSegment::Error(error.event_id.clone()),
        };
        Some(segment)
    }

    /// Path from `node` outward, innermost segment first.
    ///
    /// A transaction's path is its own segment, since event ids are unique
    /// across the trace. Any other node gets its own segment followed by
    /// the segment of its nearest transaction and nothing further out:
    /// outer transactions and intermediate spans or autogroups are not
    /// listed. [`TraceTree::expand_to_path`] recovers them by searching
    /// the subtree of each resolved segment.
    pub fn path_to_node(&self, node: NodeId) -> Vec<PathSegment> {
        let mut path: Vec<PathSegment> = self.path_segment(node).into_iter().collect();
        if matches!(self[node].value, NodeValue::Root) || self[node].value.is_transaction_like() {
            return path;
        }
        if let Some(segment) = self
            .parent_transaction(node)
            .and_then(|txn| self.path_segment(txn))
        {
            path.push(segment);
        }
        path
    }

    /// Walks `path` from its outermost segment inward, zooming transactions
    /// whose spans are needed, and expands every ancestor of the node it
    /// lands on. Segments that cannot be resolved are skipped.
    pub async fn expand_to_path(
        &mut self,
        path: &[PathSegment],
        ctx: &ZoomContext,
    ) -> Result<Option<NodeId>> {
        let mut scope = self.root();
        let mut landed = None;
        let mut segments = path.iter().rev().peekable();

        while let Some(segment) = segments.next() {
            let Some(current) = self.resolve_segment(scope, segment) else {
                tracing::debug!(%segment, "discarding unresolved path segment");
                continue;
            };
            scope = current;
            landed = Some(current);

            let wants_spans = segments.peek().is_some_and(|next| next.needs_spans());
            if wants_spans && self[current].value.is_transaction() {
                self.zoom(current, true, ctx).await?;
            }
        }

        if let Some(node) = landed {
            let ancestors: Vec<NodeId> = self.ancestors(node).collect();
            for ancestor in ancestors {
                self.expand(ancestor, true);
            }
        }
        Ok(landed)
    }

    fn resolve_segment(&self, scope: NodeId, segment: &PathSegment) -> Option<NodeId> {
        if let Some(found) = self.find(scope, |node| segment.matches(self, node)) {
            return Some(found);
        }
        // Links may name a transaction by the span it was started from.
        match (segment, &self[scope].value) {
            (PathSegment::Span(id), NodeValue::Transaction(txn))
                if txn.span_id.as_deref() == Some(id.as_str()) =>
            {
                Some(scope)
            }
            _ => None,
        }
    }
}
