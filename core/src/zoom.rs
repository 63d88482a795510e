//! On-demand span fetching for transactions.
//!
//! Zooming is split in two so the tree is never borrowed across the network
//! call: [`TraceTree::request_spans`] hands out a shared in-flight request,
//! and [`TraceTree::apply_span_response`] splices its result if the request
//! is still the current one for that node.

use crate::error::{ApiError, Result, TraceTreeError};
use crate::events::TraceTreeEvent;
use crate::node::{FetchStatus, NodeId, Space};
use crate::payload::EventTransaction;
use crate::tree::TraceTree;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;

/// Fetches the event behind a `{project_slug}:{event_id}` key.
#[async_trait]
pub trait TraceApiClient: Send + Sync {
    async fn fetch_event(
        &self,
        project_slug: &str,
        event_id: &str,
    ) -> std::result::Result<EventTransaction, ApiError>;
}

#[derive(Clone)]
pub struct ZoomContext {
    pub api: Arc<dyn TraceApiClient>,
}

impl ZoomContext {
    pub fn new(api: Arc<dyn TraceApiClient>) -> Self {
        Self { api }
    }
}

type SpanResponse = std::result::Result<Arc<EventTransaction>, ApiError>;

/// In-flight span fetch for one node. Clones share the same network call.
#[derive(Clone)]
pub struct SpanRequest {
    pub node: NodeId,
    pub generation: u64,
    pub key: String,
    future: Shared<BoxFuture<'static, SpanResponse>>,
}

impl SpanRequest {
    pub async fn wait(&self) -> SpanResponse {
        self.future.clone().await
    }
}

impl std::fmt::Debug for SpanRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanRequest")
            .field("node", &self.node)
            .field("generation", &self.generation)
            .field("key", &self.key)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestState {
    #[default]
    Idle,
    Pending(SpanRequest),
    Done,
}

impl TraceTree {
    pub fn request_state(&self, node: NodeId) -> RequestState {
        self.requests.get(&node).cloned().unwrap_or_default()
    }

    /// Starts a span fetch for `node`, or joins the one already in flight.
    /// Returns `None` for nodes that cannot be zoomed.
    pub fn request_spans(&mut self, node: NodeId, ctx: &ZoomContext) -> Result<Option<SpanRequest>> {
        if !self[node].can_fetch || self[node].zoomed_in {
            return Ok(None);
        }
        if let Some(RequestState::Pending(request)) = self.requests.get(&node) {
            return Ok(Some(request.clone()));
        }

        let metadata = &self[node].metadata;
        let project_slug = metadata
            .project_slug
            .clone()
            .ok_or(TraceTreeError::MissingFetchKey("project_slug"))?;
        let event_id = metadata
            .event_id
            .clone()
            .ok_or(TraceTreeError::MissingFetchKey("event_id"))?;
        let key = format!("{}:{}", project_slug, event_id);

        self.generation += 1;
        let api = Arc::clone(&ctx.api);
        let future = async move {
            api.fetch_event(&project_slug, &event_id)
                .await
                .map(Arc::new)
        }
        .boxed()
        .shared();

        let request = SpanRequest {
            node,
            generation: self.generation,
            key,
            future,
        };
        tracing::debug!(key = %request.key, generation = request.generation, "fetching spans");
        self.requests
            .insert(node, RequestState::Pending(request.clone()));
        self[node].fetch_status = FetchStatus::Loading;
        Ok(Some(request))
    }

    /// Applies the outcome of `request`. Returns `Ok(false)` when the
    /// request was superseded and nothing changed. A failed fetch is
    /// reported to every waiter, superseded or not.
    pub fn apply_span_response(
        &mut self,
        request: &SpanRequest,
        response: SpanResponse,
    ) -> Result<bool> {
        let node = request.node;
        let current = matches!(
            self.requests.get(&node),
            Some(RequestState::Pending(pending)) if pending.generation == request.generation
        );

        let parsed = response.and_then(|event| {
            let spans = event
                .spans()
                .map_err(|e| ApiError::Malformed(e.to_string()))?;
            Ok((event, spans))
        });
        let (event, spans) = match parsed {
            Ok(parsed) if current => parsed,
            Ok(_) => {
                tracing::debug!(key = %request.key, "discarding superseded span response");
                return Ok(false);
            }
            Err(source) => {
                if current {
                    tracing::warn!(key = %request.key, "span fetch failed: {}", source);
                    self.requests.remove(&node);
                    self[node].fetch_status = FetchStatus::Error;
                }
                return Err(TraceTreeError::Fetch {
                    key: request.key.clone(),
                    source,
                });
            }
        };

        let bounds = self.from_spans(node, spans, Some(event));
        self[node].fetch_status = FetchStatus::Resolved;
        self.requests.insert(node, RequestState::Done);
        self.apply_autogrouping(node);

        if let Some(bounds) = bounds {
            self.extend_timeline(bounds);
        }
        Ok(true)
    }

    /// Widens the root to cover `bounds`, notifying subscribers when it grew.
    fn extend_timeline(&mut self, bounds: Space) {
        let root = self.root();
        let current = self[root].space;
        let start = current.start.min(bounds.start);
        let end = current.end().max(bounds.end());
        if start >= current.start && end <= current.end() {
            return;
        }

        self[root].space = Space::from_bounds(start, end);
        self.emit(TraceTreeEvent::TimelineChange {
            start,
            duration: end - start,
        });
    }

    /// Zooms `node` in (fetching and splicing its spans) or out.
    pub async fn zoom(&mut self, node: NodeId, zoom_in: bool, ctx: &ZoomContext) -> Result<()> {
        if !zoom_in {
            self.zoom_out(node);
            return Ok(());
        }

        let Some(request) = self.request_spans(node, ctx)? else {
            return Ok(());
        };
        let response = request.wait().await;
        self.apply_span_response(&request, response)?;
        Ok(())
    }

    /// Drops the fetched spans of `node` and puts its original children
    /// back. Nested transactions keep whatever they fetched themselves.
    pub fn zoom_out(&mut self, node: NodeId) {
        if self.requests.remove(&node).is_some() && !self[node].zoomed_in {
            self[node].fetch_status = FetchStatus::Idle;
        }
        if !self[node].zoomed_in {
            return;
        }

        let saved = self[node]
            .zoom
            .take()
            .map(|state| state.direct_children)
            .unwrap_or_default();
        let saved: Vec<NodeId> = saved.into_iter().filter(|&id| self.contains(id)).collect();

        for &child in &saved {
            self.detach(child);
        }
        for child in self[node].children.clone() {
            self.remove_subtree(child);
        }
        for child in saved {
            self.append_child(node, child);
        }

        let current = &mut self[node];
        current.zoomed_in = false;
        current.fetch_status = FetchStatus::Idle;
        current.event = None;
        self.invalidate(node, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeValue;
    use crate::payload::{Span, TraceMetadata, TracePayload, TraceSplitResults, Transaction};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const START: f64 = 1_709_164_800.0;

    #[derive(Default)]
    struct StubClient {
        responses: Mutex<HashMap<String, std::result::Result<EventTransaction, ApiError>>>,
        calls: AtomicUsize,
    }

    impl StubClient {
        fn respond(&self, key: &str, spans: Vec<Span>) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.to_string(), Ok(EventTransaction::with_spans(spans)));
        }

        fn fail(&self, key: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.to_string(), Err(ApiError::NotFound(key.to_string())));
        }
    }

    #[async_trait]
    impl TraceApiClient for StubClient {
        async fn fetch_event(
            &self,
            project_slug: &str,
            event_id: &str,
        ) -> std::result::Result<EventTransaction, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = format!("{}:{}", project_slug, event_id);
            self.responses
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Err(ApiError::NotFound(key)))
        }
    }

    fn setup(end: f64) -> (TraceTree, NodeId, Arc<StubClient>, ZoomContext) {
        let tree = TraceTree::from_trace(
            TracePayload::Classic(TraceSplitResults {
                transactions: vec![Transaction {
                    event_id: "event-id".into(),
                    project_slug: Some("project".into()),
                    transaction: "root".into(),
                    start_timestamp: Some(START),
                    timestamp: Some(START + end),
                    ..Default::default()
                }],
                orphan_errors: vec![],
            }),
            TraceMetadata::default(),
        );
        let txn = tree.find_by_id("event-id").unwrap();
        let client = Arc::new(StubClient::default());
        let ctx = ZoomContext::new(client.clone());
        (tree, txn, client, ctx)
    }

    fn span(id: &str, start: f64, end: f64) -> Span {
        Span {
            span_id: id.into(),
            op: Some("db".into()),
            description: Some(id.into()),
            start_timestamp: Some(START + start),
            timestamp: Some(START + end),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zoom_in_splices_spans() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        client.respond("project:event-id", vec![span("0000", 0.5, 1.0)]);

        tree.zoom(txn, true, &ctx).await.unwrap();

        assert!(tree[txn].zoomed_in);
        assert_eq!(tree[txn].fetch_status, FetchStatus::Resolved);
        assert!(tree[txn].event.is_some());
        assert!(matches!(tree.request_state(txn), RequestState::Done));
        assert!(tree.find_by_id("0000").is_some());

        // Already zoomed: no second fetch.
        tree.zoom(txn, true, &ctx).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cannot_fetch_is_a_noop() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        tree[txn].can_fetch = false;

        tree.zoom(txn, true, &ctx).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(tree[txn].fetch_status, FetchStatus::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        client.respond("project:event-id", vec![span("0000", 0.5, 1.0)]);

        let first = tree.request_spans(txn, &ctx).unwrap().unwrap();
        let second = tree.request_spans(txn, &ctx).unwrap().unwrap();
        assert_eq!(first.generation, second.generation);
        assert_eq!(tree[txn].fetch_status, FetchStatus::Loading);

        let (a, b) = futures::join!(first.wait(), second.wait());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        assert!(tree.apply_span_response(&first, a).unwrap());
        assert!(!tree.apply_span_response(&second, b).unwrap());
        assert_eq!(
            tree.find_all(txn, |n| matches!(n.value, NodeValue::Span(_))).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_shared_failure_reaches_every_waiter() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        client.fail("project:event-id");

        let first = tree.request_spans(txn, &ctx).unwrap().unwrap();
        let second = tree.request_spans(txn, &ctx).unwrap().unwrap();
        let (a, b) = futures::join!(first.wait(), second.wait());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        for (request, response) in [(&first, a), (&second, b)] {
            let err = tree.apply_span_response(request, response).unwrap_err();
            assert!(matches!(err, TraceTreeError::Fetch { ref key, .. } if key == "project:event-id"));
        }
        assert_eq!(tree[txn].fetch_status, FetchStatus::Error);
        assert!(matches!(tree.request_state(txn), RequestState::Idle));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_tree_unchanged() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        client.fail("project:event-id");
        let before = tree.build().serialize();

        let err = tree.zoom(txn, true, &ctx).await.unwrap_err();
        assert!(matches!(err, TraceTreeError::Fetch { ref key, .. } if key == "project:event-id"));
        assert_eq!(tree[txn].fetch_status, FetchStatus::Error);
        assert!(!tree[txn].zoomed_in);
        assert_eq!(tree.build().serialize(), before);

        // A later attempt fetches again.
        client.respond("project:event-id", vec![]);
        tree.zoom(txn, true, &ctx).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_superseded_response_is_discarded() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        client.respond("project:event-id", vec![span("0000", 0.5, 1.0)]);

        let stale = tree.request_spans(txn, &ctx).unwrap().unwrap();
        tree.zoom_out(txn);
        assert_eq!(tree[txn].fetch_status, FetchStatus::Idle);

        let response = stale.wait().await;
        assert!(!tree.apply_span_response(&stale, response).unwrap());
        assert!(tree.find_by_id("0000").is_none());
    }

    #[tokio::test]
    async fn test_missing_fetch_key() {
        let (mut tree, txn, _, ctx) = setup(2.0);
        tree[txn].metadata.project_slug = None;
        assert!(matches!(
            tree.request_spans(txn, &ctx),
            Err(TraceTreeError::MissingFetchKey("project_slug"))
        ));
    }

    #[tokio::test]
    async fn test_timeline_change_only_when_bounds_grow() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        let events = tree.subscribe();
        client.respond("project:event-id", vec![span("0000", 0.5, 1.0)]);
        tree.zoom(txn, true, &ctx).await.unwrap();
        assert!(events.try_recv().is_err());

        let (mut tree, txn, client, ctx) = setup(1.0);
        let events = tree.subscribe();
        let before = tree[txn].space;
        client.respond("project:event-id", vec![span("0000", 0.0, 1.5)]);
        tree.zoom(txn, true, &ctx).await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            TraceTreeEvent::TimelineChange {
                start: START * 1e3,
                duration: 1500.0
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(tree[txn].space, before);
    }

    #[tokio::test]
    async fn test_zoom_round_trip_restores_snapshot() {
        let (mut tree, txn, client, ctx) = setup(2.0);
        client.respond(
            "project:event-id",
            (0..6).map(|i| span(&format!("s{i}"), 0.1, 0.2)).collect(),
        );
        let before = tree.build().serialize();

        tree.zoom(txn, true, &ctx).await.unwrap();
        assert_ne!(tree.build().serialize(), before);

        tree.zoom(txn, false, &ctx).await.unwrap();
        assert_eq!(tree.build().serialize(), before);
        assert_eq!(tree[txn].fetch_status, FetchStatus::Idle);
        assert_eq!(tree.node_count(), 2);
        tree.validate().unwrap();
    }
}
