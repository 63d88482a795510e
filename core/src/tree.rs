//! Arena that owns every node of a trace.
//!
//! Nodes live in a `StableDiGraph` so handles stay valid across removals. The
//! ordered child list lives on each node; graph edges mirror the parent→child
//! links and are only consulted for invariant checks.

use crate::builder::{Indicator, Vital};
use crate::config::Config;
use crate::error::{Result, TraceTreeError};
use crate::events::TraceTreeEvent;
use crate::node::{NodeId, NodeValue, TraceTreeNode};
use crate::zoom::RequestState;
use crossbeam::channel::{self, Receiver, Sender};
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::StableDiGraph;
use std::collections::{HashMap, HashSet};
use std::ops::{Index, IndexMut};

pub struct TraceTree {
    pub(crate) graph: StableDiGraph<TraceTreeNode, ()>,
    root: NodeId,
    pub indicators: Vec<Indicator>,
    pub vitals: HashMap<NodeId, Vec<Vital>>,
    pub(crate) list: Vec<NodeId>,
    pub(crate) requests: HashMap<NodeId, RequestState>,
    pub(crate) generation: u64,
    config: Config,
    subscribers: Vec<Sender<TraceTreeEvent>>,
}

impl Default for TraceTree {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for TraceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceTree")
            .field("nodes", &self.graph.node_count())
            .field("root_space", &self.graph[self.root].space)
            .field("indicators", &self.indicators.len())
            .finish()
    }
}

impl Index<NodeId> for TraceTree {
    type Output = TraceTreeNode;

    /// Panics when `id` does not name a live node.
    fn index(&self, id: NodeId) -> &TraceTreeNode {
        &self.graph[id]
    }
}

impl IndexMut<NodeId> for TraceTree {
    fn index_mut(&mut self, id: NodeId) -> &mut TraceTreeNode {
        &mut self.graph[id]
    }
}

impl TraceTree {
    /// Empty tree holding only the root.
    pub fn new(config: Config) -> Self {
        let mut graph = StableDiGraph::new();
        let root = graph.add_node(TraceTreeNode::root());
        Self {
            graph,
            root,
            indicators: Vec::new(),
            vitals: HashMap::new(),
            list: Vec::new(),
            requests: HashMap::new(),
            generation: 0,
            config,
            subscribers: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get(&self, id: NodeId) -> Option<&TraceTreeNode> {
        self.graph.node_weight(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.graph.contains_node(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    // Structure -------------------------------------------------------------

    pub(crate) fn add_node(&mut self, node: TraceTreeNode) -> NodeId {
        self.graph.add_node(node)
    }

    pub(crate) fn append_child(&mut self, parent: NodeId, child: NodeId) {
        let at = self.graph[parent].children.len();
        self.insert_child(parent, at, child);
    }

    /// Links `child` under `parent` at position `at`. The child must be detached.
    pub(crate) fn insert_child(&mut self, parent: NodeId, at: usize, child: NodeId) {
        assert!(
            self.graph[child].parent.is_none(),
            "node {:?} is already attached",
            child
        );
        self.graph[parent].children.insert(at, child);
        self.graph[child].parent = Some(parent);
        self.graph.add_edge(parent, child, ());
    }

    /// Unlinks `child` from its parent, returning the parent and the index it held.
    pub(crate) fn detach(&mut self, child: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.graph[child].parent.take()?;
        let at = self.graph[parent]
            .children
            .iter()
            .position(|&c| c == child)
            .unwrap_or_else(|| panic!("{:?} missing from its parent's children", child));
        self.graph[parent].children.remove(at);
        if let Some(edge) = self.graph.find_edge(parent, child) {
            self.graph.remove_edge(edge);
        }
        Some((parent, at))
    }

    /// Detaches `node` and drops it with all of its descendants, along with
    /// any vitals, indicators and pending requests they owned.
    pub(crate) fn remove_subtree(&mut self, node: NodeId) {
        self.detach(node);

        let mut removed = HashSet::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            stack.extend(self.graph[id].children.iter().copied());
            removed.insert(id);
        }

        for id in &removed {
            self.graph.remove_node(*id);
            self.vitals.remove(id);
            self.requests.remove(id);
        }
        self.indicators.retain(|indicator| !removed.contains(&indicator.node));
        self.list.retain(|id| !removed.contains(id));
    }

    // Queries ---------------------------------------------------------------

    /// Walks up from `node`, nearest ancestor first.
    pub fn ancestors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.graph[node].parent, move |&id| self.graph[id].parent)
    }

    /// Nearest strict ancestor that is a transaction or an EAP segment.
    pub fn parent_transaction(&self, node: NodeId) -> Option<NodeId> {
        self.ancestors(node)
            .find(|&id| self.graph[id].value.is_transaction_like())
    }

    pub fn is_last_child(&self, node: NodeId) -> bool {
        match self.graph[node].parent {
            Some(parent) => self.graph[parent].children.last() == Some(&node),
            None => true,
        }
    }

    /// Pre-order walk over every descendant of `start`, `start` excluded.
    pub fn for_each_child<F>(&self, start: NodeId, mut f: F)
    where
        F: FnMut(NodeId, &TraceTreeNode),
    {
        let mut stack: Vec<NodeId> = self.graph[start].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = &self.graph[id];
            f(id, node);
            stack.extend(node.children.iter().rev().copied());
        }
    }

    /// First node in pre-order under `start` (inclusive) matching `predicate`.
    pub fn find<P>(&self, start: NodeId, mut predicate: P) -> Option<NodeId>
    where
        P: FnMut(&TraceTreeNode) -> bool,
    {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = &self.graph[id];
            if predicate(node) {
                return Some(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        None
    }

    pub fn find_all<P>(&self, start: NodeId, mut predicate: P) -> Vec<NodeId>
    where
        P: FnMut(&TraceTreeNode) -> bool,
    {
        let mut found = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = &self.graph[id];
            if predicate(node) {
                found.push(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        found
    }

    /// Finds the node carrying `id`, either as its own identifier or as the
    /// event id of an error or occurrence attached to it.
    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        self.find(self.root, |node| matches_id(node, id))
    }

    // Expansion -------------------------------------------------------------

    /// Returns false when the node already was in the requested state.
    pub fn expand(&mut self, node: NodeId, expanded: bool) -> bool {
        if self.graph[node].expanded == expanded {
            return false;
        }
        self.graph[node].expanded = expanded;
        self.invalidate(node, true);
        true
    }

    /// Clears cached depth and connectors on `node`, and on its whole
    /// subtree when `recursive`.
    pub fn invalidate(&mut self, node: NodeId, recursive: bool) {
        self.graph[node].invalidate();
        if !recursive {
            return;
        }
        let mut stack: Vec<NodeId> = self.graph[node].children.clone();
        while let Some(id) = stack.pop() {
            let node = &mut self.graph[id];
            node.invalidate();
            stack.extend(node.children.iter().copied());
        }
    }

    // Events ----------------------------------------------------------------

    pub fn subscribe(&mut self) -> Receiver<TraceTreeEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn emit(&mut self, event: TraceTreeEvent) {
        tracing::debug!("{}: {:?}", event.name(), event);
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // Invariants ------------------------------------------------------------

    /// Checks that parent and child links agree, every node is reachable
    /// from the root exactly once, and the structure has no cycles.
    pub fn validate(&self) -> Result<()> {
        if self.graph[self.root].parent.is_some() {
            return Err(TraceTreeError::InvariantViolation(
                "root has a parent".to_string(),
            ));
        }
        if is_cyclic_directed(&self.graph) {
            return Err(TraceTreeError::InvariantViolation(
                "node links form a cycle".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(TraceTreeError::InvariantViolation(format!(
                    "{:?} is reachable twice",
                    id
                )));
            }
            for &child in &self.graph[id].children {
                if !self.graph.contains_node(child) {
                    return Err(TraceTreeError::InvariantViolation(format!(
                        "{:?} lists removed child {:?}",
                        id, child
                    )));
                }
                if self.graph[child].parent != Some(id) {
                    return Err(TraceTreeError::InvariantViolation(format!(
                        "{:?} does not point back to parent {:?}",
                        child, id
                    )));
                }
                if self.graph.find_edge(id, child).is_none() {
                    return Err(TraceTreeError::InvariantViolation(format!(
                        "missing edge {:?} -> {:?}",
                        id, child
                    )));
                }
                stack.push(child);
            }
        }

        if seen.len() != self.graph.node_count() {
            return Err(TraceTreeError::InvariantViolation(format!(
                "{} nodes are detached from the root",
                self.graph.node_count() - seen.len()
            )));
        }
        if self.graph.edge_count() != self.graph.node_count() - 1 {
            return Err(TraceTreeError::InvariantViolation(
                "graph edges disagree with child links".to_string(),
            ));
        }
        Ok(())
    }
}

fn matches_id(node: &TraceTreeNode, id: &str) -> bool {
    let own = match &node.value {
        NodeValue::Root => return false,
        NodeValue::Transaction(txn) => txn.event_id == id || txn.span_id.as_deref() == Some(id),
        NodeValue::Span(span) => span.span_id == id,
        NodeValue::EapSpan(span) => span.event_id == id,
        NodeValue::TraceError(error) => error.event_id == id,
        NodeValue::ParentAutogroup(_)
        | NodeValue::SiblingAutogroup(_)
        | NodeValue::MissingInstrumentation(_) => false,
    };
    own || node.errors.contains_key(id) || node.occurrences.contains_key(id)
}
