//! Flattens the expanded parts of a tree into the ordered row list a
//! renderer walks.

use crate::node::{NodeId, NodeValue};
use crate::tree::TraceTree;
use serde::{Deserialize, Serialize};

/// One rendered row of the flattened list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub id: usize,
    pub depth: usize,
    pub connectors: Vec<usize>,
    pub label: String,
    pub expanded: bool,
    pub has_children: bool,
}

/// Nested plain mirror of the visible structure, for equality checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSnapshot>,
}

impl TraceTree {
    /// Children a renderer shows under `node` in its current state.
    ///
    /// A collapsed parent autogroup skips its chain and shows what follows
    /// the tail; expanded, it shows the head.
    pub fn direct_visible_children(&self, node: NodeId) -> &[NodeId] {
        let current = &self[node];
        match &current.value {
            NodeValue::ParentAutogroup(group) if !current.expanded => &self[group.tail].children,
            _ if current.expanded => &current.children,
            _ => &[],
        }
    }

    pub fn has_visible_children(&self, node: NodeId) -> bool {
        !self.direct_visible_children(node).is_empty()
    }

    /// Recomputes the visible list. Depth and connectors are only filled in
    /// on nodes whose cache was invalidated.
    pub fn build(&mut self) -> &mut Self {
        let mut list = Vec::with_capacity(self.list.len());
        let mut stack: Vec<(NodeId, usize, bool, Vec<usize>)> = Vec::new();

        let top = self.direct_visible_children(self.root());
        for (index, &child) in top.iter().enumerate().rev() {
            stack.push((child, 0, index + 1 == top.len(), Vec::new()));
        }

        while let Some((id, depth, is_last, inherited)) = stack.pop() {
            let node = &mut self[id];
            let depth = *node.depth.get_or_insert(depth);
            let connectors = node
                .connectors
                .get_or_insert_with(|| {
                    let mut connectors = Vec::with_capacity(inherited.len() + 1);
                    if !is_last {
                        connectors.push(depth);
                    }
                    connectors.extend(inherited);
                    connectors
                })
                .clone();
            list.push(id);

            let children = self.direct_visible_children(id);
            for (index, &child) in children.iter().enumerate().rev() {
                stack.push((
                    child,
                    depth + 1,
                    index + 1 == children.len(),
                    connectors.clone(),
                ));
            }
        }

        self.list = list;
        self
    }

    /// Visible nodes in render order, as of the last [`TraceTree::build`].
    pub fn list(&self) -> &[NodeId] {
        &self.list
    }

    pub fn rows(&self) -> Vec<Row> {
        self.list
            .iter()
            .map(|&id| {
                let node = &self[id];
                Row {
                    id: id.index(),
                    depth: node.depth.unwrap_or_default(),
                    connectors: node.connectors.clone().unwrap_or_default(),
                    label: node.label(),
                    expanded: node.expanded,
                    has_children: self.has_visible_children(id) || !node.children().is_empty(),
                }
            })
            .collect()
    }

    pub fn serialize(&self) -> NodeSnapshot {
        let mut order: Vec<(NodeId, Option<usize>)> = Vec::new();
        let mut stack = vec![(self.root(), None)];
        while let Some((id, parent)) = stack.pop() {
            let index = order.len();
            order.push((id, parent));
            for &child in self.direct_visible_children(id).iter().rev() {
                stack.push((child, Some(index)));
            }
        }

        let mut snapshots: Vec<NodeSnapshot> = order
            .iter()
            .map(|&(id, _)| NodeSnapshot {
                label: self[id].label(),
                children: Vec::new(),
            })
            .collect();

        // Children sit after their parent in pre-order, so folding from the
        // back completes every snapshot before it is moved.
        for index in (1..order.len()).rev() {
            let mut snapshot = std::mem::take(&mut snapshots[index]);
            snapshot.children.reverse();
            if let Some(parent) = order[index].1 {
                snapshots[parent].children.push(snapshot);
            }
        }

        let mut root = std::mem::take(&mut snapshots[0]);
        root.children.reverse();
        root
    }
}
