//! Post-processing passes that fold repetitive spans into synthetic nodes.
//!
//! Every pass is idempotent: running it again over its own output finds
//! nothing new to group.

use crate::node::{
    MissingInstrumentation, NodeId, NodeValue, ParentAutogroup, SiblingAutogroup, Space,
    TraceTreeNode,
};
use crate::tree::TraceTree;
use itertools::Itertools;

type GroupKey = (String, Option<String>);

impl TraceTree {
    /// `(op, description)` of a span that may take part in autogrouping.
    fn group_key(&self, id: NodeId) -> Option<GroupKey> {
        let value = &self[id].value;
        if !value.is_span_like() {
            return None;
        }
        let op = value.op().filter(|op| !op.is_empty() && *op != "default")?;
        Some((op.to_string(), value.description().map(str::to_string)))
    }

    /// Runs the passes enabled in the config over the subtree of `node`.
    pub fn apply_autogrouping(&mut self, node: NodeId) {
        let config = self.config().clone();
        if config.missing_instrumentation.enabled {
            self.detect_missing_instrumentation(node);
        }
        if config.autogroup.parent {
            self.autogroup_parent_chains(node);
        }
        if config.autogroup.sibling {
            self.autogroup_siblings(node);
        }
    }

    /// Collapses chains of single-child spans sharing `(op, description)`
    /// into a [`ParentAutogroup`]. Returns the number of groups created.
    pub fn autogroup_parent_chains(&mut self, start: NodeId) -> usize {
        let min_chain = self.config().autogroup.parent_min_chain.max(2);
        let mut created = 0;
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            if let NodeValue::ParentAutogroup(group) = &self[id].value {
                stack.extend(self[group.tail].children.iter().copied());
                continue;
            }

            if id != start {
                if let Some(tail) = self.group_parent_chain(id, min_chain) {
                    created += 1;
                    stack.extend(self[tail].children.iter().copied());
                    continue;
                }
            }
            stack.extend(self[id].children.iter().copied());
        }

        if created > 0 {
            tracing::debug!(created, "parent autogroup pass");
            self.invalidate(start, true);
        }
        created
    }

    /// Groups the chain starting at `head` when it is long enough, returning
    /// the chain's tail.
    fn group_parent_chain(&mut self, head: NodeId, min_chain: usize) -> Option<NodeId> {
        let key = self.group_key(head)?;

        let mut chain = vec![head];
        let mut current = head;
        loop {
            let next = match self[current].children.as_slice() {
                [only] => *only,
                _ => break,
            };
            if self.group_key(next).as_ref() != Some(&key) {
                break;
            }
            chain.push(next);
            current = next;
        }
        if chain.len() < min_chain {
            return None;
        }

        let tail = current;
        let (op, description) = key;
        let group = ParentAutogroup {
            op,
            description,
            head,
            tail,
            group_count: chain.len(),
        };

        let (parent, at) = self.detach(head)?;
        let group = self.make_group_node(NodeValue::ParentAutogroup(group), head, &chain);
        self.insert_child(parent, at, group);
        self.append_child(group, head);
        Some(tail)
    }

    /// Collapses runs of consecutive sibling spans sharing
    /// `(op, description)` into a [`SiblingAutogroup`]. Returns the number
    /// of groups created.
    pub fn autogroup_siblings(&mut self, start: NodeId) -> usize {
        let min_run = self.config().autogroup.sibling_min_run.max(2);
        let mut created = 0;
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            if !matches!(self[id].value, NodeValue::SiblingAutogroup(_)) {
                let children = self[id].children.clone();
                let mut runs = Vec::new();
                let mut offset = 0;
                for (key, run) in &children.iter().chunk_by(|&&child| self.group_key(child)) {
                    let len = run.count();
                    if let Some(key) = key.filter(|_| len >= min_run) {
                        runs.push((offset, len, key));
                    }
                    offset += len;
                }

                for (offset, len, key) in runs.into_iter().rev() {
                    self.group_sibling_run(id, &children[offset..offset + len], key);
                    created += 1;
                }
            }
            stack.extend(self[id].children.iter().copied());
        }

        if created > 0 {
            tracing::debug!(created, "sibling autogroup pass");
            self.invalidate(start, true);
        }
        created
    }

    fn group_sibling_run(&mut self, parent: NodeId, members: &[NodeId], key: GroupKey) {
        let (op, description) = key;
        let group = SiblingAutogroup {
            op,
            description,
            group_count: members.len(),
        };
        let group = self.make_group_node(NodeValue::SiblingAutogroup(group), members[0], members);

        let mut at = None;
        for &member in members {
            if let Some((_, index)) = self.detach(member) {
                at.get_or_insert(index);
            }
        }
        self.insert_child(parent, at.unwrap_or(0), group);
        for &member in members {
            self.append_child(group, member);
        }
    }

    /// Collapsed group node covering `members`, inheriting their issues.
    fn make_group_node(&mut self, value: NodeValue, first: NodeId, members: &[NodeId]) -> NodeId {
        let mut node = TraceTreeNode::new(value, self[first].metadata.clone());
        node.expanded = false;

        let mut space: Option<Space> = None;
        for &member in members {
            let member = &self[member];
            if member.value.timing().is_some() {
                space = Some(space.map_or(member.space, |s| s.union(&member.space)));
            }
            for error in member.errors.values() {
                node.add_error(error.clone());
            }
            for occurrence in member.occurrences.values() {
                node.add_occurrence(occurrence.clone());
            }
        }
        node.space = space.unwrap_or_default();
        self.add_node(node)
    }

    /// Inserts a [`MissingInstrumentation`] marker between consecutive
    /// sibling spans separated by more than the configured threshold.
    /// Returns the number of markers inserted.
    pub fn detect_missing_instrumentation(&mut self, start: NodeId) -> usize {
        let threshold = self.config().missing_instrumentation.threshold_ms;
        let mut created = 0;
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            let children = self[id].children.clone();
            stack.extend(children.iter().copied());
            if self[id].value.is_autogroup() {
                continue;
            }

            let mut gaps = Vec::new();
            for (index, pair) in children.windows(2).enumerate() {
                let (previous, next) = (&self[pair[0]], &self[pair[1]]);
                if !previous.value.is_span_like() || !next.value.is_span_like() {
                    continue;
                }
                if previous.value.timing().is_none() || next.value.timing().is_none() {
                    continue;
                }
                let gap = next.space.start - previous.space.end();
                if gap > 0.0 && gap > threshold {
                    gaps.push((index + 1, pair[0], pair[1], Space::new(previous.space.end(), gap)));
                }
            }

            for (at, previous, next, space) in gaps.into_iter().rev() {
                let marker = MissingInstrumentation {
                    previous_span_id: self[previous].value.span_id().unwrap_or_default().to_string(),
                    next_span_id: self[next].value.span_id().unwrap_or_default().to_string(),
                };
                let mut node = TraceTreeNode::new(
                    NodeValue::MissingInstrumentation(marker),
                    self[previous].metadata.clone(),
                );
                node.space = space;
                let marker = self.add_node(node);
                self.insert_child(id, at, marker);
                created += 1;
            }
        }

        if created > 0 {
            tracing::debug!(created, "missing instrumentation pass");
            self.invalidate(start, true);
        }
        created
    }
}
