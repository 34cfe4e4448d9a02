use std::collections::BTreeMap;

use tracing::{event, Level};

use crate::defs::{DiffShape, ROOT_NAME};
use crate::error::{Error, Result, Stage};
use crate::structs::{DeltaSet, FoldedStacks};

pub type NodeId = usize;

pub const ROOT: NodeId = 0;

/// One frame at one position in the call hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTreeNode {
    pub name: String,
    pub depth: u32,
    pub parent: Option<NodeId>,
    /// Samples that ended exactly here.
    pub self_count: u64,
    /// Inclusive count: `self_count` plus every child's `total`.
    pub total: u64,
    pub self_delta: i64,
    pub delta: i64,
    children: BTreeMap<String, NodeId>,
}

impl CallTreeNode {
    fn new(name: String, depth: u32, parent: Option<NodeId>) -> Self {
        CallTreeNode {
            name,
            depth,
            parent,
            self_count: 0,
            total: 0,
            self_delta: 0,
            delta: 0,
            children: BTreeMap::new(),
        }
    }

    /// Children in frame-name order.
    pub fn children(&self) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }
}

/// Arena-backed call tree. Node 0 is the root; every node is stored after
/// its parent.
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
}

impl CallTree {
    pub fn from_folded(folded: &FoldedStacks) -> Result<CallTree> {
        let mut builder = TreeBuilder::new();
        for stack in folded {
            builder.insert(&stack.frames, stack.count, 0);
        }
        builder.finish()
    }

    /// Tree of a differential profile. Rect sizes come from `shape`, every
    /// node also carries the summed delta beneath it.
    pub fn from_delta(delta: &DeltaSet, shape: DiffShape) -> Result<CallTree> {
        let mut builder = TreeBuilder::new();
        for entry in &delta.entries {
            let count = match shape {
                DiffShape::Max => entry.before.max(entry.after),
                DiffShape::After => entry.after,
                DiffShape::Before => entry.before,
            };
            builder.insert(&entry.frames, count, entry.delta);
        }
        builder.finish()
    }

    pub fn root(&self) -> &CallTreeNode {
        &self.nodes[ROOT]
    }

    pub fn node(&self, id: NodeId) -> &CallTreeNode {
        &self.nodes[id]
    }

    /// Number of nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total(&self) -> u64 {
        self.root().total
    }

    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Follow `frames` from the root.
    pub fn find(&self, frames: &[&str]) -> Option<NodeId> {
        frames
            .iter()
            .try_fold(ROOT, |id, name| self.nodes[id].child(name))
    }

    /// Frame names from the root's first child down to `id`.
    pub fn path(&self, id: NodeId) -> Vec<&str> {
        let mut path = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            path.push(self.nodes[cur].name.as_str());
            cur = parent;
        }
        path.reverse();
        path
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &CallTreeNode)> {
        self.nodes.iter().enumerate()
    }
}

/// Incremental, non-recursive tree construction.
pub struct TreeBuilder {
    nodes: Vec<CallTreeNode>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        TreeBuilder {
            nodes: vec![CallTreeNode::new(ROOT_NAME.to_string(), 0, None)],
        }
    }

    /// Walk `frames` root to leaf, creating nodes as needed, and credit the
    /// last one. Recursion produces a chain of same-named nodes.
    pub fn insert(&mut self, frames: &[String], count: u64, delta: i64) {
        let mut cur = ROOT;
        for (depth, frame) in frames.iter().enumerate() {
            cur = match self.nodes[cur].children.get(frame.as_str()) {
                Some(&id) => id,
                None => {
                    let id = self.nodes.len();
                    self.nodes
                        .push(CallTreeNode::new(frame.clone(), depth as u32 + 1, Some(cur)));
                    self.nodes[cur].children.insert(frame.clone(), id);
                    id
                }
            };
        }
        let node = &mut self.nodes[cur];
        node.self_count += count;
        node.self_delta += delta;
    }

    /// Compute inclusive counts bottom-up.
    pub fn finish(mut self) -> Result<CallTree> {
        for node in self.nodes.iter_mut() {
            node.total = node.self_count;
            node.delta = node.self_delta;
        }
        // children always sit after their parent, so a reverse sweep sees
        // every subtree complete before it is added upwards
        for id in (1..self.nodes.len()).rev() {
            let (total, delta) = (self.nodes[id].total, self.nodes[id].delta);
            let Some(parent) = self.nodes[id].parent else {
                continue;
            };
            let parent = &mut self.nodes[parent];
            parent.total = parent
                .total
                .checked_add(total)
                .ok_or(Error::Overflow { stage: Stage::Tree })?;
            parent.delta = parent
                .delta
                .checked_add(delta)
                .ok_or(Error::Overflow { stage: Stage::Tree })?;
        }
        let tree = CallTree { nodes: self.nodes };
        if tree.total() == 0 {
            return Err(Error::EmptyInput {
                stage: Stage::Tree,
                skipped: 0,
            });
        }
        event!(
            Level::DEBUG,
            nodes = tree.node_count(),
            total = tree.total(),
            max_depth = tree.max_depth(),
            "call tree built"
        );
        Ok(tree)
    }
}
