use crate::Exe;
use slotmap::{SlotMap, new_key_type};
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
};
use tracing::trace;

new_key_type! {
    pub struct NodeId;
}

/// Order bound of the model: both the history window and the depth of the
/// deep-context chain.
const MAX_DEPTH: usize = 5;

/// Weak constant bid placed on neighbors of the deep context.
const NEIGHBOR_PROB: f64 = 0.1;

const PROB_EPSILON: f64 = 0.01;

#[derive(Debug, Default)]
struct VommNode {
    /// Path of the exe this node stands for; `None` only for the root.
    path: Option<PathBuf>,
    children: HashMap<PathBuf, NodeId>,
    count: u64,
    parent: Option<NodeId>,
    depth: usize,
}

/// A variable-order markov model over recent execution contexts.
///
/// The trie records which exes follow which launch sequences. The first
/// level under the root doubles as a global bigram table, updated on every
/// event regardless of how deep the active context has drifted.
///
/// The tree is rebuilt at every daemon start; the bigram layer can be
/// seeded from the pairwise markov chains so predictions are useful
/// immediately after a restart.
#[derive(Debug)]
pub struct VommTree {
    nodes: SlotMap<NodeId, VommNode>,
    root: NodeId,
    current_context: NodeId,
    history: VecDeque<PathBuf>,
}

impl Default for VommTree {
    fn default() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(VommNode::default());
        Self {
            nodes,
            root,
            current_context: root,
            history: VecDeque::new(),
        }
    }
}

impl VommTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_child(&mut self, parent: NodeId, path: &Path) -> NodeId {
        if let Some(&child) = self.nodes[parent].children.get(path) {
            return child;
        }
        let depth = self.nodes[parent].depth + 1;
        let child = self.nodes.insert(VommNode {
            path: Some(path.to_path_buf()),
            children: HashMap::new(),
            count: 0,
            parent: Some(parent),
            depth,
        });
        self.nodes[parent]
            .children
            .insert(path.to_path_buf(), child);
        child
    }

    /// Record one execution event.
    pub fn update(&mut self, path: &Path) {
        trace!(?path, "vomm update");

        self.history.push_back(path.to_path_buf());
        if self.history.len() > MAX_DEPTH {
            self.history.pop_front();
        }

        // Extend the deep context, restarting from the root once the chain
        // has reached the order bound.
        if self.nodes[self.current_context].depth >= MAX_DEPTH {
            self.current_context = self.root;
        }
        let next = self.ensure_child(self.current_context, path);
        self.nodes[next].count += 1;
        self.current_context = next;

        // Always record the bigram prev -> path under the root, so order-1
        // counts exist no matter where the deep context sits.
        if self.history.len() >= 2 {
            let prev = self.history[self.history.len() - 2].clone();
            self.record_bigram(&prev, path, 1);
        }
    }

    /// Add `count` observations of the sequence `prev -> next` to the bigram
    /// layer.
    pub fn record_bigram(&mut self, prev: &Path, next: &Path, count: u64) {
        if count == 0 {
            return;
        }
        let context = self.ensure_child(self.root, prev);
        let target = self.ensure_child(context, next);
        self.nodes[target].count += count;
    }

    /// Place prediction bids on the lnprob of every non-running exe the
    /// current history suggests.
    ///
    /// Three layers, weakest last:
    /// 1. order-1 contexts of every history item (prediction by partial
    ///    matching on the bigram layer),
    /// 2. the deep context: PPM plus a weak constant nudge on all its
    ///    neighbors,
    /// 3. a dampened global-frequency bid over the whole bigram layer.
    pub fn predict(&self, exes: &HashMap<PathBuf, Exe>, last_running_timestamp: u64) {
        for item in &self.history {
            if let Some(&context) = self.nodes[self.root].children.get(item) {
                if !self.nodes[context].children.is_empty() {
                    self.bid_ppm(context, exes, last_running_timestamp);
                }
            }
        }

        if self.current_context != self.root
            && !self.nodes[self.current_context].children.is_empty()
        {
            self.bid_ppm(self.current_context, exes, last_running_timestamp);
            self.bid_neighbors(self.current_context, exes, last_running_timestamp);
        }

        self.bid_global_frequency(exes, last_running_timestamp);
    }

    /// Bid on every child of `context` proportionally to its share of the
    /// context's observations.
    fn bid_ppm(&self, context: NodeId, exes: &HashMap<PathBuf, Exe>, last_running_timestamp: u64) {
        let node = &self.nodes[context];
        let total: u64 = node
            .children
            .values()
            .map(|&child| self.nodes[child].count)
            .sum();
        if total == 0 {
            return;
        }

        for &child in node.children.values() {
            let child = &self.nodes[child];
            let Some(exe) = self.lookup_idle_exe(child, exes, last_running_timestamp) else {
                continue;
            };
            let confidence = (child.count as f64 / total as f64)
                .clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
            exe.add_lnprob((1.0 - confidence).ln());
            trace!(path = ?child.path, confidence, "vomm ppm bid");
        }
    }

    /// Weak constant bid on every neighbor of the deep context.
    fn bid_neighbors(
        &self,
        context: NodeId,
        exes: &HashMap<PathBuf, Exe>,
        last_running_timestamp: u64,
    ) {
        for &child in self.nodes[context].children.values() {
            let child = &self.nodes[child];
            if child.count == 0 {
                continue;
            }
            if let Some(exe) = self.lookup_idle_exe(child, exes, last_running_timestamp) {
                exe.add_lnprob((1.0 - NEIGHBOR_PROB).ln());
            }
        }
    }

    /// Bid on every exe in the bigram layer by its share of all observed
    /// transitions, dampened into [0.1, 0.5] so it cannot overpower the
    /// context-specific layers.
    fn bid_global_frequency(&self, exes: &HashMap<PathBuf, Exe>, last_running_timestamp: u64) {
        let grandchildren = || {
            self.nodes[self.root]
                .children
                .values()
                .flat_map(|&context| self.nodes[context].children.values().copied())
        };

        let total: u64 = grandchildren().map(|child| self.nodes[child].count).sum();
        if total == 0 {
            return;
        }

        for child in grandchildren() {
            let child = &self.nodes[child];
            if child.count == 0 {
                continue;
            }
            let Some(exe) = self.lookup_idle_exe(child, exes, last_running_timestamp) else {
                continue;
            };
            let share = child.count as f64 / total as f64;
            let confidence = (0.1 + share * 0.4).clamp(0.1, 0.5);
            exe.add_lnprob((1.0 - confidence).ln());
        }
    }

    fn lookup_idle_exe<'e>(
        &self,
        node: &VommNode,
        exes: &'e HashMap<PathBuf, Exe>,
        last_running_timestamp: u64,
    ) -> Option<&'e Exe> {
        let exe = exes.get(node.path.as_ref()?)?;
        // running exes are already in memory
        if exe.is_running(last_running_timestamp) {
            return None;
        }
        Some(exe)
    }

    /// Count recorded for `prev -> next` in the bigram layer.
    pub fn bigram_count(&self, prev: &Path, next: &Path) -> u64 {
        self.nodes[self.root]
            .children
            .get(prev)
            .and_then(|&context| self.nodes[context].children.get(next))
            .map(|&target| self.nodes[target].count)
            .unwrap_or(0)
    }

    pub fn root_children(&self) -> usize {
        self.nodes[self.root].children.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
