// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Dominance analysis and natural loop discovery.
//!
//! Dominators are computed with the iterative algorithm of Cooper, Harvey and Kennedy
//! ("A Simple, Fast Dominance Algorithm") over reverse post-order. Exception edges count
//! as ordinary edges for dominance but never as loop back edges.

use crate::bytecode::BlockId;
use crate::error::Diagnostic;
use crate::graph::ControlFlow;
use log::{debug, warn};
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: BlockId,
    idom: Vec<Option<BlockId>>,
    rpo: Vec<BlockId>,
    rpo_index: Vec<Option<usize>>,
    children: Vec<Vec<BlockId>>,
    frontiers: Vec<BTreeSet<BlockId>>,
    /// Entry and exit times of a walk over the dominator tree; `a` dominates `b` when
    /// the interval of `a` encloses that of `b`.
    intervals: Vec<(usize, usize)>,
    /// Normal (non-exceptional) predecessors, restricted to reachable nodes.
    preds: Vec<Vec<BlockId>>,
}

impl DominatorTree {
    pub fn compute<G: ControlFlow + ?Sized>(view: &G) -> Self {
        let bound = view.node_bound();
        let entry = view.entry();
        let rpo = reverse_post_order(view);
        let mut rpo_index = vec![None; bound];
        for (index, node) in rpo.iter().enumerate() {
            rpo_index[*node] = Some(index);
        }

        let mut all_preds: Vec<Vec<BlockId>> = vec![vec![]; bound];
        let mut preds: Vec<Vec<BlockId>> = vec![vec![]; bound];
        for &node in &rpo {
            for succ in view.successors(node) {
                if !preds[succ].contains(&node) {
                    preds[succ].push(node);
                }
            }
            for succ in view.all_successors(node) {
                if !all_preds[succ].contains(&node) {
                    all_preds[succ].push(node);
                }
            }
        }

        let mut idom: Vec<Option<BlockId>> = vec![None; bound];
        idom[entry] = Some(entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &node in rpo.iter().skip(1) {
                let mut new_idom = None;
                for &pred in &all_preds[node] {
                    if idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo_index, pred, current),
                    });
                }
                if new_idom.is_some() && idom[node] != new_idom {
                    idom[node] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![vec![]; bound];
        for &node in rpo.iter().skip(1) {
            if let Some(parent) = idom[node] {
                children[parent].push(node);
            }
        }

        let mut intervals = vec![(usize::MAX, 0); bound];
        if !rpo.is_empty() {
            let mut clock = 0;
            let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
            while let Some((node, next_child)) = stack.pop() {
                if next_child == 0 {
                    intervals[node].0 = clock;
                    clock += 1;
                }
                if let Some(&child) = children[node].get(next_child) {
                    stack.push((node, next_child + 1));
                    stack.push((child, 0));
                } else {
                    intervals[node].1 = clock;
                    clock += 1;
                }
            }
        }

        // Frontiers over all edges, so handlers land in the frontier of their try bodies.
        let mut frontiers = vec![BTreeSet::new(); bound];
        for &node in &rpo {
            if all_preds[node].len() < 2 {
                continue;
            }
            let Some(node_idom) = idom[node] else {
                continue;
            };
            for &pred in &all_preds[node] {
                let mut runner = pred;
                while runner != node_idom {
                    frontiers[runner].insert(node);
                    match idom[runner] {
                        Some(next) if next != runner => runner = next,
                        _ => break,
                    }
                }
            }
        }

        debug!(
            "[DominatorTree::compute] {} reachable of {} nodes",
            rpo.len(),
            bound
        );

        Self {
            entry,
            idom,
            rpo,
            rpo_index,
            children,
            frontiers,
            intervals,
            preds,
        }
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn is_reachable(&self, node: BlockId) -> bool {
        self.rpo_index.get(node).is_some_and(|index| index.is_some())
    }

    /// Immediate dominator; `None` for the entry and unreachable nodes.
    pub fn idom(&self, node: BlockId) -> Option<BlockId> {
        if node == self.entry {
            return None;
        }
        self.idom.get(node).copied().flatten()
    }

    pub fn reverse_post_order(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Position in reverse post-order; unreachable nodes sort last.
    pub fn rpo_number(&self, node: BlockId) -> usize {
        self.rpo_index
            .get(node)
            .copied()
            .flatten()
            .unwrap_or(usize::MAX)
    }

    pub fn children(&self, node: BlockId) -> &[BlockId] {
        &self.children[node]
    }

    pub fn frontier(&self, node: BlockId) -> &BTreeSet<BlockId> {
        &self.frontiers[node]
    }

    pub fn predecessors(&self, node: BlockId) -> &[BlockId] {
        &self.preds[node]
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let (a_enter, a_leave) = self.intervals[a];
        let (b_enter, b_leave) = self.intervals[b];
        a_enter <= b_enter && b_leave <= a_leave
    }

    /// An edge `source -> target` is a back edge when the target dominates the source.
    pub fn is_back_edge(&self, source: BlockId, target: BlockId) -> bool {
        self.dominates(target, source)
    }

    /// Normal predecessors that reach `node` along forward edges.
    pub fn forward_predecessors(&self, node: BlockId) -> Vec<BlockId> {
        self.preds[node]
            .iter()
            .copied()
            .filter(|pred| !self.is_back_edge(*pred, node))
            .collect()
    }

    /// Post-order of the dominator tree, children visited in reverse post-order.
    /// Uses an explicit stack so deeply nested code cannot exhaust the call stack.
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.rpo.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        while let Some((node, next_child)) = stack.pop() {
            if let Some(&child) = self.children[node].get(next_child) {
                stack.push((node, next_child + 1));
                stack.push((child, 0));
            } else {
                order.push(node);
            }
        }
        order
    }

    /// All nodes dominated by `node`, including itself.
    pub fn subtree(&self, node: BlockId) -> BTreeSet<BlockId> {
        let mut nodes = BTreeSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if nodes.insert(current) {
                stack.extend(self.children[current].iter().copied());
            }
        }
        nodes
    }
}

fn intersect(
    idom: &[Option<BlockId>],
    rpo_index: &[Option<usize>],
    mut b1: BlockId,
    mut b2: BlockId,
) -> BlockId {
    let number = |node: BlockId| rpo_index[node].unwrap_or(usize::MAX);
    while b1 != b2 {
        while number(b1) > number(b2) {
            match idom[b1] {
                Some(parent) => b1 = parent,
                None => return b2,
            }
        }
        while number(b2) > number(b1) {
            match idom[b2] {
                Some(parent) => b2 = parent,
                None => return b1,
            }
        }
    }
    b1
}

fn reverse_post_order<G: ControlFlow + ?Sized>(view: &G) -> Vec<BlockId> {
    let bound = view.node_bound();
    let mut visited = vec![false; bound];
    let mut post = Vec::new();
    let entry = view.entry();
    if !view.contains(entry) {
        return post;
    }
    visited[entry] = true;
    let mut stack: Vec<(BlockId, Vec<BlockId>, usize)> = vec![(entry, view.all_successors(entry), 0)];
    while let Some((node, succs, index)) = stack.last_mut() {
        if let Some(&succ) = succs.get(*index) {
            *index += 1;
            if view.contains(succ) && !visited[succ] {
                visited[succ] = true;
                let next = view.all_successors(succ);
                stack.push((succ, next, 0));
            }
        } else {
            post.push(*node);
            stack.pop();
        }
    }
    post.reverse();
    post
}

/// A loop found from back edges. Loops sharing a header are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalLoop {
    pub header: BlockId,
    pub body: BTreeSet<BlockId>,
    /// Sources of back edges to the header.
    pub latches: BTreeSet<BlockId>,
    /// Set when the loop approximates an irreducible cycle.
    pub irreducible: bool,
}

/// Natural loops keyed by header, plus diagnostics for cycles without a dominating
/// header. An irreducible cycle is approximated by a loop headed at its first node in
/// reverse post-order; the entries that bypass it are left as jumps.
pub fn find_natural_loops<G: ControlFlow + ?Sized>(
    view: &G,
    dom: &DominatorTree,
) -> (BTreeMap<BlockId, NaturalLoop>, Vec<Diagnostic>) {
    let mut loops: BTreeMap<BlockId, NaturalLoop> = BTreeMap::new();
    for &node in dom.reverse_post_order() {
        for succ in view.successors(node) {
            if dom.is_back_edge(node, succ) {
                let entry = loops.entry(succ).or_insert_with(|| NaturalLoop {
                    header: succ,
                    body: BTreeSet::from([succ]),
                    latches: BTreeSet::new(),
                    irreducible: false,
                });
                entry.latches.insert(node);
            }
        }
    }

    for natural in loops.values_mut() {
        let mut stack: Vec<BlockId> = natural.latches.iter().copied().collect();
        while let Some(node) = stack.pop() {
            if natural.body.insert(node) {
                stack.extend(dom.predecessors(node).iter().copied());
            }
        }
    }

    let mut diagnostics = vec![];
    for component in cycles(view, dom) {
        let dominated = component
            .iter()
            .any(|candidate| component.iter().all(|node| dom.dominates(*candidate, *node)));
        if dominated {
            continue;
        }
        let Some(&header) = component.iter().min_by_key(|node| dom.rpo_number(**node)) else {
            continue;
        };
        warn!(
            "[find_natural_loops] irreducible cycle over {:?}, approximated at block {}",
            component, header
        );
        diagnostics.push(Diagnostic::UnstructuredGraph {
            block: header,
            detail: format!(
                "cycle over blocks {:?} has no dominating header",
                component
            ),
        });
        let latches: BTreeSet<BlockId> = component
            .iter()
            .copied()
            .filter(|node| view.successors(*node).contains(&header))
            .collect();
        let natural = loops.entry(header).or_insert_with(|| NaturalLoop {
            header,
            body: BTreeSet::new(),
            latches: BTreeSet::new(),
            irreducible: true,
        });
        natural.irreducible = true;
        natural.body.extend(component.iter().copied());
        natural.latches.extend(latches);
    }

    (loops, diagnostics)
}

/// Strongly connected components of the normal-edge graph that contain a cycle.
fn cycles<G: ControlFlow + ?Sized>(view: &G, dom: &DominatorTree) -> Vec<BTreeSet<BlockId>> {
    let mut graph: DiGraph<BlockId, ()> = DiGraph::new();
    let mut index_of: BTreeMap<BlockId, NodeIndex> = BTreeMap::new();
    for &node in dom.reverse_post_order() {
        index_of.insert(node, graph.add_node(node));
    }
    for &node in dom.reverse_post_order() {
        for succ in view.successors(node) {
            if let (Some(&from), Some(&to)) = (index_of.get(&node), index_of.get(&succ)) {
                graph.add_edge(from, to, ());
            }
        }
    }

    kosaraju_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|index| graph.contains_edge(*index, *index))
        })
        .map(|component| component.into_iter().map(|index| graph[index]).collect())
        .collect()
}
