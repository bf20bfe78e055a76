// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Flow graph over the block graph with short-circuit chains condensed.
//!
//! A block whose only job is to test a condition and whose single predecessor is
//! another test is folded into that predecessor, so `if (a && b || c)` becomes one
//! node with a composite condition instead of three diamonds.

use super::region::Condition;
use crate::bytecode::{BlockId, SwitchTable, Terminator};
use crate::expression::short_circuit::{fold_pair, fold_shape, Decision};
use crate::graph::{BasicBlockGraph, ControlFlow};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub enum FlowExit {
    Goto(BlockId),
    Branch(Decision<Condition>),
    Switch(SwitchTable),
    /// Return or throw.
    Terminal,
}

impl FlowExit {
    pub fn targets(&self) -> Vec<BlockId> {
        let mut targets = vec![];
        let raw = match self {
            FlowExit::Goto(target) => vec![*target],
            FlowExit::Branch(decision) => vec![decision.then_target, decision.else_target],
            FlowExit::Switch(table) => Terminator::Switch(table.clone()).targets(),
            FlowExit::Terminal => vec![],
        };
        for target in raw {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowNode {
    /// Block the node starts with; its statements run before the exit.
    pub block: BlockId,
    /// Statement-free test blocks absorbed into the exit condition.
    pub folded: Vec<BlockId>,
    pub exit: FlowExit,
    handlers: Vec<BlockId>,
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    bound: usize,
    nodes: BTreeMap<BlockId, FlowNode>,
    handlers: BTreeSet<BlockId>,
}

impl FlowGraph {
    /// Builds one node per block, then condenses short-circuit chains when `fold`
    /// is set. `has_statements` tells which blocks do more than test.
    pub fn new(graph: &BasicBlockGraph, has_statements: &BTreeSet<BlockId>, fold: bool) -> Self {
        let mut nodes = BTreeMap::new();
        for (id, block) in graph.blocks().iter().enumerate() {
            let exit = match &block.terminator {
                Terminator::FallThrough(target) | Terminator::Jump(target) => {
                    FlowExit::Goto(*target)
                }
                Terminator::Branch {
                    taken, not_taken, ..
                } if taken == not_taken => FlowExit::Goto(*taken),
                Terminator::Branch {
                    taken, not_taken, ..
                } => FlowExit::Branch(Decision {
                    condition: Condition::Branch(id),
                    then_target: *taken,
                    else_target: *not_taken,
                }),
                Terminator::Switch(table) => FlowExit::Switch(table.clone()),
                Terminator::Return | Terminator::Throw => FlowExit::Terminal,
            };
            nodes.insert(
                id,
                FlowNode {
                    block: id,
                    folded: vec![],
                    exit,
                    handlers: graph.exceptional_successors(id),
                },
            );
        }
        let handlers = graph
            .exception_table()
            .iter()
            .map(|entry| entry.handler)
            .collect();
        let mut flow = Self {
            bound: graph.len(),
            nodes,
            handlers,
        };
        if fold {
            flow.condense(has_statements);
        }
        flow
    }

    pub fn node(&self, id: BlockId) -> Option<&FlowNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    pub fn is_handler(&self, id: BlockId) -> bool {
        self.handlers.contains(&id)
    }

    fn normal_predecessors(&self) -> BTreeMap<BlockId, Vec<BlockId>> {
        let mut preds: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            for target in node.exit.targets() {
                preds.entry(target).or_default().push(*id);
            }
        }
        preds
    }

    /// A test block `inner` reached only from the test `outer` that one of the
    /// sharing rules can merge.
    fn foldable(
        &self,
        outer: BlockId,
        preds: &BTreeMap<BlockId, Vec<BlockId>>,
        has_statements: &BTreeSet<BlockId>,
    ) -> Option<BlockId> {
        let outer_node = self.nodes.get(&outer)?;
        let FlowExit::Branch(outer_decision) = &outer_node.exit else {
            return None;
        };
        [outer_decision.then_target, outer_decision.else_target]
            .into_iter()
            .find(|&inner| {
                let Some(inner_node) = self.nodes.get(&inner) else {
                    return false;
                };
                let FlowExit::Branch(inner_decision) = &inner_node.exit else {
                    return false;
                };
                inner != outer
                    && inner != self.entry()
                    && !has_statements.contains(&inner)
                    && !self.handlers.contains(&inner)
                    && inner_node.handlers == outer_node.handlers
                    && preds.get(&inner).is_some_and(|p| p.as_slice() == [outer])
                    && fold_shape(
                        outer_decision.then_target,
                        outer_decision.else_target,
                        inner,
                        inner_decision.then_target,
                        inner_decision.else_target,
                    )
                    .is_some()
            })
    }

    fn condense(&mut self, has_statements: &BTreeSet<BlockId>) {
        loop {
            let preds = self.normal_predecessors();
            let Some((outer, inner)) = self
                .nodes
                .keys()
                .find_map(|&outer| self.foldable(outer, &preds, has_statements).map(|inner| (outer, inner)))
            else {
                break;
            };
            let Some(inner_node) = self.nodes.remove(&inner) else {
                break;
            };
            let Some(outer_node) = self.nodes.get_mut(&outer) else {
                break;
            };
            let outer_exit = std::mem::replace(&mut outer_node.exit, FlowExit::Terminal);
            let (FlowExit::Branch(outer_decision), FlowExit::Branch(inner_decision)) =
                (outer_exit, inner_node.exit)
            else {
                break;
            };
            outer_node.exit = match fold_pair(outer_decision, inner, inner_decision) {
                Ok(folded) => FlowExit::Branch(folded),
                Err((outer_decision, _)) => FlowExit::Branch(outer_decision),
            };
            outer_node.folded.push(inner);
            outer_node.folded.extend(inner_node.folded);
            debug!("[FlowGraph::condense] folded block {} into {}", inner, outer);
        }
    }
}

impl ControlFlow for FlowGraph {
    fn entry(&self) -> BlockId {
        0
    }

    fn node_bound(&self) -> usize {
        self.bound
    }

    fn contains(&self, node: BlockId) -> bool {
        self.nodes.contains_key(&node)
    }

    fn successors(&self, node: BlockId) -> Vec<BlockId> {
        self.nodes
            .get(&node)
            .map(|flow_node| flow_node.exit.targets())
            .unwrap_or_default()
    }

    fn exceptional_successors(&self, node: BlockId) -> Vec<BlockId> {
        self.nodes
            .get(&node)
            .map(|flow_node| flow_node.handlers.clone())
            .unwrap_or_default()
    }
}
