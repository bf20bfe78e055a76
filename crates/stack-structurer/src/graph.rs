// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Control-flow graph over the blocks of a method body.

use crate::bytecode::{BasicBlock, BlockId, ExceptionEntry, MethodBody, Terminator};
use crate::error::{ReconstructionError, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    FallThrough,
    BranchTrue,
    BranchFalse,
    Jump,
    /// `None` is the default target.
    SwitchCase(Option<i32>),
    ExceptionHandler {
        catch_type: Option<String>,
        start: BlockId,
        end: BlockId,
    },
}

impl EdgeKind {
    pub fn is_exceptional(&self) -> bool {
        matches!(self, EdgeKind::ExceptionHandler { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub source: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
}

/// Read-only view of a directed graph, shared by the dominance analysis and the
/// flow graph built on top of the expression summaries.
pub trait ControlFlow {
    fn entry(&self) -> BlockId;

    /// Exclusive upper bound on node ids.
    fn node_bound(&self) -> usize;

    fn contains(&self, node: BlockId) -> bool;

    /// Normal successors, in terminator order, without duplicates.
    fn successors(&self, node: BlockId) -> Vec<BlockId>;

    /// Handlers reachable by throwing from `node`.
    fn exceptional_successors(&self, node: BlockId) -> Vec<BlockId>;

    fn all_successors(&self, node: BlockId) -> Vec<BlockId> {
        let mut all = self.successors(node);
        for handler in self.exceptional_successors(node) {
            if !all.contains(&handler) {
                all.push(handler);
            }
        }
        all
    }
}

/// Immutable block graph of one method; edges are derived from terminators and the
/// exception table once at construction.
#[derive(Debug, Clone)]
pub struct BasicBlockGraph {
    blocks: Vec<BasicBlock>,
    exception_table: Vec<ExceptionEntry>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl BasicBlockGraph {
    pub fn new(method: &MethodBody) -> Result<Self> {
        let count = method.blocks.len();
        if count == 0 {
            return Err(ReconstructionError::structure(0, None, "method has no blocks"));
        }
        let check = |block: BlockId, target: BlockId| {
            if target < count {
                Ok(())
            } else {
                Err(ReconstructionError::structure(
                    block,
                    None,
                    format!("jump target {} out of range", target),
                ))
            }
        };

        let mut edges = vec![];
        for (id, block) in method.blocks.iter().enumerate() {
            match &block.terminator {
                Terminator::FallThrough(target) => {
                    check(id, *target)?;
                    edges.push(Edge {
                        source: id,
                        target: *target,
                        kind: EdgeKind::FallThrough,
                    });
                }
                Terminator::Jump(target) => {
                    check(id, *target)?;
                    edges.push(Edge {
                        source: id,
                        target: *target,
                        kind: EdgeKind::Jump,
                    });
                }
                Terminator::Branch {
                    taken, not_taken, ..
                } => {
                    check(id, *taken)?;
                    check(id, *not_taken)?;
                    edges.push(Edge {
                        source: id,
                        target: *taken,
                        kind: EdgeKind::BranchTrue,
                    });
                    edges.push(Edge {
                        source: id,
                        target: *not_taken,
                        kind: EdgeKind::BranchFalse,
                    });
                }
                Terminator::Switch(table) => {
                    for (key, target) in &table.cases {
                        check(id, *target)?;
                        edges.push(Edge {
                            source: id,
                            target: *target,
                            kind: EdgeKind::SwitchCase(Some(*key)),
                        });
                    }
                    check(id, table.default)?;
                    edges.push(Edge {
                        source: id,
                        target: table.default,
                        kind: EdgeKind::SwitchCase(None),
                    });
                }
                Terminator::Return | Terminator::Throw => {}
            }
        }

        for entry in &method.exception_table {
            if entry.start >= entry.end || entry.end > count || entry.handler >= count {
                return Err(ReconstructionError::structure(
                    entry.handler.min(count.saturating_sub(1)),
                    None,
                    format!(
                        "malformed exception range [{}, {}) -> {}",
                        entry.start, entry.end, entry.handler
                    ),
                ));
            }
            for source in entry.start..entry.end {
                edges.push(Edge {
                    source,
                    target: entry.handler,
                    kind: EdgeKind::ExceptionHandler {
                        catch_type: entry.catch_type.clone(),
                        start: entry.start,
                        end: entry.end,
                    },
                });
            }
        }

        let mut outgoing = vec![vec![]; count];
        let mut incoming = vec![vec![]; count];
        for (index, edge) in edges.iter().enumerate() {
            outgoing[edge.source].push(index);
            incoming[edge.target].push(index);
        }

        Ok(Self {
            blocks: method.blocks.clone(),
            exception_table: method.exception_table.clone(),
            edges,
            outgoing,
            incoming,
        })
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    pub fn outgoing(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.outgoing[id].iter().map(move |index| &self.edges[*index])
    }

    pub fn incoming(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.incoming[id].iter().map(move |index| &self.edges[*index])
    }

    /// Normal predecessors (duplicates removed, in edge order).
    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        let mut preds = vec![];
        for edge in self.incoming(id) {
            if !edge.kind.is_exceptional() && !preds.contains(&edge.source) {
                preds.push(edge.source);
            }
        }
        preds
    }

    pub fn is_handler(&self, id: BlockId) -> bool {
        self.exception_table.iter().any(|entry| entry.handler == id)
    }

    /// Catch type of the first exception entry dispatching to `handler`.
    pub fn handler_catch_type(&self, handler: BlockId) -> Option<Option<String>> {
        self.exception_table
            .iter()
            .find(|entry| entry.handler == handler)
            .map(|entry| entry.catch_type.clone())
    }
}

impl ControlFlow for BasicBlockGraph {
    fn entry(&self) -> BlockId {
        0
    }

    fn node_bound(&self) -> usize {
        self.blocks.len()
    }

    fn contains(&self, node: BlockId) -> bool {
        node < self.blocks.len()
    }

    fn successors(&self, node: BlockId) -> Vec<BlockId> {
        let mut succs = vec![];
        for edge in self.outgoing(node) {
            if !edge.kind.is_exceptional() && !succs.contains(&edge.target) {
                succs.push(edge.target);
            }
        }
        succs
    }

    fn exceptional_successors(&self, node: BlockId) -> Vec<BlockId> {
        let mut succs = vec![];
        for edge in self.outgoing(node) {
            if edge.kind.is_exceptional() && !succs.contains(&edge.target) {
                succs.push(edge.target);
            }
        }
        succs
    }
}
