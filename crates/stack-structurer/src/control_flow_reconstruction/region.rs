// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Region tree produced by classification and refined by jump resolution.
//!
//! Regions refer to blocks by id; the statements and expressions of each block are
//! attached only when the tree is assembled.

use crate::bytecode::BlockId;
use crate::expression::short_circuit::Junction;
use serde::Serialize;

/// Regions nested deeper than this are rejected; the passes after classification
/// recurse once per level.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Branch condition over the exit tests of one or more blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The test ending `block`, true when its `taken` edge is followed.
    Branch(BlockId),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Blocks whose tests this condition evaluates, left to right.
    pub fn blocks(&self) -> Vec<BlockId> {
        match self {
            Condition::Branch(block) => vec![*block],
            Condition::Not(inner) => inner.blocks(),
            Condition::And(left, right) | Condition::Or(left, right) => {
                let mut blocks = left.blocks();
                blocks.extend(right.blocks());
                blocks
            }
        }
    }
}

impl Junction for Condition {
    fn conjoin(self, other: Self) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    fn disjoin(self, other: Self) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    fn negated(self) -> Self {
        match self {
            Condition::Not(inner) => *inner,
            other => Condition::Not(Box::new(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    /// `while (c) { .. }`, or `for` when an update clause is present.
    PreTest,
    /// `do { .. } while (c)`.
    PostTest,
    /// `while (true) { .. }` left by explicit breaks.
    Headerless,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseLabel {
    Int(i32),
    Char(u16),
    Enum { enum_type: String, constant: String },
    String(String),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopRegion {
    /// Identifies the loop for break/continue resolution.
    pub scope: usize,
    pub kind: LoopKind,
    pub header: BlockId,
    /// Continue-looping condition of pre- and post-test loops.
    pub condition: Option<Condition>,
    pub body: Box<Region>,
    pub update: Option<Box<Region>>,
    /// Where `continue` transfers control.
    pub continue_target: BlockId,
    /// Where `break` transfers control.
    pub exit: Option<BlockId>,
    /// Introduced to give forward jumps a break target; has no back edge.
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchArm {
    pub labels: Vec<CaseLabel>,
    pub target: BlockId,
    pub body: Region,
    pub fall_through: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchRegion {
    pub scope: usize,
    pub block: BlockId,
    pub arms: Vec<SwitchArm>,
    pub exit: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchArm {
    pub catch_type: Option<String>,
    pub handler: BlockId,
    pub body: Region,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TryRegion {
    pub entry: BlockId,
    pub body: Box<Region>,
    pub catches: Vec<CatchArm>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// The statements of one block.
    Leaf(BlockId),
    Sequence(Vec<Region>),
    If {
        block: BlockId,
        condition: Condition,
        then_region: Box<Region>,
        else_region: Box<Region>,
    },
    Loop(LoopRegion),
    Switch(SwitchRegion),
    Try(TryRegion),
    /// The return or throw ending `block`.
    Terminal(BlockId),
    /// Unresolved transfer from the end of `from` to `target`.
    Jump { from: BlockId, target: BlockId },
    Break { scope: usize, labeled: bool },
    Continue { scope: usize, labeled: bool },
}

impl Region {
    pub fn empty() -> Self {
        Region::Sequence(vec![])
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Region::Sequence(items) => items.iter().all(Region::is_empty),
            _ => false,
        }
    }

    /// Concatenates two regions, flattening sequences.
    pub fn then(self, next: Region) -> Region {
        let mut items = self.into_items();
        items.extend(next.into_items());
        if items.len() == 1 {
            items.pop().unwrap_or_else(Region::empty)
        } else {
            Region::Sequence(items)
        }
    }

    pub fn into_items(self) -> Vec<Region> {
        match self {
            Region::Sequence(items) => items,
            other => vec![other],
        }
    }

    /// Block where control enters the region, `None` for an empty region.
    pub fn entry(&self) -> Option<BlockId> {
        match self {
            Region::Leaf(block) | Region::Terminal(block) => Some(*block),
            Region::If { block, .. } => Some(*block),
            Region::Switch(switch) => Some(switch.block),
            Region::Loop(region) if region.synthetic => region.body.entry(),
            Region::Loop(region) => Some(region.header),
            Region::Try(region) => region.body.entry().or(Some(region.entry)),
            Region::Jump { target, .. } => Some(*target),
            Region::Sequence(items) => items.iter().find_map(Region::entry),
            Region::Break { .. } | Region::Continue { .. } => None,
        }
    }

    /// Direct sub-regions.
    pub fn children(&self) -> Vec<&Region> {
        match self {
            Region::Sequence(items) => items.iter().collect(),
            Region::If {
                then_region,
                else_region,
                ..
            } => vec![then_region.as_ref(), else_region.as_ref()],
            Region::Loop(region) => std::iter::once(region.body.as_ref())
                .chain(region.update.iter().map(|update| update.as_ref()))
                .collect(),
            Region::Switch(switch) => switch.arms.iter().map(|arm| &arm.body).collect(),
            Region::Try(region) => std::iter::once(region.body.as_ref())
                .chain(region.catches.iter().map(|catch| &catch.body))
                .collect(),
            _ => vec![],
        }
    }

    /// Pre-order visit.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Region)) {
        let mut stack = vec![self];
        while let Some(region) = stack.pop() {
            visit(region);
            stack.extend(region.children().into_iter().rev());
        }
    }

    /// Number of levels on the longest path from this region down to a leaf.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1)];
        while let Some((region, level)) = stack.pop() {
            deepest = deepest.max(level);
            stack.extend(region.children().into_iter().map(|child| (child, level + 1)));
        }
        deepest
    }

    /// Drops the region one level at a time instead of recursing through `Box` drops.
    pub fn dismantle(self) {
        let mut pending = vec![self];
        while let Some(region) = pending.pop() {
            match region {
                Region::Sequence(items) => pending.extend(items),
                Region::If {
                    then_region,
                    else_region,
                    ..
                } => {
                    pending.push(*then_region);
                    pending.push(*else_region);
                }
                Region::Loop(region) => {
                    pending.push(*region.body);
                    pending.extend(region.update.map(|update| *update));
                }
                Region::Switch(switch) => pending.extend(switch.arms.into_iter().map(|arm| arm.body)),
                Region::Try(region) => {
                    pending.push(*region.body);
                    pending.extend(region.catches.into_iter().map(|catch| catch.body));
                }
                _ => {}
            }
        }
    }

    /// Short name used in region paths of error reports.
    pub fn path_segment(&self) -> String {
        match self {
            Region::Leaf(block) => format!("block@{}", block),
            Region::Sequence(_) => "seq".to_string(),
            Region::If { block, .. } => format!("if@{}", block),
            Region::Loop(region) if region.synthetic => format!("block#{}", region.scope),
            Region::Loop(region) => format!("loop#{}@{}", region.scope, region.header),
            Region::Switch(switch) => format!("switch#{}@{}", switch.scope, switch.block),
            Region::Try(region) => format!("try@{}", region.entry),
            Region::Terminal(block) => format!("exit@{}", block),
            Region::Jump { from, target } => format!("jump@{}->{}", from, target),
            Region::Break { scope, .. } => format!("break#{}", scope),
            Region::Continue { scope, .. } => format!("continue#{}", scope),
        }
    }
}
