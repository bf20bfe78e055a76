// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Short-circuit recognition over two-way decisions.
//!
//! `a || b` compiles to two conditional jumps sharing their "true" target, `a && b` to
//! two jumps sharing their "false" target. Given an outer decision `x` whose one arm is
//! a pure decision block `y`, and `S` the target both share:
//!
//! - `x ? S : (y ? S : R)` → `x || y`, then S, else R
//! - `x ? S : (y ? R : S)` → `x || !y`, then S, else R
//! - `x ? (y ? R : S) : S` → `x && y`, then R, else S
//! - `x ? (y ? S : R) : S` → `x && !y`, then R, else S
//!
//! Applying the rules until no pair matches yields arbitrarily nested mixes of `&&`
//! and `||`.

use super::node::ExpressionNode;
use super::simplify::negate;
use crate::bytecode::BlockId;

/// Boolean structure the fold rules need from a condition representation.
pub trait Junction: Sized {
    fn conjoin(self, other: Self) -> Self;
    fn disjoin(self, other: Self) -> Self;
    fn negated(self) -> Self;
}

impl Junction for ExpressionNode {
    fn conjoin(self, other: Self) -> Self {
        ExpressionNode::and(self, other)
    }

    fn disjoin(self, other: Self) -> Self {
        ExpressionNode::or(self, other)
    }

    fn negated(self) -> Self {
        negate(self)
    }
}

/// A two-way branch: `condition` true continues at `then_target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision<C> {
    pub condition: C,
    pub then_target: BlockId,
    pub else_target: BlockId,
}

impl<C: Junction> Decision<C> {
    pub fn flipped(self) -> Self {
        Decision {
            condition: self.condition.negated(),
            then_target: self.else_target,
            else_target: self.then_target,
        }
    }
}

/// How `inner` can be merged into `outer`, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldShape {
    Or,
    OrNot,
    And,
    AndNot,
}

/// Classifies the pair without consuming it. `inner_block` is the block holding
/// `inner`; it must be one of `outer`'s targets.
pub fn fold_shape(
    outer_then: BlockId,
    outer_else: BlockId,
    inner_block: BlockId,
    inner_then: BlockId,
    inner_else: BlockId,
) -> Option<FoldShape> {
    if outer_then == outer_else || inner_then == inner_else {
        return None;
    }
    if inner_then == inner_block || inner_else == inner_block {
        return None;
    }
    if outer_else == inner_block {
        if inner_then == outer_then {
            return Some(FoldShape::Or);
        }
        if inner_else == outer_then {
            return Some(FoldShape::OrNot);
        }
    }
    if outer_then == inner_block {
        if inner_else == outer_else {
            return Some(FoldShape::And);
        }
        if inner_then == outer_else {
            return Some(FoldShape::AndNot);
        }
    }
    None
}

/// Merges `inner` (held by `inner_block`) into `outer` when one of the four sharing
/// rules applies; otherwise hands both back unchanged.
pub fn fold_pair<C: Junction>(
    outer: Decision<C>,
    inner_block: BlockId,
    inner: Decision<C>,
) -> Result<Decision<C>, (Decision<C>, Decision<C>)> {
    let Some(shape) = fold_shape(
        outer.then_target,
        outer.else_target,
        inner_block,
        inner.then_target,
        inner.else_target,
    ) else {
        return Err((outer, inner));
    };
    let shared = match shape {
        FoldShape::Or | FoldShape::OrNot => outer.then_target,
        FoldShape::And | FoldShape::AndNot => outer.else_target,
    };
    Ok(match shape {
        FoldShape::Or => Decision {
            condition: outer.condition.disjoin(inner.condition),
            then_target: shared,
            else_target: inner.else_target,
        },
        FoldShape::OrNot => Decision {
            condition: outer.condition.disjoin(inner.condition.negated()),
            then_target: shared,
            else_target: inner.then_target,
        },
        FoldShape::And => Decision {
            condition: outer.condition.conjoin(inner.condition),
            then_target: inner.then_target,
            else_target: shared,
        },
        FoldShape::AndNot => Decision {
            condition: outer.condition.conjoin(inner.condition.negated()),
            then_target: inner.else_target,
            else_target: shared,
        },
    })
}
