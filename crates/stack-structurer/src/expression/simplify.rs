// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Boolean simplification and context coercion for expression trees.
//!
//! The stack machine has no boolean or char values, so `true` arrives as the integer
//! `1` and a boolean `c ? 1 : 0` is the shape of any value-producing condition. These
//! helpers restore the source-level forms:
//! - Double negation: !!x → x
//! - Comparison negation: !(a < b) → a >= b, flipping NaN semantics for floats
//! - De Morgan: !(a && b) → !a || !b
//! - Boolean conditionals: c ? true : false → c, c ? x : false → c && x, ...

use super::node::{ExpressionKind, ExpressionNode, Literal, UnaryOp};
use crate::bytecode::CompareOp;
use crate::types::SemanticType;

/// Logical negation, pushed inwards where the result stays readable.
pub fn negate(expr: ExpressionNode) -> ExpressionNode {
    let ExpressionNode { kind, ty } = expr;
    match kind {
        // !!x → x
        ExpressionKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => *operand,

        // !(a op b) → a inverse(op) b; ordered float comparisons become unordered
        ExpressionKind::Comparison {
            op,
            semantics,
            left,
            right,
        } => ExpressionNode::new(
            ExpressionKind::Comparison {
                op: op.inverse(),
                semantics: semantics.negate(),
                left,
                right,
            },
            ty,
        ),

        // !(a && b) → !a || !b
        ExpressionKind::LogicalAnd(left, right) => {
            ExpressionNode::or(negate(*left), negate(*right))
        }

        // !(a || b) → !a && !b
        ExpressionKind::LogicalOr(left, right) => {
            ExpressionNode::and(negate(*left), negate(*right))
        }

        ExpressionKind::Constant(Literal::Boolean(value)) => ExpressionNode::boolean(!value),

        // !(c ? a : b) → c ? !a : !b
        ExpressionKind::Conditional {
            condition,
            then_value,
            else_value,
        } => ExpressionNode::new(
            ExpressionKind::Conditional {
                condition,
                then_value: Box::new(negate(*then_value)),
                else_value: Box::new(negate(*else_value)),
            },
            SemanticType::Boolean,
        ),

        kind => ExpressionNode::not(ExpressionNode::new(kind, ty)),
    }
}

/// Adapts an int-typed stack value to the type its consumer expects.
pub fn coerce_to(expr: ExpressionNode, target: &SemanticType) -> ExpressionNode {
    match target {
        SemanticType::Boolean => to_boolean(expr),
        SemanticType::Char => to_char(expr),
        _ => expr,
    }
}

fn to_boolean(mut expr: ExpressionNode) -> ExpressionNode {
    if expr.ty == SemanticType::Boolean {
        return expr;
    }
    if is_slot(&expr) {
        if expr.ty.is_int_like() {
            expr.ty = SemanticType::Boolean;
        }
        return expr;
    }
    match expr.kind {
        ExpressionKind::Constant(Literal::Int(0)) => ExpressionNode::boolean(false),
        ExpressionKind::Constant(Literal::Int(1)) => ExpressionNode::boolean(true),
        ExpressionKind::Conditional {
            condition,
            then_value,
            else_value,
        } => conditional(
            *condition,
            to_boolean(*then_value),
            to_boolean(*else_value),
            SemanticType::Boolean,
        ),
        // x & y, x | y, x ^ y on booleans stay non-short-circuit boolean operators
        ExpressionKind::Binary {
            op: op @ (crate::bytecode::ArithmeticOp::And
            | crate::bytecode::ArithmeticOp::Or
            | crate::bytecode::ArithmeticOp::Xor),
            kind,
            left,
            right,
        } => ExpressionNode::new(
            ExpressionKind::Binary {
                op,
                kind,
                left: Box::new(to_boolean(*left)),
                right: Box::new(to_boolean(*right)),
            },
            SemanticType::Boolean,
        ),
        kind => ExpressionNode::new(kind, expr.ty),
    }
}

fn to_char(mut expr: ExpressionNode) -> ExpressionNode {
    if expr.ty == SemanticType::Char {
        return expr;
    }
    if is_slot(&expr) {
        if expr.ty == SemanticType::Int {
            expr.ty = SemanticType::Char;
        }
        return expr;
    }
    match expr.kind {
        ExpressionKind::Constant(Literal::Int(value)) if (0..=0xFFFF).contains(&value) => {
            ExpressionNode::literal(Literal::Char(value as u16))
        }
        ExpressionKind::Conditional {
            condition,
            then_value,
            else_value,
        } => ExpressionNode::new(
            ExpressionKind::Conditional {
                condition,
                then_value: Box::new(to_char(*then_value)),
                else_value: Box::new(to_char(*else_value)),
            },
            SemanticType::Char,
        ),
        kind => ExpressionNode::new(kind, expr.ty),
    }
}

/// Variables and unresolved stack slots take the type of their context.
fn is_slot(expr: &ExpressionNode) -> bool {
    matches!(
        expr.kind,
        ExpressionKind::Variable(_) | ExpressionKind::Placeholder { .. }
    )
}

/// Builds `condition ? then_value : else_value`, collapsing boolean shapes.
pub fn conditional(
    condition: ExpressionNode,
    then_value: ExpressionNode,
    else_value: ExpressionNode,
    ty: SemanticType,
) -> ExpressionNode {
    if ty == SemanticType::Boolean {
        let literal = |node: &ExpressionNode| match node.kind {
            ExpressionKind::Constant(Literal::Boolean(value)) => Some(value),
            _ => None,
        };
        match (literal(&then_value), literal(&else_value)) {
            // c ? true : false → c
            (Some(true), Some(false)) => return condition,
            // c ? false : true → !c
            (Some(false), Some(true)) => return negate(condition),
            // c ? true : x → c || x
            (Some(true), None) => return ExpressionNode::or(condition, else_value),
            // c ? false : x → !c && x
            (Some(false), None) => return ExpressionNode::and(negate(condition), else_value),
            // c ? x : true → !c || x
            (None, Some(true)) => return ExpressionNode::or(negate(condition), then_value),
            // c ? x : false → c && x
            (None, Some(false)) => return ExpressionNode::and(condition, then_value),
            _ => {}
        }
    }
    ExpressionNode::new(
        ExpressionKind::Conditional {
            condition: Box::new(condition),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
        },
        ty,
    )
}

/// Condition tested by `ifXX` against zero.
pub fn compare_with_zero(op: CompareOp, value: ExpressionNode) -> ExpressionNode {
    if value.ty == SemanticType::Boolean {
        return match op {
            // b != 0 → b
            CompareOp::Ne => value,
            // b == 0 → !b
            CompareOp::Eq => negate(value),
            _ => comparison(op, super::node::NanSemantics::Integral, value, ExpressionNode::int(0)),
        };
    }
    let zero = match value.ty {
        SemanticType::Char => ExpressionNode::literal(Literal::Char(0)),
        _ => ExpressionNode::int(0),
    };
    comparison(op, super::node::NanSemantics::Integral, value, zero)
}

pub fn comparison(
    op: CompareOp,
    semantics: super::node::NanSemantics,
    left: ExpressionNode,
    right: ExpressionNode,
) -> ExpressionNode {
    // Align an int literal with a boolean or char operand on the other side.
    let (left, right) = if left.ty == SemanticType::Boolean || left.ty == SemanticType::Char {
        let target = left.ty.clone();
        (left, coerce_to(right, &target))
    } else if right.ty == SemanticType::Boolean || right.ty == SemanticType::Char {
        let target = right.ty.clone();
        (coerce_to(left, &target), right)
    } else {
        (left, right)
    };
    ExpressionNode::new(
        ExpressionKind::Comparison {
            op,
            semantics,
            left: Box::new(left),
            right: Box::new(right),
        },
        SemanticType::Boolean,
    )
}

/// Bottom-up cleanup of a finished expression.
pub fn simplify(mut expr: ExpressionNode) -> ExpressionNode {
    expr.rewrite(&mut |node| {
        if let ExpressionKind::Unary {
            op: UnaryOp::Not, ..
        } = node.kind
        {
            let placeholder = ExpressionNode::boolean(false);
            let taken = std::mem::replace(node, placeholder);
            if let ExpressionKind::Unary { operand, .. } = taken.kind {
                *node = negate(*operand);
            }
        }
    });
    expr
}
