// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Source-level cleanups on the finished statement tree.

use super::statement::{ends_abruptly, Statement};
use crate::error::{ReconstructionError, Result};
use crate::expression::node::{ExpressionKind, ExpressionNode, UnaryOp};
use crate::expression::simplify::{negate, simplify};

const ASSERTIONS_DISABLED: &str = "$assertionsDisabled";

/// `if (!$assertionsDisabled && !c) throw new AssertionError(m);` → `assert c : m;`
pub fn recognize_asserts(statements: &mut [Statement]) {
    for statement in statements.iter_mut() {
        for body in statement.bodies_mut() {
            recognize_asserts(body);
        }
        if let Some(assert) = as_assert(statement) {
            *statement = assert;
        }
    }
}

fn is_assertions_disabled(expr: &ExpressionNode) -> bool {
    matches!(&expr.kind, ExpressionKind::Field { target: None, field } if field.name == ASSERTIONS_DISABLED)
}

fn is_assertions_enabled(expr: &ExpressionNode) -> bool {
    match &expr.kind {
        ExpressionKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => is_assertions_disabled(operand),
        _ => false,
    }
}

fn as_assert(statement: &Statement) -> Option<Statement> {
    let Statement::If {
        condition,
        then_body,
        else_body,
    } = statement
    else {
        return None;
    };
    if !else_body.is_empty() {
        return None;
    }
    let [Statement::Throw(ExpressionNode {
        kind: ExpressionKind::NewObject { class, arguments, .. },
        ..
    })] = &then_body[..]
    else {
        return None;
    };
    if !class.ends_with("AssertionError") {
        return None;
    }
    let asserted = match &condition.kind {
        // assert false;
        _ if is_assertions_enabled(condition) => ExpressionNode::boolean(false),
        ExpressionKind::LogicalAnd(enabled, failed) if is_assertions_enabled(enabled) => {
            simplify(negate(failed.as_ref().clone()))
        }
        _ => return None,
    };
    Some(Statement::Assert {
        condition: asserted,
        message: arguments.first().cloned(),
    })
}

/// Puts non-empty arms first and lifts the else arm out after an arm that never
/// completes normally.
pub fn tidy_conditionals(statements: &mut Vec<Statement>) {
    let mut tidied = Vec::with_capacity(statements.len());
    for mut statement in statements.drain(..) {
        for body in statement.bodies_mut() {
            tidy_conditionals(body);
        }
        if let Statement::If {
            condition,
            then_body,
            else_body,
        } = &mut statement
        {
            // if (c) {} else { B } → if (!c) { B }
            // if (c) { A } else { B; break; } → if (!c) { B; break; } A
            let abrupt_else = !ends_abruptly(then_body) && ends_abruptly(else_body);
            if (then_body.is_empty() || abrupt_else) && !else_body.is_empty() {
                let placeholder = ExpressionNode::boolean(false);
                *condition = negate(std::mem::replace(condition, placeholder));
                std::mem::swap(then_body, else_body);
            }
            // if (c) { A; return; } else { B } → if (c) { A; return; } B
            if ends_abruptly(then_body) && !else_body.is_empty() {
                let lifted = std::mem::take(else_body);
                tidied.push(statement);
                tidied.extend(lifted);
                continue;
            }
        }
        tidied.push(statement);
    }
    *statements = tidied;
}

/// Drops the implicit `return;` ending a void method, including the copies left at the
/// end of the arms of a final `if` and of the body and catch clauses of a final `try`.
/// A `finally` body is left alone.
pub fn strip_trailing_return(statements: &mut Vec<Statement>) {
    match statements.last_mut() {
        Some(Statement::Return(None)) => {
            statements.pop();
        }
        Some(Statement::If {
            then_body,
            else_body,
            ..
        }) => {
            strip_arm_return(then_body);
            strip_arm_return(else_body);
        }
        Some(Statement::Try { body, catches, .. }) => {
            strip_trailing_return(body);
            for catch in catches.iter_mut() {
                strip_trailing_return(&mut catch.body);
            }
        }
        _ => {}
    }
}

// `if (c) return;` keeps its return rather than becoming `if (c) {}`.
fn strip_arm_return(arm: &mut Vec<Statement>) {
    if arm.len() > 1 || !matches!(arm.last(), Some(Statement::Return(None))) {
        strip_trailing_return(arm);
    }
}

/// Fails on stack values or objects the structuring never resolved.
pub fn check_complete(statements: &[Statement]) -> Result<()> {
    let mut leftover = None;
    for statement in statements {
        statement.walk_expressions(&mut |expr| {
            if leftover.is_some() {
                return;
            }
            match &expr.kind {
                ExpressionKind::Placeholder { block, slot } => {
                    leftover = Some(ReconstructionError::structure(
                        *block,
                        Some(*slot),
                        "stack value was never resolved",
                    ));
                }
                ExpressionKind::Uninitialized { block, operand, .. } => {
                    leftover = Some(ReconstructionError::structure(
                        *block,
                        Some(*operand),
                        "object used before its constructor ran",
                    ));
                }
                _ => {}
            }
        });
    }
    match leftover {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
