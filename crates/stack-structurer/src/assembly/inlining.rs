// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Inlines compiler-introduced variables written once and read once by the very
//! next statement, when moving the value does not reorder any observable effect.

use super::statement::Statement;
use crate::expression::node::{ExpressionKind, ExpressionNode, VariableId};
use crate::expression::simplify::coerce_to;
use crate::expression::variables::VariableRegistry;
use log::trace;
use std::collections::BTreeMap;

pub fn inline_temporaries(root: &mut Vec<Statement>, registry: &VariableRegistry) {
    loop {
        let counts = occurrences(root);
        if !inline_in(root, &counts, registry) {
            break;
        }
    }
}

/// Reads, writes and bindings of every variable.
pub(super) fn occurrences(statements: &[Statement]) -> BTreeMap<VariableId, usize> {
    let mut counts = BTreeMap::new();
    collect(statements, &mut counts);
    counts
}

fn collect(statements: &[Statement], counts: &mut BTreeMap<VariableId, usize>) {
    for statement in statements {
        match statement {
            Statement::Declare { variable, .. } => *counts.entry(*variable).or_default() += 1,
            Statement::Try { catches, .. } => {
                for clause in catches {
                    *counts.entry(clause.variable).or_default() += 1;
                }
            }
            _ => {}
        }
        for expr in statement.head_expressions() {
            expr.walk(&mut |node| {
                if let Some(id) = node.as_variable() {
                    *counts.entry(id).or_default() += 1;
                }
            });
        }
        for body in statement.bodies() {
            collect(body, counts);
        }
    }
}

/// Performs one inlining somewhere under `statements`.
fn inline_in(
    statements: &mut Vec<Statement>,
    counts: &BTreeMap<VariableId, usize>,
    registry: &VariableRegistry,
) -> bool {
    for index in 0..statements.len().saturating_sub(1) {
        let Some((id, value)) = single_definition(&statements[index], counts, registry) else {
            continue;
        };
        let next = &statements[index + 1];
        if matches!(next, Statement::Loop { .. }) || !movable_into(next, id, &value) {
            continue;
        }
        let ty = registry.get_type(id).cloned().unwrap_or_else(|| value.ty.clone());
        let replacement = coerce_to(value, &ty);
        for expr in statements[index + 1].head_expressions_mut() {
            expr.rewrite(&mut |node| {
                if node.as_variable() == Some(id) {
                    *node = replacement.clone();
                }
            });
        }
        statements.remove(index);
        trace!("[inline_temporaries] inlined {:?}", id);
        return true;
    }
    statements
        .iter_mut()
        .any(|statement| statement.bodies_mut().into_iter().any(|body| inline_in(body, counts, registry)))
}

/// `v = value;` where `v` is synthetic and otherwise appears exactly once.
fn single_definition(
    statement: &Statement,
    counts: &BTreeMap<VariableId, usize>,
    registry: &VariableRegistry,
) -> Option<(VariableId, ExpressionNode)> {
    let Statement::Expression(ExpressionNode {
        kind: ExpressionKind::Assignment { target, value },
        ..
    }) = statement
    else {
        return None;
    };
    let id = target.as_variable()?;
    let candidate = registry.is_synthetic(id)
        && !registry.is_parameter(id)
        && counts.get(&id) == Some(&2)
        && !value.reads_variable(id)
        && !matches!(value.kind, ExpressionKind::CaughtException);
    candidate.then(|| (id, value.as_ref().clone()))
}

/// Whether `value` can replace the read of `id` in the head of `next`.
fn movable_into(next: &Statement, id: VariableId, value: &ExpressionNode) -> bool {
    let effects = value.has_side_effects();
    let mut order = Evaluation {
        id,
        value_reads_memory: value.reads_memory() || effects,
        value_effects: effects,
        clean: true,
    };
    for expr in next.head_expressions() {
        match order.find_use(expr) {
            Some(movable) => return movable,
            None => order.passed(expr),
        }
    }
    false
}

struct Evaluation {
    id: VariableId,
    value_reads_memory: bool,
    value_effects: bool,
    /// Nothing evaluated so far conflicts with moving the value.
    clean: bool,
}

impl Evaluation {
    fn passed(&mut self, expr: &ExpressionNode) {
        if expr.has_side_effects() || (self.value_reads_memory && expr.reads_memory()) {
            self.clean = false;
        }
    }

    /// `None` when `expr` does not read the variable.
    fn find_use(&mut self, expr: &ExpressionNode) -> Option<bool> {
        if expr.as_variable() == Some(self.id) {
            return Some(self.clean);
        }
        if !expr.reads_variable(self.id) {
            return None;
        }
        match &expr.kind {
            // a write, not a read
            ExpressionKind::Assignment { target, .. } | ExpressionKind::Increment { target, .. }
                if target.as_variable() == Some(self.id) =>
            {
                return Some(false)
            }
            _ => {}
        }
        let lazy = matches!(
            expr.kind,
            ExpressionKind::LogicalAnd(..)
                | ExpressionKind::LogicalOr(..)
                | ExpressionKind::Conditional { .. }
                | ExpressionKind::Switch { .. }
        );
        for (index, child) in expr.children().into_iter().enumerate() {
            match self.find_use(child) {
                // only evaluated on some paths
                Some(_) if lazy && index > 0 && self.value_effects => return Some(false),
                Some(movable) => return Some(movable),
                None => self.passed(child),
            }
        }
        Some(false)
    }
}
