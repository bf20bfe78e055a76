// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Places one declaration per variable in the innermost statement list enclosing all
//! of its uses. Variables with no remaining use get none.

use super::statement::Statement;
use crate::expression::node::{ExpressionKind, ExpressionNode, VariableId};
use crate::expression::variables::VariableRegistry;
use crate::types::SemanticType;
use log::trace;

pub fn insert_declarations(root: &mut Vec<Statement>, registry: &VariableRegistry) {
    for info in registry.entries() {
        if info.parameter || unbound_occurrences(root, info.id) == 0 {
            continue;
        }
        declare_in(root, info.id, &info.ty);
    }
}

/// Occurrences of `id`, not counting catch clauses that bind it themselves.
fn unbound_occurrences(statements: &[Statement], id: VariableId) -> usize {
    statements
        .iter()
        .map(|statement| head_occurrences(statement, id) + part_occurrences(statement, id).iter().sum::<usize>())
        .sum()
}

fn head_occurrences(statement: &Statement, id: VariableId) -> usize {
    let declared = matches!(statement, Statement::Declare { variable, .. } if *variable == id);
    usize::from(declared)
        + statement
            .head_expressions()
            .iter()
            .map(|expr| expr.count_variable(id))
            .sum::<usize>()
}

/// Per nested statement list, in `Statement::bodies` order.
fn part_occurrences(statement: &Statement, id: VariableId) -> Vec<usize> {
    match statement {
        Statement::Try {
            body,
            catches,
            finally,
        } => std::iter::once(unbound_occurrences(body, id))
            .chain(catches.iter().map(|clause| {
                if clause.variable == id {
                    0
                } else {
                    unbound_occurrences(&clause.body, id)
                }
            }))
            .chain(finally.iter().map(|body| unbound_occurrences(body, id)))
            .collect(),
        _ => statement
            .bodies()
            .into_iter()
            .map(|body| unbound_occurrences(body, id))
            .collect(),
    }
}

fn declare_in(statements: &mut Vec<Statement>, id: VariableId, ty: &SemanticType) {
    let containing: Vec<usize> = statements
        .iter()
        .enumerate()
        .filter(|(_, statement)| unbound_occurrences(std::slice::from_ref(*statement), id) > 0)
        .map(|(index, _)| index)
        .collect();
    let Some(&first) = containing.first() else {
        return;
    };

    if let [only] = containing[..] {
        let statement = &mut statements[only];
        if head_occurrences(statement, id) == 0 {
            let parts = part_occurrences(statement, id);
            let used: Vec<usize> = (0..parts.len()).filter(|index| parts[*index] > 0).collect();
            // a loop's update clause cannot hold a declaration
            let update_part = matches!(statement, Statement::Loop { .. }).then_some(1);
            if let [part] = used[..] {
                if Some(part) != update_part {
                    if let Some(body) = statement.bodies_mut().into_iter().nth(part) {
                        declare_in(body, id, ty);
                        return;
                    }
                }
            }
        }
    }

    trace!("[insert_declarations] declaring {:?} before statement {}", id, first);
    match initializer(&statements[first], id) {
        Some(value) => {
            statements[first] = Statement::Declare {
                variable: id,
                ty: ty.clone(),
                value: Some(value),
            };
        }
        None => statements.insert(
            first,
            Statement::Declare {
                variable: id,
                ty: ty.clone(),
                value: None,
            },
        ),
    }
}

/// Value of a leading `id = value;` that can become `T id = value;`.
fn initializer(statement: &Statement, id: VariableId) -> Option<ExpressionNode> {
    match statement {
        Statement::Expression(ExpressionNode {
            kind: ExpressionKind::Assignment { target, value },
            ..
        }) if target.as_variable() == Some(id) && !value.reads_variable(id) => Some(value.as_ref().clone()),
        _ => None,
    }
}
