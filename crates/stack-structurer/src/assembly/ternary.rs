// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Folds `if (c) { s = a; } else { s = b; }` over a compiler-introduced variable
//! into `s = c ? a : b`, and a switch assigning `s` in every case, default included,
//! into `s = switch (..) { .. }`.

use super::statement::{Statement, SwitchCase};
use crate::control_flow_reconstruction::region::CaseLabel;
use crate::expression::node::{ExpressionKind, ExpressionNode, SwitchValue, VariableId};
use crate::expression::simplify::{coerce_to, conditional};
use crate::expression::variables::VariableRegistry;

pub fn fold_conditionals(statements: &mut Vec<Statement>, registry: &VariableRegistry) {
    for statement in statements.iter_mut() {
        for body in statement.bodies_mut() {
            fold_conditionals(body, registry);
        }
        if let Some(folded) = fold_one(statement, registry) {
            *statement = folded;
        }
    }
}

/// `s = value` over a synthetic `s`.
fn synthetic_assignment<'s>(
    body: &'s [Statement],
    registry: &VariableRegistry,
) -> Option<(VariableId, &'s ExpressionNode)> {
    match body {
        [Statement::Expression(ExpressionNode {
            kind: ExpressionKind::Assignment { target, value },
            ..
        })] => {
            let id = target.as_variable()?;
            registry.is_synthetic(id).then_some((id, value.as_ref()))
        }
        _ => None,
    }
}

fn fold_one(statement: &Statement, registry: &VariableRegistry) -> Option<Statement> {
    if let Statement::Switch {
        label: None,
        selector,
        cases,
    } = statement
    {
        return fold_switch(selector, cases, registry);
    }
    let Statement::If {
        condition,
        then_body,
        else_body,
    } = statement
    else {
        return None;
    };
    let (then_id, then_value) = synthetic_assignment(then_body, registry)?;
    let (else_id, else_value) = synthetic_assignment(else_body, registry)?;
    if then_id != else_id {
        return None;
    }
    let ty = registry.get_type(then_id)?.clone();
    let value = conditional(
        condition.clone(),
        coerce_to(then_value.clone(), &ty),
        coerce_to(else_value.clone(), &ty),
        ty.clone(),
    );
    Some(Statement::assign(ExpressionNode::variable(then_id, ty), value))
}

fn fold_switch(selector: &ExpressionNode, cases: &[SwitchCase], registry: &VariableRegistry) -> Option<Statement> {
    let exhaustive = cases
        .iter()
        .any(|case| case.labels.contains(&CaseLabel::Default));
    if !exhaustive {
        return None;
    }
    let mut target = None;
    let mut arms = Vec::with_capacity(cases.len());
    for (index, case) in cases.iter().enumerate() {
        // every case but the last leaves with `break;`
        let assignment = match &case.body[..] {
            [assignment, Statement::Break { label: None }] => std::slice::from_ref(assignment),
            [_] if index + 1 == cases.len() => &case.body[..],
            _ => return None,
        };
        let (id, value) = synthetic_assignment(assignment, registry)?;
        if target.is_some_and(|target| target != id) {
            return None;
        }
        target = Some(id);
        arms.push((case.labels.clone(), value));
    }
    let id = target?;
    let ty = registry.get_type(id)?.clone();
    let arms = arms
        .into_iter()
        .map(|(labels, value)| SwitchValue {
            labels,
            value: coerce_to(value.clone(), &ty),
        })
        .collect();
    let value = ExpressionNode::new(
        ExpressionKind::Switch {
            selector: Box::new(selector.clone()),
            arms,
        },
        ty.clone(),
    );
    Some(Statement::assign(ExpressionNode::variable(id, ty), value))
}
