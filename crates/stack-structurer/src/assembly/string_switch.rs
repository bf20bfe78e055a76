// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Folds the two switches javac emits for a `switch` on a string back into one:
//!
//! ```text
//! tmp = s; idx = -1;
//! switch (tmp.hashCode()) { case 97: if (tmp.equals("a")) idx = 0; break; .. }
//! switch (idx) { case 0: A; .. default: D; }
//! ```
//!
//! becomes `switch (s) { case "a": A; .. default: D; }`.

use super::inlining::occurrences;
use super::statement::{Statement, SwitchCase};
use crate::bytecode::CompareOp;
use crate::control_flow_reconstruction::region::CaseLabel;
use crate::expression::node::{ExpressionKind, ExpressionNode, Literal, UnaryOp, VariableId};
use crate::types::SemanticType;
use log::debug;
use std::collections::BTreeMap;

pub fn fold_string_switches(root: &mut Vec<Statement>) {
    let counts = occurrences(root);
    fold_in(root, &counts);
}

fn fold_in(statements: &mut Vec<Statement>, counts: &BTreeMap<VariableId, usize>) {
    for statement in statements.iter_mut() {
        for body in statement.bodies_mut() {
            fold_in(body, counts);
        }
    }
    let mut index = 0;
    while index + 1 < statements.len() {
        match fold_at(statements, index, counts) {
            Some(start) => index = start + 1,
            None => index += 1,
        }
    }
}

/// The pieces of one javac string switch, found around the `hashCode` switch.
struct Lowered {
    /// First statement of the pattern.
    start: usize,
    selector: ExpressionNode,
    /// `idx` value to the string that selects it.
    keys: BTreeMap<i32, String>,
}

/// Replaces the pattern whose `hashCode` switch sits at `index`; returns where the
/// folded switch now is.
fn fold_at(statements: &mut Vec<Statement>, index: usize, counts: &BTreeMap<VariableId, usize>) -> Option<usize> {
    let lowered = match_lowering(statements, index, counts)?;
    let Statement::Switch { label, cases, .. } = &mut statements[index + 1] else {
        return None;
    };
    let label = label.take();
    let cases = std::mem::take(cases);
    let cases = cases
        .into_iter()
        .map(|case| SwitchCase {
            labels: case
                .labels
                .into_iter()
                .map(|label| match label {
                    CaseLabel::Int(key) => lowered
                        .keys
                        .get(&key)
                        .map(|string| CaseLabel::String(string.clone()))
                        .unwrap_or(CaseLabel::Int(key)),
                    other => other,
                })
                .collect(),
            ..case
        })
        .collect();
    statements.splice(
        lowered.start..=index + 1,
        [Statement::Switch {
            label,
            selector: lowered.selector,
            cases,
        }],
    );
    debug!("[fold_string_switches] folded string switch at {}", lowered.start);
    Some(lowered.start)
}

fn match_lowering(statements: &[Statement], index: usize, counts: &BTreeMap<VariableId, usize>) -> Option<Lowered> {
    let Statement::Switch {
        label: None,
        selector: hashed,
        cases: hash_cases,
    } = &statements[index]
    else {
        return None;
    };
    let tmp = hash_code_receiver(hashed)?;
    let Statement::Switch {
        selector: index_selector,
        cases: string_cases,
        ..
    } = statements.get(index + 1)?
    else {
        return None;
    };
    let idx = index_selector.as_variable()?;
    let (idx_init, init_value) = assignment(statements.get(index.checked_sub(1)?)?)?;
    if idx_init != idx || init_value.as_int() != Some(-1) {
        return None;
    }

    let mut keys = BTreeMap::new();
    for case in hash_cases {
        if case.labels.iter().any(|label| !matches!(label, CaseLabel::Int(_))) {
            return None;
        }
        equals_chain(&case.body, tmp, idx, &mut keys)?;
    }
    let every_key_known = string_cases.iter().flat_map(|case| &case.labels).all(|label| match label {
        CaseLabel::Int(key) => keys.contains_key(key),
        CaseLabel::Default => true,
        _ => false,
    });
    if keys.is_empty() || !every_key_known {
        return None;
    }

    // `tmp = s;` right before, unless the string was already in a variable
    let copied = index
        .checked_sub(2)
        .and_then(|before| assignment(&statements[before]))
        .filter(|(id, _)| *id == tmp);
    let (start, selector, tmp_defs) = match copied {
        Some((_, value)) => (index - 2, value.clone(), 1),
        None => (index - 1, ExpressionNode::variable(tmp, hashed_type(hashed)), 0),
    };

    // Neither variable may be used outside the pattern.
    let tmp_uses = tmp_defs + 1 + keys.len();
    let idx_uses = 1 + keys.len() + 1;
    if counts.get(&tmp) != Some(&tmp_uses) || counts.get(&idx) != Some(&idx_uses) {
        return None;
    }
    Some(Lowered { start, selector, keys })
}

fn hash_code_receiver(selector: &ExpressionNode) -> Option<VariableId> {
    match &selector.kind {
        ExpressionKind::MethodCall {
            method,
            receiver: Some(receiver),
            arguments,
            ..
        } if method.name == "hashCode" && arguments.is_empty() => receiver.as_variable(),
        _ => None,
    }
}

fn hashed_type(selector: &ExpressionNode) -> SemanticType {
    match &selector.kind {
        ExpressionKind::MethodCall {
            receiver: Some(receiver),
            ..
        } => receiver.ty.clone(),
        _ => SemanticType::string(),
    }
}

/// `v = value;`
fn assignment(statement: &Statement) -> Option<(VariableId, &ExpressionNode)> {
    match statement {
        Statement::Expression(ExpressionNode {
            kind: ExpressionKind::Assignment { target, value },
            ..
        }) => Some((target.as_variable()?, value.as_ref())),
        _ => None,
    }
}

fn without_trailing_breaks(body: &[Statement]) -> &[Statement] {
    let mut end = body.len();
    while end > 0 && matches!(body[end - 1], Statement::Break { label: None }) {
        end -= 1;
    }
    &body[..end]
}

/// Body of one `hashCode` case: `if (tmp.equals("a")) idx = k;` tests, possibly
/// chained through `else` for strings sharing a hash.
fn equals_chain(body: &[Statement], tmp: VariableId, idx: VariableId, keys: &mut BTreeMap<i32, String>) -> Option<()> {
    for statement in without_trailing_breaks(body) {
        let Statement::If {
            condition,
            then_body,
            else_body,
        } = statement
        else {
            return None;
        };
        let (string, negated) = equals_test(condition, tmp)?;
        let (hit, miss) = if negated {
            (else_body, then_body)
        } else {
            (then_body, else_body)
        };
        let [assigned] = without_trailing_breaks(hit) else {
            return None;
        };
        let (target, value) = assignment(assigned)?;
        if target != idx {
            return None;
        }
        let key = value.as_int()?;
        if keys.insert(key, string).is_some() {
            return None;
        }
        equals_chain(miss, tmp, idx, keys)?;
    }
    Some(())
}

/// `tmp.equals("a")`, and whether the test is negated.
fn equals_test(condition: &ExpressionNode, tmp: VariableId) -> Option<(String, bool)> {
    match &condition.kind {
        ExpressionKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => equals_test(operand, tmp).map(|(string, negated)| (string, !negated)),
        ExpressionKind::Comparison { op, left, right, .. } if right.as_int() == Some(0) => match op {
            CompareOp::Ne => equals_test(left, tmp),
            CompareOp::Eq => equals_test(left, tmp).map(|(string, negated)| (string, !negated)),
            _ => None,
        },
        ExpressionKind::MethodCall {
            method,
            receiver: Some(receiver),
            arguments,
            ..
        } if method.name == "equals" && receiver.as_variable() == Some(tmp) => match &arguments[..] {
            [ExpressionNode {
                kind: ExpressionKind::Constant(Literal::String(string)),
                ..
            }] => Some((string.clone(), false)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{InvokeKind, MethodRef};

    const TMP: VariableId = VariableId::Local(2);
    const IDX: VariableId = VariableId::Local(3);

    fn s() -> ExpressionNode {
        ExpressionNode::variable(VariableId::Local(1), SemanticType::string())
    }

    fn var(id: VariableId, ty: SemanticType) -> ExpressionNode {
        ExpressionNode::variable(id, ty)
    }

    fn call(receiver: ExpressionNode, name: &str, descriptor: &str, arguments: Vec<ExpressionNode>, ty: SemanticType) -> ExpressionNode {
        ExpressionNode::new(
            ExpressionKind::MethodCall {
                kind: InvokeKind::Virtual,
                method: MethodRef {
                    owner: "java/lang/String".to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                },
                receiver: Some(Box::new(receiver)),
                arguments,
            },
            ty,
        )
    }

    fn equals(string: &str) -> ExpressionNode {
        call(
            var(TMP, SemanticType::string()),
            "equals",
            "(Ljava/lang/Object;)Z",
            vec![ExpressionNode::literal(Literal::String(string.to_string()))],
            SemanticType::Boolean,
        )
    }

    fn set_idx(key: i32) -> Statement {
        Statement::assign(var(IDX, SemanticType::Int), ExpressionNode::int(key))
    }

    fn case(labels: Vec<CaseLabel>, body: Vec<Statement>) -> SwitchCase {
        SwitchCase {
            labels,
            body,
            fall_through: false,
        }
    }

    fn log(value: i32) -> Statement {
        Statement::Expression(call(s(), "log", "(I)V", vec![ExpressionNode::int(value)], SemanticType::Void))
    }

    /// switch (s) { case "a": log(1); break; case "Aa": case "BB": log(2); break; default: log(3); }
    fn lowered() -> Vec<Statement> {
        let hash_switch = Statement::Switch {
            label: None,
            selector: call(var(TMP, SemanticType::string()), "hashCode", "()I", vec![], SemanticType::Int),
            cases: vec![
                case(
                    vec![CaseLabel::Int(97)],
                    vec![
                        Statement::If {
                            condition: equals("a"),
                            then_body: vec![set_idx(0), Statement::Break { label: None }],
                            else_body: vec![],
                        },
                        Statement::Break { label: None },
                    ],
                ),
                // "Aa" and "BB" share a hash
                case(
                    vec![CaseLabel::Int(2112)],
                    vec![Statement::If {
                        condition: ExpressionNode::not(equals("Aa")),
                        then_body: vec![Statement::If {
                            condition: equals("BB"),
                            then_body: vec![set_idx(2)],
                            else_body: vec![],
                        }],
                        else_body: vec![set_idx(1)],
                    }],
                ),
            ],
        };
        let index_switch = Statement::Switch {
            label: None,
            selector: var(IDX, SemanticType::Int),
            cases: vec![
                case(vec![CaseLabel::Int(0)], vec![log(1), Statement::Break { label: None }]),
                case(vec![CaseLabel::Int(1), CaseLabel::Int(2)], vec![log(2), Statement::Break { label: None }]),
                case(vec![CaseLabel::Default], vec![log(3)]),
            ],
        };
        vec![
            Statement::assign(var(TMP, SemanticType::string()), s()),
            Statement::assign(var(IDX, SemanticType::Int), ExpressionNode::int(-1)),
            hash_switch,
            index_switch,
        ]
    }

    #[test]
    fn test_string_switch_is_folded() {
        let mut statements = lowered();
        fold_string_switches(&mut statements);
        let [Statement::Switch { selector, cases, .. }] = &statements[..] else {
            panic!("expected one switch: {:#?}", statements);
        };
        assert_eq!(selector, &s());
        assert_eq!(cases[0].labels, vec![CaseLabel::String("a".to_string())]);
        assert_eq!(
            cases[1].labels,
            vec![CaseLabel::String("Aa".to_string()), CaseLabel::String("BB".to_string())]
        );
        assert_eq!(cases[2].labels, vec![CaseLabel::Default]);
        assert_eq!(cases[1].body, vec![log(2), Statement::Break { label: None }]);
    }

    #[test]
    fn test_folded_inside_nested_bodies() {
        let mut statements = vec![Statement::If {
            condition: ExpressionNode::boolean(true),
            then_body: lowered(),
            else_body: vec![],
        }];
        fold_string_switches(&mut statements);
        let Statement::If { then_body, .. } = &statements[0] else {
            panic!("expected an if");
        };
        assert_eq!(then_body.len(), 1);
    }

    #[test]
    fn test_index_read_later_keeps_both_switches() {
        let mut statements = lowered();
        statements.push(Statement::Return(Some(var(IDX, SemanticType::Int))));
        let expected = statements.clone();
        fold_string_switches(&mut statements);
        assert_eq!(statements, expected);
    }

    #[test]
    fn test_unknown_index_keeps_both_switches() {
        let mut statements = lowered();
        if let Statement::Switch { cases, .. } = &mut statements[3] {
            cases[0].labels = vec![CaseLabel::Int(7)];
        }
        let expected = statements.clone();
        fold_string_switches(&mut statements);
        assert_eq!(statements, expected);
    }
}
