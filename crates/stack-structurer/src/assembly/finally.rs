// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Finally reconstruction.
//!
//! Compilers inline a `finally` body at every exit of the protected code and once more
//! in a catch-everything handler that rethrows:
//!
//! ```text
//! try { A; F; return; } catch (Throwable t) { F; throw t; }
//! ```
//!
//! The copy for normal completion sits either at the end of the protected code and of
//! each catch body, or once right after the whole statement when the compiler placed
//! it outside the protected range. When every exit carries an identical copy, the
//! copies are removed and the handler becomes `finally { F }`. Otherwise the tree is
//! left as it is, which is still a faithful rendering.

use super::statement::{count_variable, ends_abruptly, Statement};
use crate::expression::node::VariableId;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

pub fn deduplicate_finally(statements: &mut Vec<Statement>) {
    let mut index = 0;
    while index < statements.len() {
        for body in statements[index].bodies_mut() {
            deduplicate_finally(body);
        }
        if let Some((rewritten, trailing)) = extract_finally(&statements[index], &statements[index + 1..]) {
            statements[index] = rewritten;
            statements.drain(index + 1..index + 1 + trailing);
        }
        index += 1;
    }
}

/// The rewritten statement and how many statements after it were the normal-path copy.
fn extract_finally(statement: &Statement, following: &[Statement]) -> Option<(Statement, usize)> {
    let Statement::Try {
        body,
        catches,
        finally: None,
    } = statement
    else {
        return None;
    };
    let (any, handled) = catches.split_last()?;
    if any.catch_type.is_some() {
        return None;
    }
    let (last, code) = any.body.split_last()?;
    match last {
        Statement::Throw(thrown) if thrown.as_variable() == Some(any.variable) => {}
        _ => return None,
    }
    let mentions_caught = code
        .iter()
        .any(|statement| count_variable(std::slice::from_ref(statement), any.variable) > 0);
    if mentions_caught {
        return None;
    }
    let finally = code.to_vec();

    let mut body = body.clone();
    strip_before_exits(&mut body, &finally, &Enclosing::default())?;
    let mut kept = handled.to_vec();
    for clause in kept.iter_mut() {
        strip_before_exits(&mut clause.body, &finally, &Enclosing::default())?;
    }

    let mut stripped_body = body.clone();
    let mut stripped_clauses = kept.clone();
    let internal = strip_at_end(&mut stripped_body, &finally).is_some()
        && stripped_clauses
            .iter_mut()
            .all(|clause| strip_at_end(&mut clause.body, &finally).is_some());
    let trailing = if internal {
        body = stripped_body;
        kept = stripped_clauses;
        0
    } else if following.len() >= finally.len() && same_code(&following[..finally.len()], &finally) {
        finally.len()
    } else {
        return None;
    };
    debug!(
        "[deduplicate_finally] merged finally of {} statements",
        finally.len()
    );

    // try { try { A } catch (E e) { B } } finally { F }
    if kept.is_empty() {
        if let [Statement::Try {
            body: inner_body,
            catches: inner_catches,
            finally: None,
        }] = &body[..]
        {
            let merged = Statement::Try {
                body: inner_body.clone(),
                catches: inner_catches.clone(),
                finally: Some(finally),
            };
            return Some((merged, trailing));
        }
    }
    let rewritten = Statement::Try {
        body,
        catches: kept,
        finally: Some(finally),
    };
    Some((rewritten, trailing))
}

/// Loops and switches between a statement and the protected region's boundary.
#[derive(Debug, Clone, Default)]
struct Enclosing {
    loops: usize,
    breakables: usize,
    labels: BTreeSet<String>,
}

impl Enclosing {
    fn enter(&self, label: &Option<String>, is_loop: bool) -> Self {
        let mut inner = self.clone();
        inner.breakables += 1;
        if is_loop {
            inner.loops += 1;
        }
        inner.labels.extend(label.iter().cloned());
        inner
    }

    /// Whether control leaves the protected region through `statement`.
    fn leaves(&self, statement: &Statement) -> bool {
        match statement {
            Statement::Return(_) => true,
            Statement::Break { label: None } => self.breakables == 0,
            Statement::Continue { label: None } => self.loops == 0,
            Statement::Break { label: Some(label) } | Statement::Continue { label: Some(label) } => {
                !self.labels.contains(label)
            }
            _ => false,
        }
    }
}

fn strip_before_exits(statements: &mut Vec<Statement>, finally: &[Statement], enclosing: &Enclosing) -> Option<()> {
    let mut index = 0;
    while index < statements.len() {
        match &mut statements[index] {
            Statement::Loop {
                label, body, update, ..
            } => {
                let inner = enclosing.enter(label, true);
                strip_before_exits(body, finally, &inner)?;
                strip_before_exits(update, finally, &inner)?;
            }
            Statement::Switch { label, cases, .. } => {
                let inner = enclosing.enter(label, false);
                for case in cases.iter_mut() {
                    strip_before_exits(&mut case.body, finally, &inner)?;
                }
            }
            other => {
                for body in other.bodies_mut() {
                    strip_before_exits(body, finally, enclosing)?;
                }
            }
        }
        if enclosing.leaves(&statements[index]) {
            let start = index.checked_sub(finally.len())?;
            if !same_code(&statements[start..index], finally) {
                return None;
            }
            statements.drain(start..index);
            index = start;
        }
        index += 1;
    }
    Some(())
}

fn strip_at_end(statements: &mut Vec<Statement>, finally: &[Statement]) -> Option<()> {
    if ends_abruptly(statements) {
        return Some(());
    }
    if let Some(start) = statements.len().checked_sub(finally.len()) {
        if same_code(&statements[start..], finally) {
            statements.truncate(start);
            return Some(());
        }
    }
    match statements.last_mut() {
        Some(Statement::Try {
            body,
            catches,
            finally: None,
        }) => {
            strip_at_end(body, finally)?;
            for clause in catches.iter_mut() {
                strip_at_end(&mut clause.body, finally)?;
            }
            Some(())
        }
        _ => None,
    }
}

/// Equal up to the numbering of compiler-introduced variables.
fn same_code(left: &[Statement], right: &[Statement]) -> bool {
    left.len() == right.len() && canonical(left) == canonical(right)
}

fn canonical(statements: &[Statement]) -> Vec<Statement> {
    let mut renamed: BTreeMap<VariableId, VariableId> = BTreeMap::new();
    let mut statements = statements.to_vec();
    for statement in statements.iter_mut() {
        statement.rewrite_expressions(&mut |expr| {
            if let Some(id @ (VariableId::Stack(_) | VariableId::Temp(_))) = expr.as_variable() {
                let next = VariableId::Temp(renamed.len());
                let canonical = *renamed.entry(id).or_insert(next);
                expr.kind = crate::expression::node::ExpressionKind::Variable(canonical);
            }
        });
    }
    statements
}
