// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! The statement tree handed to emitters.

use crate::control_flow_reconstruction::region::{CaseLabel, LoopKind};
use crate::expression::node::{ExpressionKind, ExpressionNode, VariableId};
use crate::types::SemanticType;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchCase {
    pub labels: Vec<CaseLabel>,
    pub body: Vec<Statement>,
    /// Control continues into the next case's body.
    pub fall_through: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatchClause {
    /// `None` catches everything.
    pub catch_type: Option<String>,
    pub variable: VariableId,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    Expression(ExpressionNode),
    Declare {
        variable: VariableId,
        ty: SemanticType,
        value: Option<ExpressionNode>,
    },
    If {
        condition: ExpressionNode,
        then_body: Vec<Statement>,
        /// Empty when there is no else branch.
        else_body: Vec<Statement>,
    },
    Loop {
        kind: LoopKind,
        label: Option<String>,
        /// Absent for headerless loops.
        condition: Option<ExpressionNode>,
        body: Vec<Statement>,
        /// `for` update clause, run before each re-test.
        update: Vec<Statement>,
    },
    Switch {
        label: Option<String>,
        selector: ExpressionNode,
        cases: Vec<SwitchCase>,
    },
    Try {
        body: Vec<Statement>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<Statement>>,
    },
    Break {
        label: Option<String>,
    },
    Continue {
        label: Option<String>,
    },
    Return(Option<ExpressionNode>),
    Throw(ExpressionNode),
    Assert {
        condition: ExpressionNode,
        message: Option<ExpressionNode>,
    },
    MonitorEnter(ExpressionNode),
    MonitorExit(ExpressionNode),
}

impl Statement {
    /// `target = value` as an expression statement.
    pub fn assign(target: ExpressionNode, value: ExpressionNode) -> Self {
        Statement::Expression(ExpressionNode::assign(target, value))
    }

    /// Variable written by a plain `v = value;` statement.
    pub fn assigned_variable(&self) -> Option<VariableId> {
        match self {
            Statement::Expression(ExpressionNode {
                kind: ExpressionKind::Assignment { target, .. },
                ..
            }) => target.as_variable(),
            _ => None,
        }
    }

    /// Control never reaches the statement after this one.
    pub fn is_abrupt(&self) -> bool {
        match self {
            Statement::Break { .. }
            | Statement::Continue { .. }
            | Statement::Return(_)
            | Statement::Throw(_) => true,
            Statement::If {
                then_body,
                else_body,
                ..
            } => ends_abruptly(then_body) && ends_abruptly(else_body),
            _ => false,
        }
    }

    /// Expressions evaluated by this statement itself, not by nested statements.
    pub fn head_expressions(&self) -> Vec<&ExpressionNode> {
        match self {
            Statement::Expression(expr)
            | Statement::Throw(expr)
            | Statement::MonitorEnter(expr)
            | Statement::MonitorExit(expr) => vec![expr],
            Statement::Return(value) => value.iter().collect(),
            Statement::Declare { value, .. } => value.iter().collect(),
            Statement::If { condition, .. } => vec![condition],
            Statement::Loop { condition, .. } => condition.iter().collect(),
            Statement::Switch { selector, .. } => vec![selector],
            Statement::Assert { condition, message } => {
                std::iter::once(condition).chain(message.iter()).collect()
            }
            Statement::Try { .. } | Statement::Break { .. } | Statement::Continue { .. } => {
                vec![]
            }
        }
    }

    pub fn head_expressions_mut(&mut self) -> Vec<&mut ExpressionNode> {
        match self {
            Statement::Expression(expr)
            | Statement::Throw(expr)
            | Statement::MonitorEnter(expr)
            | Statement::MonitorExit(expr) => vec![expr],
            Statement::Return(value) => value.iter_mut().collect(),
            Statement::Declare { value, .. } => value.iter_mut().collect(),
            Statement::If { condition, .. } => vec![condition],
            Statement::Loop { condition, .. } => condition.iter_mut().collect(),
            Statement::Switch { selector, .. } => vec![selector],
            Statement::Assert { condition, message } => {
                std::iter::once(condition).chain(message.iter_mut()).collect()
            }
            Statement::Try { .. } | Statement::Break { .. } | Statement::Continue { .. } => {
                vec![]
            }
        }
    }

    /// Nested statement lists, in source order.
    pub fn bodies(&self) -> Vec<&Vec<Statement>> {
        match self {
            Statement::If {
                then_body,
                else_body,
                ..
            } => vec![then_body, else_body],
            Statement::Loop { body, update, .. } => vec![body, update],
            Statement::Switch { cases, .. } => cases.iter().map(|case| &case.body).collect(),
            Statement::Try {
                body,
                catches,
                finally,
            } => std::iter::once(body)
                .chain(catches.iter().map(|clause| &clause.body))
                .chain(finally.iter())
                .collect(),
            _ => vec![],
        }
    }

    pub fn bodies_mut(&mut self) -> Vec<&mut Vec<Statement>> {
        match self {
            Statement::If {
                then_body,
                else_body,
                ..
            } => vec![then_body, else_body],
            Statement::Loop { body, update, .. } => vec![body, update],
            Statement::Switch { cases, .. } => {
                cases.iter_mut().map(|case| &mut case.body).collect()
            }
            Statement::Try {
                body,
                catches,
                finally,
            } => std::iter::once(body)
                .chain(catches.iter_mut().map(|clause| &mut clause.body))
                .chain(finally.iter_mut())
                .collect(),
            _ => vec![],
        }
    }

    /// Every expression in this statement and the statements nested in it.
    pub fn walk_expressions<'a>(&'a self, visit: &mut impl FnMut(&'a ExpressionNode)) {
        for expr in self.head_expressions() {
            expr.walk(visit);
        }
        for body in self.bodies() {
            for statement in body {
                statement.walk_expressions(visit);
            }
        }
    }

    pub fn rewrite_expressions(&mut self, f: &mut impl FnMut(&mut ExpressionNode)) {
        for expr in self.head_expressions_mut() {
            expr.rewrite(f);
        }
        for body in self.bodies_mut() {
            for statement in body.iter_mut() {
                statement.rewrite_expressions(f);
            }
        }
    }
}

pub fn ends_abruptly(statements: &[Statement]) -> bool {
    statements.last().is_some_and(Statement::is_abrupt)
}

/// Counts reads and writes of `id` across `statements`.
pub fn count_variable(statements: &[Statement], id: VariableId) -> usize {
    let mut count = 0;
    for statement in statements {
        if let Statement::Declare { variable, .. } = statement {
            if *variable == id {
                count += 1;
            }
        }
        if let Statement::Try { catches, .. } = statement {
            count += catches.iter().filter(|clause| clause.variable == id).count();
        }
        statement.walk_expressions(&mut |expr| {
            if expr.as_variable() == Some(id) {
                count += 1;
            }
        });
        for body in statement.bodies() {
            // walk_expressions already covered nested expressions; only nested
            // declarations and catch variables remain.
            count += count_bindings(body, id);
        }
    }
    count
}

fn count_bindings(statements: &[Statement], id: VariableId) -> usize {
    let mut count = 0;
    for statement in statements {
        match statement {
            Statement::Declare { variable, .. } if *variable == id => count += 1,
            Statement::Try { catches, .. } => {
                count += catches.iter().filter(|clause| clause.variable == id).count();
            }
            _ => {}
        }
        for body in statement.bodies() {
            count += count_bindings(body, id);
        }
    }
    count
}
