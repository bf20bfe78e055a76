// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use super::declarations::insert_declarations;
use super::finally::deduplicate_finally;
use super::inlining::inline_temporaries;
use super::statement::{ends_abruptly, CatchClause, Statement, SwitchCase};
use super::string_switch::fold_string_switches;
use super::ternary::fold_conditionals;
use super::tidy::{check_complete, recognize_asserts, strip_trailing_return, tidy_conditionals};
use crate::bytecode::BlockId;
use crate::control_flow_reconstruction::region::{CaseLabel, CatchArm, Condition, LoopKind, Region};
use crate::error::{ReconstructionError, Result};
use crate::expression::builder::{BlockSummary, BuiltMethod, ExitExpression};
use crate::expression::enum_switch::{enum_selector, enum_switch_table};
use crate::expression::node::{ExpressionKind, ExpressionNode};
use crate::expression::simplify::{negate, simplify};
use crate::expression::variables::VariableRegistry;
use crate::options::ReconstructionOptions;
use crate::types::SemanticType;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Statement tree of one method plus the variables it refers to.
#[derive(Debug)]
pub struct AssembledMethod {
    pub body: Vec<Statement>,
    pub registry: VariableRegistry,
}

/// Attaches block statements to a resolved region tree and runs the cleanup passes.
pub struct StatementTreeAssembler<'a> {
    blocks: BTreeMap<BlockId, BlockSummary>,
    registry: VariableRegistry,
    return_type: SemanticType,
    labels: &'a BTreeMap<usize, String>,
    options: &'a ReconstructionOptions,
    with_statements: BTreeSet<BlockId>,
    /// Blocks already lowered.
    consumed: BTreeSet<BlockId>,
}

impl<'a> StatementTreeAssembler<'a> {
    pub fn new(
        built: BuiltMethod,
        labels: &'a BTreeMap<usize, String>,
        options: &'a ReconstructionOptions,
    ) -> Self {
        Self {
            with_statements: built.blocks_with_statements(),
            blocks: built.blocks,
            registry: built.registry,
            return_type: built.return_type,
            labels,
            options,
            consumed: BTreeSet::new(),
        }
    }

    pub fn assemble(mut self, region: Region) -> Result<AssembledMethod> {
        let mut body = vec![];
        self.lower(region, &mut body)?;
        if let Some((block, _)) = self
            .blocks
            .iter()
            .find(|(block, summary)| !summary.statements.is_empty() && !self.consumed.contains(block))
        {
            return Err(ReconstructionError::structure(
                *block,
                None,
                "statements of block were never placed",
            ));
        }

        if self.options.fold_conditionals {
            fold_conditionals(&mut body, &self.registry);
        }
        if self.options.inline_temporaries {
            inline_temporaries(&mut body, &self.registry);
        }
        deduplicate_finally(&mut body);
        if self.options.inline_temporaries {
            // `tmp = x; return tmp;` left behind by finally copies
            inline_temporaries(&mut body, &self.registry);
        }
        if self.options.recognize_asserts {
            recognize_asserts(&mut body);
        }
        tidy_conditionals(&mut body);
        if self.options.recognize_string_switches {
            fold_string_switches(&mut body);
        }
        if self.return_type == SemanticType::Void {
            strip_trailing_return(&mut body);
        }
        insert_declarations(&mut body, &self.registry);
        check_complete(&body)?;
        debug!("[StatementTreeAssembler::assemble] {} top-level statements", body.len());
        Ok(AssembledMethod {
            body,
            registry: self.registry,
        })
    }

    fn label(&self, scope: usize, labeled: bool) -> Option<String> {
        if labeled {
            self.labels.get(&scope).cloned()
        } else {
            None
        }
    }

    fn exit_of(&self, block: BlockId) -> Result<&ExitExpression> {
        self.blocks
            .get(&block)
            .map(|summary| &summary.exit)
            .ok_or_else(|| ReconstructionError::structure(block, None, "block has no expressions"))
    }

    fn condition(&self, condition: &Condition) -> Result<ExpressionNode> {
        Ok(match condition {
            Condition::Branch(block) => match self.exit_of(*block)? {
                ExitExpression::Branch(expr) => expr.clone(),
                _ => {
                    return Err(ReconstructionError::structure(
                        *block,
                        None,
                        "block does not end in a conditional branch",
                    ))
                }
            },
            Condition::Not(inner) => negate(self.condition(inner)?),
            Condition::And(left, right) => ExpressionNode::and(self.condition(left)?, self.condition(right)?),
            Condition::Or(left, right) => ExpressionNode::or(self.condition(left)?, self.condition(right)?),
        })
    }

    fn lower_into(&mut self, region: Region) -> Result<Vec<Statement>> {
        let mut statements = vec![];
        self.lower(region, &mut statements)?;
        Ok(statements)
    }

    fn lower(&mut self, region: Region, out: &mut Vec<Statement>) -> Result<()> {
        match region {
            Region::Leaf(block) => {
                let statements = self
                    .blocks
                    .get_mut(&block)
                    .map(|summary| std::mem::take(&mut summary.statements))
                    .unwrap_or_default();
                // only a statement-free block may be placed more than once
                if !self.consumed.insert(block) && self.with_statements.contains(&block) {
                    return Err(ReconstructionError::structure(block, None, "block placed twice"));
                }
                out.extend(statements);
            }
            Region::Sequence(items) => {
                for item in items {
                    self.lower(item, out)?;
                }
            }
            Region::If {
                condition,
                then_region,
                else_region,
                ..
            } => {
                let condition = simplify(self.condition(&condition)?);
                let then_body = self.lower_into(*then_region)?;
                let else_body = self.lower_into(*else_region)?;
                out.push(Statement::If {
                    condition,
                    then_body,
                    else_body,
                });
            }
            Region::Loop(region) => {
                let label = self.labels.get(&region.scope).cloned();
                let mut body = self.lower_into(*region.body)?;
                if region.synthetic {
                    if !ends_abruptly(&body) {
                        body.push(Statement::Break { label: None });
                    }
                    out.push(Statement::Loop {
                        kind: LoopKind::Headerless,
                        label,
                        condition: None,
                        body,
                        update: vec![],
                    });
                    return Ok(());
                }
                let condition = match &region.condition {
                    Some(condition) => Some(simplify(self.condition(condition)?)),
                    None => None,
                };
                let update = match region.update {
                    Some(update) => self.lower_into(*update)?,
                    None => vec![],
                };
                out.push(Statement::Loop {
                    kind: region.kind,
                    label,
                    condition,
                    body,
                    update,
                });
            }
            Region::Switch(switch) => {
                let label = self.labels.get(&switch.scope).cloned();
                let selector = match self.exit_of(switch.block)? {
                    ExitExpression::Switch(selector) => selector.clone(),
                    _ => {
                        return Err(ReconstructionError::structure(
                            switch.block,
                            None,
                            "block does not end in a switch",
                        ))
                    }
                };
                let on_enum = switch
                    .arms
                    .iter()
                    .any(|arm| arm.labels.iter().any(|label| matches!(label, CaseLabel::Enum { .. })));
                let selector = if on_enum || enum_switch_table(&selector).is_some() {
                    enum_selector(selector)
                } else {
                    selector
                };
                let mut cases = vec![];
                for arm in switch.arms {
                    cases.push(SwitchCase {
                        labels: arm.labels,
                        body: self.lower_into(arm.body)?,
                        fall_through: false,
                    });
                }
                // `default: break;` at the end is the switch's own exit
                while cases.last().is_some_and(|case| case.body.is_empty()) {
                    cases.pop();
                }
                let count = cases.len();
                for (index, case) in cases.iter_mut().enumerate() {
                    case.fall_through = index + 1 < count && !ends_abruptly(&case.body);
                }
                out.push(Statement::Switch {
                    label,
                    selector,
                    cases,
                });
            }
            Region::Try(region) => {
                let body = self.lower_into(*region.body)?;
                let mut catches = vec![];
                for arm in region.catches {
                    catches.push(self.catch_clause(arm)?);
                }
                out.push(Statement::Try {
                    body,
                    catches,
                    finally: None,
                });
            }
            Region::Terminal(block) => match self.exit_of(block)? {
                ExitExpression::Return(value) => out.push(Statement::Return(value.clone())),
                ExitExpression::Throw(value) => out.push(Statement::Throw(value.clone())),
                _ => {
                    return Err(ReconstructionError::structure(
                        block,
                        None,
                        "block does not end in a return or throw",
                    ))
                }
            },
            Region::Jump { from, target } => {
                return Err(ReconstructionError::structure(
                    from,
                    None,
                    format!("unresolved jump to block {}", target),
                ))
            }
            Region::Break { scope, labeled } => out.push(Statement::Break {
                label: self.label(scope, labeled),
            }),
            Region::Continue { scope, labeled } => out.push(Statement::Continue {
                label: self.label(scope, labeled),
            }),
        }
        Ok(())
    }

    /// The handler's leading `v = caught` becomes the clause variable.
    fn catch_clause(&mut self, arm: CatchArm) -> Result<CatchClause> {
        let mut body = self.lower_into(arm.body)?;
        let bound = match body.first() {
            Some(Statement::Expression(ExpressionNode {
                kind: ExpressionKind::Assignment { target, value },
                ..
            })) if matches!(value.kind, ExpressionKind::CaughtException) => target.as_variable(),
            _ => None,
        };
        let variable = match bound {
            Some(variable) => {
                body.remove(0);
                variable
            }
            None => {
                let ty = arm
                    .catch_type
                    .as_ref()
                    .map(|name| SemanticType::Object(name.clone()))
                    .unwrap_or_else(SemanticType::throwable);
                let variable = self.registry.fresh_temp(ty.clone());
                for statement in body.iter_mut() {
                    statement.rewrite_expressions(&mut |expr| {
                        if matches!(expr.kind, ExpressionKind::CaughtException) {
                            *expr = ExpressionNode::variable(variable, ty.clone());
                        }
                    });
                }
                variable
            }
        };
        Ok(CatchClause {
            catch_type: arm.catch_type,
            variable,
            body,
        })
    }
}

