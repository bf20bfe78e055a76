// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! One method from bytecode blocks to a statement tree.

use crate::assembly::{Statement, StatementTreeAssembler};
use crate::bytecode::{BlockId, MethodBody};
use crate::control_flow_reconstruction::{
    classify, resolve_jumps, ClassifierContext, DominatorTree, FlowExit, FlowGraph,
};
use crate::error::{Diagnostic, Result};
use crate::expression::{BuiltMethod, ExitExpression, ExpressionStackBuilder, VariableInfo};
use crate::graph::BasicBlockGraph;
use crate::options::ReconstructionOptions;
use crate::types::TypeLookup;
use log::{debug, warn};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconstructedMethod {
    pub name: String,
    pub descriptor: String,
    pub body: Vec<Statement>,
    pub variables: Vec<VariableInfo>,
    /// Recoverable findings; the body is still complete and faithful.
    pub diagnostics: Vec<Diagnostic>,
}

/// Reconstructs `method`. Either the whole body is produced or an error is returned;
/// there is no partial result.
pub fn reconstruct_method(
    method: &MethodBody,
    types: &dyn TypeLookup,
    options: &ReconstructionOptions,
) -> Result<ReconstructedMethod> {
    debug!("[reconstruct_method] {}{}", method.name, method.descriptor);
    let graph = BasicBlockGraph::new(method)?;
    let order = DominatorTree::compute(&graph).reverse_post_order().to_vec();
    let built = ExpressionStackBuilder::new(method, &graph, types)?.build(&order)?;

    let flow = FlowGraph::new(&graph, &built.blocks_with_statements(), options.fold_short_circuit);
    let classification = classify(&ClassifierContext {
        flow: &flow,
        graph: &graph,
        built: &built,
        types,
        options,
    })?;

    let inline_terminal = |block: BlockId| returns_immediately(&flow, &built, block);
    let resolved = resolve_jumps(classification.region, &inline_terminal, &options.label_prefix)?;

    let mut diagnostics = classification.diagnostics;
    diagnostics.extend(resolved.diagnostics);
    for diagnostic in &diagnostics {
        warn!("[reconstruct_method] {}: {}", method.name, diagnostic);
    }

    let assembled = StatementTreeAssembler::new(built, &resolved.labels, options).assemble(resolved.region)?;
    Ok(ReconstructedMethod {
        name: method.name.clone(),
        descriptor: method.descriptor.clone(),
        body: assembled.body,
        variables: assembled.registry.entries(),
        diagnostics,
    })
}

/// A block that only returns a value computed without side effects can be copied to
/// the jumps reaching it.
fn returns_immediately(flow: &FlowGraph, built: &BuiltMethod, block: BlockId) -> bool {
    let terminal = flow
        .node(block)
        .is_some_and(|node| node.exit == FlowExit::Terminal);
    let Some(summary) = built.blocks.get(&block) else {
        return false;
    };
    terminal
        && summary.statements.is_empty()
        && match &summary.exit {
            ExitExpression::Return(None) => true,
            ExitExpression::Return(Some(value)) => !value.has_side_effects(),
            _ => false,
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BasicBlock, BranchCondition, CompareOp, Constant, LocalVariable, StackOp, Terminator};
    use crate::error::ReconstructionError;
    use crate::types::DescriptorTypeLookup;

    fn method(descriptor: &str, blocks: Vec<BasicBlock>) -> MethodBody {
        MethodBody {
            name: "f".to_string(),
            descriptor: descriptor.to_string(),
            is_static: true,
            locals: vec![LocalVariable {
                name: Some("a".to_string()),
                descriptor: "I".to_string(),
            }],
            blocks,
            exception_table: vec![],
        }
    }

    fn branch(taken: BlockId, not_taken: BlockId) -> BasicBlock {
        BasicBlock {
            ops: vec![StackOp::Load(0)],
            terminator: Terminator::Branch {
                condition: BranchCondition::Zero(CompareOp::Eq),
                taken,
                not_taken,
            },
        }
    }

    fn run(method: &MethodBody) -> Result<ReconstructedMethod> {
        reconstruct_method(method, &DescriptorTypeLookup::new(), &ReconstructionOptions::default())
    }

    #[test]
    fn test_straight_line_method() {
        let m = method(
            "(I)I",
            vec![BasicBlock {
                ops: vec![StackOp::Load(0)],
                terminator: Terminator::Return,
            }],
        );
        let reconstructed = run(&m).unwrap();
        assert_eq!(reconstructed.name, "f");
        assert!(reconstructed.diagnostics.is_empty());
        assert_eq!(reconstructed.variables.len(), 1);
        assert!(matches!(&reconstructed.body[..], [Statement::Return(Some(_))]));
    }

    #[test]
    fn test_json_method_in_and_out() {
        let m: MethodBody = serde_json::from_str(
            r#"{
                "name": "f",
                "descriptor": "(I)I",
                "is_static": true,
                "locals": [{ "name": "a", "descriptor": "I" }],
                "blocks": [{ "ops": [{ "load": 0 }], "terminator": "return" }]
            }"#,
        )
        .unwrap();
        let json = serde_json::to_value(run(&m).unwrap()).unwrap();
        assert_eq!(json["name"], "f");
        assert_eq!(json["descriptor"], "(I)I");
        assert_eq!(json["body"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["diagnostics"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn test_malformed_descriptor_is_unsupported() {
        let m = method(
            "(Q)V",
            vec![BasicBlock {
                ops: vec![],
                terminator: Terminator::Return,
            }],
        );
        assert!(matches!(run(&m), Err(ReconstructionError::Unsupported(_))));
    }

    #[test]
    fn test_stack_depth_mismatch_fails_whole_method() {
        // one arm leaves a value on the stack, the other does not
        let m = method(
            "(I)V",
            vec![
                branch(2, 1),
                BasicBlock {
                    ops: vec![StackOp::Push(Constant::Int(1))],
                    terminator: Terminator::Jump(3),
                },
                BasicBlock {
                    ops: vec![],
                    terminator: Terminator::FallThrough(3),
                },
                BasicBlock {
                    ops: vec![],
                    terminator: Terminator::Return,
                },
            ],
        );
        let Err(ReconstructionError::Structure(error)) = run(&m) else {
            panic!("expected a structure error");
        };
        assert_eq!(error.block, 3);
    }

    #[test]
    fn test_irreducible_cycle_never_panics() {
        // 0 enters the cycle 1 <-> 2 at both nodes
        let m = method(
            "(I)V",
            vec![
                branch(2, 1),
                BasicBlock {
                    ops: vec![StackOp::Load(0), StackOp::Pop],
                    terminator: Terminator::FallThrough(2),
                },
                branch(1, 3),
                BasicBlock {
                    ops: vec![],
                    terminator: Terminator::Return,
                },
            ],
        );
        match run(&m) {
            Ok(reconstructed) => assert!(reconstructed
                .diagnostics
                .iter()
                .any(|diagnostic| matches!(diagnostic, Diagnostic::UnstructuredGraph { .. }))),
            Err(err) => assert!(!err.to_string().is_empty()),
        }
    }
}
