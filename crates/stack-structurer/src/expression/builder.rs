// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Rebuilds expression trees from stack operations.
//!
//! Each block is simulated on its own, in reverse post-order, starting from one
//! placeholder per incoming stack slot. Operands are moved into the expressions that
//! consume them; a value is copied into a temporary only when it is duplicated and
//! used more than once, or when a statement must run before it is consumed.
//!
//! Once every block is simulated the placeholders are resolved: a value crossing a
//! straight-line edge is moved into its single consumer, all other crossing values are
//! carried by stack variables shared by every edge into the same merge point.

use super::node::{ExpressionKind, ExpressionNode, Literal, NanSemantics, VariableId};
use super::simplify::{coerce_to, compare_with_zero, comparison};
use super::variables::VariableRegistry;
use crate::assembly::statement::Statement;
use crate::bytecode::{
    ArithmeticOp, BlockId, BranchCondition, CompareOp, Constant, InvokeKind, LocalId, MethodBody,
    StackOp, Terminator,
};
use crate::error::{ReconstructionError, Result};
use crate::graph::{BasicBlockGraph, ControlFlow};
use crate::types::{SemanticType, TypeLookup};
use log::debug;
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, BTreeSet};

/// Expression computed by a block's terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitExpression {
    None,
    /// Condition under which the `taken` edge is followed.
    Branch(ExpressionNode),
    Switch(ExpressionNode),
    Return(Option<ExpressionNode>),
    Throw(ExpressionNode),
}

impl ExitExpression {
    pub fn expression(&self) -> Option<&ExpressionNode> {
        match self {
            ExitExpression::Branch(expr)
            | ExitExpression::Switch(expr)
            | ExitExpression::Throw(expr)
            | ExitExpression::Return(Some(expr)) => Some(expr),
            ExitExpression::None | ExitExpression::Return(None) => None,
        }
    }

    pub fn expression_mut(&mut self) -> Option<&mut ExpressionNode> {
        match self {
            ExitExpression::Branch(expr)
            | ExitExpression::Switch(expr)
            | ExitExpression::Throw(expr)
            | ExitExpression::Return(Some(expr)) => Some(expr),
            ExitExpression::None | ExitExpression::Return(None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary {
    pub statements: Vec<Statement>,
    pub exit: ExitExpression,
}

#[derive(Debug)]
pub struct BuiltMethod {
    pub blocks: BTreeMap<BlockId, BlockSummary>,
    pub registry: VariableRegistry,
    pub return_type: SemanticType,
}

impl BuiltMethod {
    /// Blocks that do more than compute their exit.
    pub fn blocks_with_statements(&self) -> BTreeSet<BlockId> {
        self.blocks
            .iter()
            .filter(|(_, summary)| !summary.statements.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Output of simulating one block, before cross-block values are resolved.
#[derive(Debug)]
struct SimulatedBlock {
    statements: Vec<Statement>,
    exit: ExitExpression,
    outgoing: Vec<ExpressionNode>,
    incoming: Vec<SemanticType>,
}

impl SimulatedBlock {
    fn rewrite(&mut self, f: &mut impl FnMut(&mut ExpressionNode)) {
        for statement in self.statements.iter_mut() {
            statement.rewrite_expressions(f);
        }
        if let Some(expr) = self.exit.expression_mut() {
            expr.rewrite(f);
        }
        for value in self.outgoing.iter_mut() {
            value.rewrite(f);
        }
    }

    fn walk(&self, visit: &mut impl FnMut(&ExpressionNode)) {
        for statement in &self.statements {
            statement.walk_expressions(&mut |expr| visit(expr));
        }
        if let Some(expr) = self.exit.expression() {
            expr.walk(&mut |node| visit(node));
        }
        for value in &self.outgoing {
            value.walk(&mut |node| visit(node));
        }
    }
}

pub struct ExpressionStackBuilder<'a> {
    graph: &'a BasicBlockGraph,
    types: &'a dyn TypeLookup,
    registry: VariableRegistry,
    return_type: SemanticType,
}

impl<'a> ExpressionStackBuilder<'a> {
    pub fn new(
        method: &MethodBody,
        graph: &'a BasicBlockGraph,
        types: &'a dyn TypeLookup,
    ) -> Result<Self> {
        let (_, return_type) = types.resolve_method(&method.descriptor)?;
        Ok(Self {
            graph,
            types,
            registry: VariableRegistry::for_method(method, types)?,
            return_type,
        })
    }

    /// Simulates the blocks in `order` (reverse post-order of the reachable blocks)
    /// and resolves the values they pass to each other.
    pub fn build(mut self, order: &[BlockId]) -> Result<BuiltMethod> {
        let mut simulated: BTreeMap<BlockId, SimulatedBlock> = BTreeMap::new();
        for &block in order {
            let incoming = self.incoming_stack(block, &simulated)?;
            let incoming_types = incoming
                .iter()
                .filter(|expr| matches!(expr.kind, ExpressionKind::Placeholder { .. }))
                .map(|expr| expr.ty.clone())
                .collect();
            let mut simulation = Simulation {
                registry: &mut self.registry,
                types: self.types,
                return_type: &self.return_type,
                block,
                stack: incoming.into_iter().map(Entry::Value).collect(),
                statements: vec![],
                pending: BTreeMap::new(),
                materialized: BTreeMap::new(),
                next_shared: 0,
            };
            let (statements, exit, outgoing) =
                simulation.run(&self.graph.block(block).ops, &self.graph.block(block).terminator)?;
            simulated.insert(
                block,
                SimulatedBlock {
                    statements,
                    exit,
                    outgoing,
                    incoming: incoming_types,
                },
            );
        }
        let blocks = self.resolve_crossing_values(order, simulated)?;
        debug!("[ExpressionStackBuilder::build] built {} blocks", blocks.len());
        Ok(BuiltMethod {
            blocks,
            registry: self.registry,
            return_type: self.return_type,
        })
    }

    fn incoming_stack(
        &self,
        block: BlockId,
        simulated: &BTreeMap<BlockId, SimulatedBlock>,
    ) -> Result<Vec<ExpressionNode>> {
        if self.graph.is_handler(block) {
            if !self.graph.predecessors(block).is_empty() {
                return Err(ReconstructionError::unsupported(
                    block,
                    "exception handler also entered by normal control flow",
                ));
            }
            let ty = match self.graph.handler_catch_type(block) {
                Some(Some(class)) => SemanticType::Object(class),
                _ => SemanticType::throwable(),
            };
            return Ok(vec![ExpressionNode::new(ExpressionKind::CaughtException, ty)]);
        }
        if block == self.graph.entry() {
            return Ok(vec![]);
        }
        let pred = self
            .graph
            .predecessors(block)
            .into_iter()
            .find_map(|pred| simulated.get(&pred))
            .ok_or_else(|| {
                ReconstructionError::structure(block, None, "no simulated predecessor")
            })?;
        Ok(pred
            .outgoing
            .iter()
            .enumerate()
            .map(|(slot, value)| {
                ExpressionNode::new(ExpressionKind::Placeholder { block, slot }, value.ty.clone())
            })
            .collect())
    }

    fn normal_successors(&self, block: BlockId) -> Vec<BlockId> {
        self.graph.successors(block)
    }

    fn resolve_crossing_values(
        &mut self,
        order: &[BlockId],
        mut simulated: BTreeMap<BlockId, SimulatedBlock>,
    ) -> Result<BTreeMap<BlockId, BlockSummary>> {
        // Straight-line edges: the value moves into its only consumer.
        let mut moved: BTreeMap<BlockId, BlockId> = BTreeMap::new();
        for &block in order {
            if block == self.graph.entry() || self.graph.is_handler(block) {
                continue;
            }
            if let [pred] = self.graph.predecessors(block).as_slice() {
                if *pred != block && self.normal_successors(*pred) == [block] {
                    moved.insert(block, *pred);
                }
            }
        }

        for &pred in order {
            let depth = simulated.get(&pred).map_or(0, |sim| sim.outgoing.len());
            for succ in self.normal_successors(pred) {
                let incoming = simulated.get(&succ).map_or(0, |sim| sim.incoming.len());
                if incoming != depth {
                    return Err(ReconstructionError::structure(
                        succ,
                        None,
                        format!(
                            "stack depth {} on entry differs from depth {} left by block {}",
                            incoming, depth, pred
                        ),
                    ));
                }
            }
        }

        // Merge points: one web of slots per stack variable.
        let mut keys: BTreeMap<(BlockId, usize), usize> = BTreeMap::new();
        for &block in order {
            if moved.contains_key(&block) {
                continue;
            }
            if let Some(sim) = simulated.get(&block) {
                for slot in 0..sim.incoming.len() {
                    let next = keys.len();
                    keys.insert((block, slot), next);
                }
            }
        }
        let mut webs = UnionFind::<usize>::new(keys.len());
        for &pred in order {
            let Some(sim) = simulated.get(&pred) else {
                continue;
            };
            let succs = self.merge_successors(pred, &moved);
            let Some(&first) = succs.first() else {
                continue;
            };
            for slot in 0..sim.outgoing.len() {
                let Some(&anchor) = keys.get(&(first, slot)) else {
                    continue;
                };
                for succ in &succs[1..] {
                    if let Some(&other) = keys.get(&(*succ, slot)) {
                        webs.union(anchor, other);
                    }
                }
                if let ExpressionKind::Placeholder { block, slot: from } = sim.outgoing[slot].kind {
                    if block == pred && from == slot {
                        if let Some(&own) = keys.get(&(pred, slot)) {
                            webs.union(anchor, own);
                        }
                    }
                }
            }
        }

        // Placeholders retyped by their consumers decide the variable's type.
        let mut observed: BTreeMap<(BlockId, usize), SemanticType> = BTreeMap::new();
        for (block, sim) in &simulated {
            for (slot, ty) in sim.incoming.iter().enumerate() {
                observed.insert((*block, slot), ty.clone());
            }
            sim.walk(&mut |node| {
                if let ExpressionKind::Placeholder { block, slot } = node.kind {
                    if matches!(node.ty, SemanticType::Boolean | SemanticType::Char) {
                        observed.insert((block, slot), node.ty.clone());
                    }
                }
            });
        }
        let mut web_types: BTreeMap<usize, SemanticType> = BTreeMap::new();
        for (key, index) in &keys {
            let root = webs.find(*index);
            let ty = observed.get(key).cloned().unwrap_or(SemanticType::Int);
            let refined = matches!(ty, SemanticType::Boolean | SemanticType::Char);
            match web_types.get(&root) {
                Some(_) if !refined => {}
                _ => {
                    web_types.insert(root, ty);
                }
            }
        }
        let mut web_vars: BTreeMap<usize, ExpressionNode> = BTreeMap::new();
        for (root, ty) in web_types {
            let id = self.registry.fresh_stack(ty.clone());
            web_vars.insert(root, ExpressionNode::variable(id, ty));
        }
        let web_of = |block: BlockId, slot: usize| -> Option<ExpressionNode> {
            let index = keys.get(&(block, slot))?;
            web_vars.get(&webs.find(*index)).cloned()
        };

        let mut summaries: BTreeMap<BlockId, (BlockSummary, Vec<ExpressionNode>)> = BTreeMap::new();
        for &block in order {
            let Some(mut sim) = simulated.remove(&block) else {
                continue;
            };
            let moved_values = moved
                .get(&block)
                .and_then(|pred| summaries.get(pred))
                .map(|(_, outgoing)| outgoing.clone());
            let mut missing = None;
            sim.rewrite(&mut |node| {
                let ExpressionKind::Placeholder { block: owner, slot } = node.kind else {
                    return;
                };
                if owner != block {
                    return;
                }
                let replacement = match &moved_values {
                    Some(values) => values.get(slot).cloned(),
                    None => web_of(owner, slot),
                };
                match replacement {
                    Some(value) => *node = coerce_to(value, &node.ty),
                    None => missing = Some(slot),
                }
            });
            if let Some(slot) = missing {
                return Err(ReconstructionError::structure(
                    block,
                    None,
                    format!("incoming stack slot {} has no producer", slot),
                ));
            }

            let succs = self.merge_successors(block, &moved);
            if let Some(&first) = succs.first() {
                for (slot, value) in sim.outgoing.iter().enumerate() {
                    let Some(var) = web_of(first, slot) else {
                        continue;
                    };
                    if value.as_variable().is_some() && value.as_variable() == var.as_variable() {
                        continue;
                    }
                    sim.statements
                        .push(Statement::assign(var.clone(), coerce_to(value.clone(), &var.ty)));
                }
            }
            summaries.insert(
                block,
                (
                    BlockSummary {
                        statements: sim.statements,
                        exit: sim.exit,
                    },
                    sim.outgoing,
                ),
            );
        }
        Ok(summaries
            .into_iter()
            .map(|(block, (summary, _))| (block, summary))
            .collect())
    }

    /// Normal successors whose incoming slots are carried by stack variables.
    fn merge_successors(&self, block: BlockId, moved: &BTreeMap<BlockId, BlockId>) -> Vec<BlockId> {
        self.normal_successors(block)
            .into_iter()
            .filter(|succ| !moved.contains_key(succ) && !self.graph.is_handler(*succ))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Value(ExpressionNode),
    /// One copy of a duplicated value, held in `pending` until its use is known.
    Shared { id: usize, ty: SemanticType },
}

impl Entry {
    fn ty(&self) -> &SemanticType {
        match self {
            Entry::Value(expr) => &expr.ty,
            Entry::Shared { ty, .. } => ty,
        }
    }
}

struct Simulation<'s> {
    registry: &'s mut VariableRegistry,
    types: &'s dyn TypeLookup,
    return_type: &'s SemanticType,
    block: BlockId,
    stack: Vec<Entry>,
    statements: Vec<Statement>,
    pending: BTreeMap<usize, ExpressionNode>,
    materialized: BTreeMap<usize, ExpressionNode>,
    next_shared: usize,
}

impl Simulation<'_> {
    fn run(
        &mut self,
        ops: &[StackOp],
        terminator: &Terminator,
    ) -> Result<(Vec<Statement>, ExitExpression, Vec<ExpressionNode>)> {
        let mut index = 0;
        while index < ops.len() {
            let skip_next = self.step(index, &ops[index], ops.get(index + 1))?;
            index += if skip_next { 2 } else { 1 };
        }
        let exit = self.exit(ops.len(), terminator)?;

        // Copies still shared at the end of the block leave as one temporary.
        let shared_left = self
            .stack
            .iter()
            .filter_map(|entry| match entry {
                Entry::Shared { id, .. } => Some(*id),
                Entry::Value(_) => None,
            })
            .any(|id| self.copies(id) > 1);
        if shared_left {
            let ids: Vec<usize> = self.pending.keys().copied().collect();
            self.flush(&BTreeSet::new());
            for id in ids {
                if self.copies(id) > 1 {
                    self.spill_shared(id);
                }
            }
        }
        let entries = std::mem::take(&mut self.stack);
        let mut outgoing = Vec::with_capacity(entries.len());
        for entry in entries {
            outgoing.push(self.resolve(entry, ops.len())?);
        }
        Ok((std::mem::take(&mut self.statements), exit, outgoing))
    }

    fn underflow(&self, operand: usize) -> ReconstructionError {
        ReconstructionError::structure(self.block, Some(operand), "operand stack underflow")
    }

    fn pop(&mut self, operand: usize) -> Result<Entry> {
        self.stack.pop().ok_or_else(|| self.underflow(operand))
    }

    fn pop_value(&mut self, operand: usize) -> Result<ExpressionNode> {
        let entry = self.pop(operand)?;
        self.resolve(entry, operand)
    }

    fn push(&mut self, expr: ExpressionNode) {
        self.stack.push(Entry::Value(expr));
    }

    fn copies(&self, id: usize) -> usize {
        self.stack
            .iter()
            .filter(|entry| matches!(entry, Entry::Shared { id: other, .. } if *other == id))
            .count()
    }

    fn is_wide_at(&self, from_top: usize) -> bool {
        self.stack
            .len()
            .checked_sub(from_top + 1)
            .and_then(|index| self.stack.get(index))
            .is_some_and(|entry| entry.ty().is_wide())
    }

    /// Turns a popped entry into the expression it stands for.
    fn resolve(&mut self, entry: Entry, operand: usize) -> Result<ExpressionNode> {
        let id = match entry {
            Entry::Value(expr) => return Ok(expr),
            Entry::Shared { id, .. } => id,
        };
        if let Some(var) = self.materialized.get(&id) {
            return Ok(var.clone());
        }
        if self.copies(id) == 0 {
            // Last copy standing: the value is used once after all.
            return self.pending.remove(&id).ok_or_else(|| {
                ReconstructionError::structure(self.block, Some(operand), "duplicated value lost")
            });
        }
        self.flush(&BTreeSet::new());
        self.spill_shared(id);
        self.materialized.get(&id).cloned().ok_or_else(|| {
            ReconstructionError::structure(self.block, Some(operand), "duplicated value lost")
        })
    }

    fn local(&self, local: LocalId, operand: usize) -> Result<ExpressionNode> {
        let id = VariableId::Local(local);
        let ty = self.registry.get_type(id).cloned().ok_or_else(|| {
            ReconstructionError::structure(
                self.block,
                Some(operand),
                format!("local {} is not in the local variable table", local),
            )
        })?;
        Ok(ExpressionNode::variable(id, ty))
    }

    fn spill(&mut self, expr: ExpressionNode) -> ExpressionNode {
        let ty = expr.ty.clone();
        let id = self.registry.fresh_temp(ty.clone());
        let var = ExpressionNode::variable(id, ty);
        self.statements.push(Statement::assign(var.clone(), expr));
        var
    }

    fn spill_shared(&mut self, id: usize) {
        let Some(value) = self.pending.remove(&id) else {
            return;
        };
        let var = self.spill(value);
        for entry in self.stack.iter_mut() {
            if matches!(entry, Entry::Shared { id: other, .. } if *other == id) {
                *entry = Entry::Value(var.clone());
            }
        }
        self.materialized.insert(id, var);
    }

    /// Materialises, bottom-up, every stack value whose evaluation must not move
    /// past a statement writing `written`.
    fn flush(&mut self, written: &BTreeSet<VariableId>) {
        let needs_flush = |expr: &ExpressionNode| {
            expr.has_side_effects()
                || expr.reads_memory()
                || written.iter().any(|var| expr.reads_variable(*var))
        };
        for index in 0..self.stack.len() {
            let shared = match &self.stack[index] {
                Entry::Value(expr) if needs_flush(expr) => None,
                Entry::Value(_) => continue,
                Entry::Shared { id, .. } => match self.pending.get(id) {
                    Some(value) if needs_flush(value) => Some(*id),
                    _ => continue,
                },
            };
            match shared {
                Some(id) => self.spill_shared(id),
                None => {
                    let placeholder = Entry::Value(ExpressionNode::int(0));
                    if let Entry::Value(expr) = std::mem::replace(&mut self.stack[index], placeholder) {
                        let var = self.spill(expr);
                        self.stack[index] = Entry::Value(var);
                    }
                }
            }
        }
    }

    fn emit(&mut self, statement: Statement) {
        let mut written = BTreeSet::new();
        for expr in statement.head_expressions() {
            expr.walk(&mut |node| match &node.kind {
                ExpressionKind::Assignment { target, .. } | ExpressionKind::Increment { target, .. } => {
                    if let Some(var) = target.as_variable() {
                        written.insert(var);
                    }
                }
                _ => {}
            });
        }
        self.flush(&written);
        self.statements.push(statement);
    }

    /// Assigns `value` to `target`, folding `x = y = e` when the value was duplicated
    /// for exactly this purpose.
    fn store(&mut self, operand: usize, target: ExpressionNode, value: Entry) -> Result<()> {
        if let Entry::Shared { id, .. } = value {
            if self.copies(id) == 1 && !self.materialized.contains_key(&id) {
                if let Some(pending) = self.pending.remove(&id) {
                    let ty = target.ty.clone();
                    let assignment = ExpressionNode::assign(target, coerce_to(pending, &ty));
                    if let Some(slot) = self
                        .stack
                        .iter_mut()
                        .find(|entry| matches!(entry, Entry::Shared { id: other, .. } if *other == id))
                    {
                        *slot = Entry::Value(assignment);
                    }
                    return Ok(());
                }
            }
        }
        let value = self.resolve(value, operand)?;
        let ty = target.ty.clone();
        self.emit(Statement::assign(target, coerce_to(value, &ty)));
        Ok(())
    }

    fn discard(&mut self, entry: Entry, operand: usize) -> Result<()> {
        if let Entry::Shared { id, .. } = &entry {
            if self.copies(*id) > 0 || self.materialized.contains_key(id) {
                return Ok(());
            }
        }
        let value = self.resolve(entry, operand)?;
        if value.has_side_effects() && !matches!(value.kind, ExpressionKind::Placeholder { .. }) {
            self.emit(Statement::Expression(value));
        }
        Ok(())
    }

    /// Copies the top `count` entries and inserts the copies `depth` entries down.
    fn duplicate(&mut self, operand: usize, count: usize, depth: usize) -> Result<()> {
        let len = self.stack.len();
        if len < depth || depth < count {
            return Err(self.underflow(operand));
        }
        let mut copies = Vec::with_capacity(count);
        for index in len - count..len {
            let entry = std::mem::replace(&mut self.stack[index], Entry::Value(ExpressionNode::int(0)));
            let (kept, copy) = match entry {
                Entry::Value(expr) if expr.is_trivial() => (Entry::Value(expr.clone()), Entry::Value(expr)),
                Entry::Value(expr) => {
                    let id = self.next_shared;
                    self.next_shared += 1;
                    let ty = expr.ty.clone();
                    self.pending.insert(id, expr);
                    (Entry::Shared { id, ty: ty.clone() }, Entry::Shared { id, ty })
                }
                Entry::Shared { id, ty } => (Entry::Shared { id, ty: ty.clone() }, Entry::Shared { id, ty }),
            };
            self.stack[index] = kept;
            copies.push(copy);
        }
        let at = len - depth;
        self.stack.splice(at..at, copies);
        Ok(())
    }

    /// Executes one operation; returns whether the following operation was consumed.
    fn step(&mut self, index: usize, op: &StackOp, next: Option<&StackOp>) -> Result<bool> {
        match op {
            StackOp::Push(constant) => self.push(ExpressionNode::literal(match constant {
                Constant::Null => Literal::Null,
                Constant::Int(value) => Literal::Int(*value),
                Constant::Long(value) => Literal::Long(*value),
                Constant::Float(value) => Literal::Float(*value),
                Constant::Double(value) => Literal::Double(*value),
                Constant::String(value) => Literal::String(value.clone()),
                Constant::Class(value) => Literal::Class(value.clone()),
            })),
            StackOp::Load(local) => {
                let var = self.local(*local, index)?;
                self.push(var);
            }
            StackOp::Store(local) => {
                let target = self.local(*local, index)?;
                let value = self.pop(index)?;
                self.store(index, target, value)?;
            }
            StackOp::Increment { local, delta } => {
                let var = self.local(*local, index)?;
                let increment = |prefix| {
                    ExpressionNode::new(
                        ExpressionKind::Increment {
                            target: Box::new(var.clone()),
                            delta: *delta,
                            prefix,
                        },
                        var.ty.clone(),
                    )
                };
                let top_is_load = matches!(
                    self.stack.last(),
                    Some(Entry::Value(expr)) if expr.as_variable() == var.as_variable()
                );
                if top_is_load {
                    // iload x; iinc x → x++
                    self.stack.pop();
                    self.push(increment(false));
                } else if next == Some(&StackOp::Load(*local)) {
                    // iinc x; iload x → ++x
                    self.push(increment(true));
                    return Ok(true);
                } else {
                    self.emit(Statement::Expression(increment(false)));
                }
            }
            StackOp::Arithmetic { op, kind } => {
                let right = self.pop_value(index)?;
                let left = self.pop_value(index)?;
                let logical = matches!(op, ArithmeticOp::And | ArithmeticOp::Or | ArithmeticOp::Xor);
                let ty = if logical && left.ty == SemanticType::Boolean && right.ty == SemanticType::Boolean {
                    SemanticType::Boolean
                } else {
                    SemanticType::from_numeric(*kind)
                };
                self.push(ExpressionNode::new(
                    ExpressionKind::Binary {
                        op: *op,
                        kind: *kind,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty,
                ));
            }
            StackOp::Negate(kind) => {
                let operand = self.pop_value(index)?;
                self.push(ExpressionNode::new(
                    ExpressionKind::Unary {
                        op: super::node::UnaryOp::Negate,
                        operand: Box::new(operand),
                    },
                    SemanticType::from_numeric(*kind),
                ));
            }
            StackOp::Compare { kind, nan_bias } => {
                let right = self.pop_value(index)?;
                let left = self.pop_value(index)?;
                self.push(ExpressionNode::new(
                    ExpressionKind::ThreeWayCompare {
                        kind: *kind,
                        nan_bias: *nan_bias,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    SemanticType::Int,
                ));
            }
            StackOp::Convert { to, .. } => {
                let operand = self.pop_value(index)?;
                let target = SemanticType::from_primitive(*to);
                self.push(ExpressionNode::new(
                    ExpressionKind::Cast {
                        target: target.clone(),
                        operand: Box::new(operand),
                    },
                    target,
                ));
            }
            StackOp::GetField(field) => {
                let ty = self.types.resolve(&field.descriptor)?;
                let target = if field.is_static {
                    None
                } else {
                    Some(Box::new(self.pop_value(index)?))
                };
                self.push(ExpressionNode::new(
                    ExpressionKind::Field {
                        target,
                        field: field.clone(),
                    },
                    ty,
                ));
            }
            StackOp::PutField(field) => {
                let ty = self.types.resolve(&field.descriptor)?;
                let value = self.pop(index)?;
                let target = if field.is_static {
                    None
                } else {
                    Some(Box::new(self.pop_value(index)?))
                };
                let place = ExpressionNode::new(
                    ExpressionKind::Field {
                        target,
                        field: field.clone(),
                    },
                    ty,
                );
                self.store(index, place, value)?;
            }
            StackOp::Invoke { kind, method } => self.invoke(index, *kind, method)?,
            StackOp::New(class) => self.push(ExpressionNode::new(
                ExpressionKind::Uninitialized {
                    class: class.clone(),
                    block: self.block,
                    operand: index,
                },
                SemanticType::Object(class.clone()),
            )),
            StackOp::NewArray { element, dimensions } => {
                let element = self.types.resolve(element)?;
                let count = usize::from(*dimensions).max(1);
                let mut sizes = Vec::with_capacity(count);
                for _ in 0..count {
                    sizes.push(self.pop_value(index)?);
                }
                sizes.reverse();
                let mut ty = element.clone();
                for _ in 0..count {
                    ty = SemanticType::Array(Box::new(ty));
                }
                self.push(ExpressionNode::new(
                    ExpressionKind::NewArray {
                        element,
                        dimensions: sizes,
                    },
                    ty,
                ));
            }
            StackOp::ArrayLoad(element) => {
                let ty = self.types.resolve(element)?;
                let array_index = self.pop_value(index)?;
                let array = self.pop_value(index)?;
                self.push(ExpressionNode::new(
                    ExpressionKind::ArrayAccess {
                        array: Box::new(array),
                        index: Box::new(array_index),
                    },
                    ty,
                ));
            }
            StackOp::ArrayStore(element) => {
                let ty = self.types.resolve(element)?;
                let value = self.pop(index)?;
                let array_index = self.pop_value(index)?;
                let array = self.pop_value(index)?;
                let place = ExpressionNode::new(
                    ExpressionKind::ArrayAccess {
                        array: Box::new(array),
                        index: Box::new(array_index),
                    },
                    ty,
                );
                self.store(index, place, value)?;
            }
            StackOp::ArrayLength => {
                let array = self.pop_value(index)?;
                self.push(ExpressionNode::new(
                    ExpressionKind::ArrayLength(Box::new(array)),
                    SemanticType::Int,
                ));
            }
            StackOp::InstanceOf(class) => {
                let operand = self.pop_value(index)?;
                self.push(ExpressionNode::new(
                    ExpressionKind::InstanceOf {
                        operand: Box::new(operand),
                        class: class.clone(),
                    },
                    SemanticType::Boolean,
                ));
            }
            StackOp::CheckCast(class) => {
                let operand = self.pop_value(index)?;
                let target = if class.starts_with('[') {
                    self.types.resolve(class)?
                } else {
                    SemanticType::Object(class.clone())
                };
                self.push(ExpressionNode::new(
                    ExpressionKind::Cast {
                        target: target.clone(),
                        operand: Box::new(operand),
                    },
                    target,
                ));
            }
            StackOp::Dup => self.duplicate(index, 1, 1)?,
            StackOp::DupX1 => self.duplicate(index, 1, 2)?,
            StackOp::DupX2 => {
                let depth = if self.is_wide_at(1) { 2 } else { 3 };
                self.duplicate(index, 1, depth)?
            }
            StackOp::Dup2 => {
                if self.is_wide_at(0) {
                    self.duplicate(index, 1, 1)?
                } else {
                    self.duplicate(index, 2, 2)?
                }
            }
            StackOp::Dup2X1 => {
                if self.is_wide_at(0) {
                    self.duplicate(index, 1, 2)?
                } else {
                    self.duplicate(index, 2, 3)?
                }
            }
            StackOp::Dup2X2 => match (self.is_wide_at(0), self.is_wide_at(1), self.is_wide_at(2)) {
                (true, true, _) => self.duplicate(index, 1, 2)?,
                (true, false, _) => self.duplicate(index, 1, 3)?,
                (false, _, true) => self.duplicate(index, 2, 3)?,
                (false, _, false) => self.duplicate(index, 2, 4)?,
            },
            StackOp::Pop => {
                let entry = self.pop(index)?;
                self.discard(entry, index)?;
            }
            StackOp::Pop2 => {
                let wide = self.is_wide_at(0);
                let entry = self.pop(index)?;
                self.discard(entry, index)?;
                if !wide {
                    let entry = self.pop(index)?;
                    self.discard(entry, index)?;
                }
            }
            StackOp::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.underflow(index));
                }
                self.flush(&BTreeSet::new());
                self.stack.swap(len - 1, len - 2);
            }
            StackOp::MonitorEnter => {
                let monitor = self.pop_value(index)?;
                self.emit(Statement::MonitorEnter(monitor));
            }
            StackOp::MonitorExit => {
                let monitor = self.pop_value(index)?;
                self.emit(Statement::MonitorExit(monitor));
            }
        }
        Ok(false)
    }

    fn invoke(&mut self, index: usize, kind: InvokeKind, method: &crate::bytecode::MethodRef) -> Result<()> {
        let (params, ret) = self.types.resolve_method(&method.descriptor)?;
        let mut arguments = Vec::with_capacity(params.len());
        for param in params.iter().rev() {
            let argument = self.pop_value(index)?;
            arguments.push(coerce_to(argument, param));
        }
        arguments.reverse();
        let receiver = match kind {
            InvokeKind::Static | InvokeKind::Dynamic => None,
            _ => Some(self.pop_value(index)?),
        };

        if kind == InvokeKind::Special && method.name == "<init>" {
            if let Some(
                uninitialized @ ExpressionNode {
                    kind: ExpressionKind::Uninitialized { class, .. },
                    ..
                },
            ) = &receiver
            {
                let created = ExpressionNode::new(
                    ExpressionKind::NewObject {
                        class: class.clone(),
                        constructor: method.clone(),
                        arguments,
                    },
                    SemanticType::Object(class.clone()),
                );
                // new C; dup; <args>; invokespecial C.<init> → new C(args)
                let copy = self
                    .stack
                    .iter_mut()
                    .rev()
                    .find(|entry| matches!(entry, Entry::Value(expr) if expr == uninitialized));
                match copy {
                    Some(slot) => *slot = Entry::Value(created),
                    None => self.emit(Statement::Expression(created)),
                }
                return Ok(());
            }
        }

        let call = ExpressionNode::new(
            ExpressionKind::MethodCall {
                kind,
                method: method.clone(),
                receiver: receiver.map(Box::new),
                arguments,
            },
            ret.clone(),
        );
        if ret == SemanticType::Void {
            self.emit(Statement::Expression(call));
        } else {
            self.push(call);
        }
        Ok(())
    }

    fn exit(&mut self, operand: usize, terminator: &Terminator) -> Result<ExitExpression> {
        Ok(match terminator {
            Terminator::FallThrough(_) | Terminator::Jump(_) => ExitExpression::None,
            Terminator::Branch { condition, .. } => {
                ExitExpression::Branch(self.branch_condition(operand, *condition)?)
            }
            Terminator::Switch(_) => ExitExpression::Switch(self.pop_value(operand)?),
            Terminator::Return if *self.return_type == SemanticType::Void => {
                ExitExpression::Return(None)
            }
            Terminator::Return => {
                let value = self.pop_value(operand)?;
                ExitExpression::Return(Some(coerce_to(value, self.return_type)))
            }
            Terminator::Throw => ExitExpression::Throw(self.pop_value(operand)?),
        })
    }

    fn branch_condition(&mut self, operand: usize, condition: BranchCondition) -> Result<ExpressionNode> {
        Ok(match condition {
            BranchCondition::Zero(op) => {
                let value = self.pop_value(operand)?;
                match value.kind {
                    // fcmpg a b; iflt → a < b, true when unordered only if the bias says so
                    ExpressionKind::ThreeWayCompare {
                        nan_bias,
                        left,
                        right,
                        ..
                    } => comparison(op, NanSemantics::of(op, nan_bias), *left, *right),
                    kind => compare_with_zero(op, ExpressionNode::new(kind, value.ty)),
                }
            }
            BranchCondition::Operands(op) => {
                let right = self.pop_value(operand)?;
                let left = self.pop_value(operand)?;
                comparison(op, NanSemantics::Integral, left, right)
            }
            BranchCondition::Null | BranchCondition::NonNull => {
                let value = self.pop_value(operand)?;
                let op = if condition == BranchCondition::Null {
                    CompareOp::Eq
                } else {
                    CompareOp::Ne
                };
                comparison(
                    op,
                    NanSemantics::Integral,
                    value,
                    ExpressionNode::literal(Literal::Null),
                )
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BasicBlock, FieldRef, LocalVariable, MethodRef, NanBias, NumericKind};
    use crate::control_flow_reconstruction::dominance::DominatorTree;
    use crate::types::DescriptorTypeLookup;

    fn method(descriptor: &str, locals: &[(&str, &str)], blocks: Vec<BasicBlock>) -> MethodBody {
        MethodBody {
            name: "f".to_string(),
            descriptor: descriptor.to_string(),
            is_static: true,
            locals: locals
                .iter()
                .map(|(name, descriptor)| LocalVariable {
                    name: Some(name.to_string()),
                    descriptor: descriptor.to_string(),
                })
                .collect(),
            blocks,
            exception_table: vec![],
        }
    }

    fn block(ops: Vec<StackOp>, terminator: Terminator) -> BasicBlock {
        BasicBlock { ops, terminator }
    }

    fn build(method: &MethodBody) -> Result<BuiltMethod> {
        let graph = BasicBlockGraph::new(method)?;
        let dom = DominatorTree::compute(&graph);
        let types = DescriptorTypeLookup::new();
        let order = dom.reverse_post_order().to_vec();
        ExpressionStackBuilder::new(method, &graph, &types)?.build(&order)
    }

    fn local(index: u16, ty: SemanticType) -> ExpressionNode {
        ExpressionNode::variable(VariableId::Local(index), ty)
    }

    fn call(name: &str, descriptor: &str) -> StackOp {
        StackOp::Invoke {
            kind: InvokeKind::Static,
            method: MethodRef {
                owner: "T".to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
        }
    }

    #[test]
    fn test_operands_move_into_consumer() {
        // return a + b * 2
        let m = method(
            "(II)I",
            &[("a", "I"), ("b", "I")],
            vec![block(
                vec![
                    StackOp::Load(0),
                    StackOp::Load(1),
                    StackOp::Push(Constant::Int(2)),
                    StackOp::Arithmetic {
                        op: ArithmeticOp::Mul,
                        kind: NumericKind::Int,
                    },
                    StackOp::Arithmetic {
                        op: ArithmeticOp::Add,
                        kind: NumericKind::Int,
                    },
                ],
                Terminator::Return,
            )],
        );
        let built = build(&m).unwrap();
        let summary = &built.blocks[&0];
        assert!(summary.statements.is_empty());
        let ExitExpression::Return(Some(value)) = &summary.exit else {
            panic!("expected a return value");
        };
        assert!(matches!(value.kind, ExpressionKind::Binary { op: ArithmeticOp::Add, .. }));
    }

    #[test]
    fn test_chained_assignment_through_dup() {
        // a = b = f();
        let m = method(
            "()V",
            &[("a", "I"), ("b", "I")],
            vec![block(
                vec![call("f", "()I"), StackOp::Dup, StackOp::Store(1), StackOp::Store(0)],
                Terminator::Return,
            )],
        );
        let built = build(&m).unwrap();
        let statements = &built.blocks[&0].statements;
        assert_eq!(statements.len(), 1);
        let Statement::Expression(ExpressionNode {
            kind: ExpressionKind::Assignment { target, value },
            ..
        }) = &statements[0]
        else {
            panic!("expected an assignment, got {:?}", statements);
        };
        assert_eq!(**target, local(0, SemanticType::Int));
        assert!(matches!(value.kind, ExpressionKind::Assignment { .. }));
    }

    #[test]
    fn test_duplicated_call_used_twice_is_materialized() {
        // t = f(); return t * t  (compiled as f(); dup; imul)
        let m = method(
            "()I",
            &[],
            vec![block(
                vec![
                    call("f", "()I"),
                    StackOp::Dup,
                    StackOp::Arithmetic {
                        op: ArithmeticOp::Mul,
                        kind: NumericKind::Int,
                    },
                ],
                Terminator::Return,
            )],
        );
        let built = build(&m).unwrap();
        let summary = &built.blocks[&0];
        assert_eq!(summary.statements.len(), 1);
        let temp = summary.statements[0].assigned_variable().unwrap();
        assert_eq!(temp, VariableId::Temp(0));
        let ExitExpression::Return(Some(value)) = &summary.exit else {
            panic!("expected a return value");
        };
        assert_eq!(value.count_variable(temp), 2);
    }

    #[test]
    fn test_increment_forms() {
        // b = a++; b = ++a; a += 3;
        let m = method(
            "()V",
            &[("a", "I"), ("b", "I")],
            vec![block(
                vec![
                    StackOp::Load(0),
                    StackOp::Increment { local: 0, delta: 1 },
                    StackOp::Store(1),
                    StackOp::Increment { local: 0, delta: 1 },
                    StackOp::Load(0),
                    StackOp::Store(1),
                    StackOp::Increment { local: 0, delta: 3 },
                ],
                Terminator::Return,
            )],
        );
        let built = build(&m).unwrap();
        let statements = &built.blocks[&0].statements;
        assert_eq!(statements.len(), 3);
        let prefix_of = |statement: &Statement| match statement {
            Statement::Expression(ExpressionNode {
                kind: ExpressionKind::Assignment { value, .. },
                ..
            }) => match value.kind {
                ExpressionKind::Increment { prefix, .. } => Some(prefix),
                _ => None,
            },
            _ => None,
        };
        assert_eq!(prefix_of(&statements[0]), Some(false));
        assert_eq!(prefix_of(&statements[1]), Some(true));
        assert!(matches!(
            &statements[2],
            Statement::Expression(ExpressionNode {
                kind: ExpressionKind::Increment { delta: 3, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_constructor_call_folds_into_new() {
        // return new Foo(1)
        let m = method(
            "()LFoo;",
            &[],
            vec![block(
                vec![
                    StackOp::New("Foo".to_string()),
                    StackOp::Dup,
                    StackOp::Push(Constant::Int(1)),
                    StackOp::Invoke {
                        kind: InvokeKind::Special,
                        method: MethodRef {
                            owner: "Foo".to_string(),
                            name: "<init>".to_string(),
                            descriptor: "(I)V".to_string(),
                        },
                    },
                ],
                Terminator::Return,
            )],
        );
        let built = build(&m).unwrap();
        let summary = &built.blocks[&0];
        assert!(summary.statements.is_empty());
        let ExitExpression::Return(Some(value)) = &summary.exit else {
            panic!("expected a return value");
        };
        assert!(matches!(value.kind, ExpressionKind::NewObject { .. }));
    }

    #[test]
    fn test_side_effect_is_flushed_before_statement() {
        // return f() + (x = 1, x)  - the call must run before the store
        let m = method(
            "()I",
            &[("x", "I")],
            vec![block(
                vec![
                    call("f", "()I"),
                    StackOp::Push(Constant::Int(1)),
                    StackOp::Store(0),
                    StackOp::Load(0),
                    StackOp::Arithmetic {
                        op: ArithmeticOp::Add,
                        kind: NumericKind::Int,
                    },
                ],
                Terminator::Return,
            )],
        );
        let built = build(&m).unwrap();
        let statements = &built.blocks[&0].statements;
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].assigned_variable(), Some(VariableId::Temp(0)));
        assert_eq!(statements[1].assigned_variable(), Some(VariableId::Local(0)));
    }

    #[test]
    fn test_float_compare_keeps_nan_semantics() {
        // if (a < b) with fcmpg; ifge → taken when !(a < b), unordered included
        let m = method(
            "(FF)V",
            &[("a", "F"), ("b", "F")],
            vec![
                block(
                    vec![
                        StackOp::Load(0),
                        StackOp::Load(1),
                        StackOp::Compare {
                            kind: NumericKind::Float,
                            nan_bias: Some(NanBias::Greater),
                        },
                    ],
                    Terminator::Branch {
                        condition: BranchCondition::Zero(CompareOp::Ge),
                        taken: 2,
                        not_taken: 1,
                    },
                ),
                block(vec![], Terminator::Return),
                block(vec![], Terminator::Return),
            ],
        );
        let built = build(&m).unwrap();
        let ExitExpression::Branch(condition) = &built.blocks[&0].exit else {
            panic!("expected a branch");
        };
        match &condition.kind {
            ExpressionKind::Comparison { op, semantics, .. } => {
                assert_eq!(*op, CompareOp::Ge);
                assert_eq!(*semantics, NanSemantics::Unordered);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_values_crossing_a_merge_use_one_stack_variable() {
        // return c ? 1 : 0 with the result left on the stack by both arms
        let m = method(
            "(Z)Z",
            &[("c", "Z")],
            vec![
                block(
                    vec![StackOp::Load(0)],
                    Terminator::Branch {
                        condition: BranchCondition::Zero(CompareOp::Eq),
                        taken: 2,
                        not_taken: 1,
                    },
                ),
                block(vec![StackOp::Push(Constant::Int(1))], Terminator::Jump(3)),
                block(vec![StackOp::Push(Constant::Int(0))], Terminator::FallThrough(3)),
                block(vec![], Terminator::Return),
            ],
        );
        let built = build(&m).unwrap();
        let left = built.blocks[&1].statements[0].assigned_variable();
        let right = built.blocks[&2].statements[0].assigned_variable();
        assert_eq!(left, Some(VariableId::Stack(0)));
        assert_eq!(left, right);
        assert_eq!(built.registry.get_type(VariableId::Stack(0)), Some(&SemanticType::Boolean));
        let ExitExpression::Return(Some(value)) = &built.blocks[&3].exit else {
            panic!("expected a return value");
        };
        assert_eq!(value.as_variable(), Some(VariableId::Stack(0)));
    }

    #[test]
    fn test_straight_line_value_moves_across_edge() {
        // f() pushed in block 0, consumed by a store in block 1
        let m = method(
            "()V",
            &[("x", "I")],
            vec![
                block(vec![call("f", "()I")], Terminator::FallThrough(1)),
                block(vec![StackOp::Store(0)], Terminator::Return),
            ],
        );
        let built = build(&m).unwrap();
        assert!(built.blocks[&0].statements.is_empty());
        let statements = &built.blocks[&1].statements;
        assert_eq!(statements.len(), 1);
        let Statement::Expression(ExpressionNode {
            kind: ExpressionKind::Assignment { value, .. },
            ..
        }) = &statements[0]
        else {
            panic!("expected an assignment");
        };
        assert!(matches!(value.kind, ExpressionKind::MethodCall { .. }));
    }

    #[test]
    fn test_stack_underflow_reports_operand() {
        let m = method("()V", &[], vec![block(vec![StackOp::Pop], Terminator::Return)]);
        let error = build(&m).unwrap_err();
        match error {
            ReconstructionError::Structure(error) => {
                assert_eq!(error.block, 0);
                assert_eq!(error.operand, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_field_compound_assignment_keeps_order() {
        // this.count += 1 with a trivially duplicated receiver
        let field = FieldRef {
            owner: "T".to_string(),
            name: "count".to_string(),
            descriptor: "I".to_string(),
            is_static: false,
        };
        let mut m = method(
            "()V",
            &[("this", "LT;")],
            vec![block(
                vec![
                    StackOp::Load(0),
                    StackOp::Dup,
                    StackOp::GetField(field.clone()),
                    StackOp::Push(Constant::Int(1)),
                    StackOp::Arithmetic {
                        op: ArithmeticOp::Add,
                        kind: NumericKind::Int,
                    },
                    StackOp::PutField(field),
                ],
                Terminator::Return,
            )],
        );
        m.is_static = false;
        let built = build(&m).unwrap();
        assert_eq!(built.blocks[&0].statements.len(), 1);
    }
}
