// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Method builders plus two small interpreters, one for block graphs and one for
//! reconstructed statement trees, so tests can compare observable behavior.

#![allow(dead_code)]

use stack_structurer::bytecode::{
    ArithmeticOp, BasicBlock, BranchCondition, CompareOp, Constant, ExceptionEntry, InvokeKind, LocalVariable,
    MethodRef, NanBias, NumericKind, PrimitiveKind, StackOp, SwitchTable, Terminator,
};
use stack_structurer::control_flow_reconstruction::region::{CaseLabel, LoopKind};
use stack_structurer::expression::node::{ExpressionKind, Literal, NanSemantics, UnaryOp, VariableId};
use stack_structurer::types::parse_method_descriptor;
use stack_structurer::{
    reconstruct_method, DescriptorTypeLookup, ExpressionNode, MethodBody, ReconstructedMethod, ReconstructionOptions,
    SemanticType, Statement,
};
use std::collections::BTreeMap;

const STEP_LIMIT: usize = 100_000;

// ---------------------------------------------------------------------------
// Building methods

/// A static method; `locals` lists every local slot, parameters first.
pub fn method(descriptor: &str, locals: &[(&str, &str)], blocks: Vec<BasicBlock>) -> MethodBody {
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

pub fn with_handler(mut method: MethodBody, start: usize, end: usize, handler: usize, catch_type: Option<&str>) -> MethodBody {
    method.exception_table.push(ExceptionEntry {
        start,
        end,
        handler,
        catch_type: catch_type.map(str::to_string),
    });
    method
}

pub fn block(ops: Vec<StackOp>, terminator: Terminator) -> BasicBlock {
    BasicBlock { ops, terminator }
}

pub fn push(value: i32) -> StackOp {
    StackOp::Push(Constant::Int(value))
}

pub fn push_double(value: f64) -> StackOp {
    StackOp::Push(Constant::Double(value))
}

pub fn load(local: u16) -> StackOp {
    StackOp::Load(local)
}

pub fn store(local: u16) -> StackOp {
    StackOp::Store(local)
}

pub fn iinc(local: u16, delta: i32) -> StackOp {
    StackOp::Increment { local, delta }
}

pub fn int_op(op: ArithmeticOp) -> StackOp {
    StackOp::Arithmetic {
        op,
        kind: NumericKind::Int,
    }
}

/// Static call on the test runtime class `T`.
pub fn call(name: &str, descriptor: &str) -> StackOp {
    StackOp::Invoke {
        kind: InvokeKind::Static,
        method: MethodRef {
            owner: "T".to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        },
    }
}

/// `T.log(int)`, recorded in the trace.
pub fn log() -> StackOp {
    call("log", "(I)V")
}

pub fn goto(target: usize) -> Terminator {
    Terminator::Jump(target)
}

pub fn fall(target: usize) -> Terminator {
    Terminator::FallThrough(target)
}

/// Branches to `taken` when the popped value compares against zero with `op`.
pub fn if_zero(op: CompareOp, taken: usize, not_taken: usize) -> Terminator {
    Terminator::Branch {
        condition: BranchCondition::Zero(op),
        taken,
        not_taken,
    }
}

pub fn if_cmp(op: CompareOp, taken: usize, not_taken: usize) -> Terminator {
    Terminator::Branch {
        condition: BranchCondition::Operands(op),
        taken,
        not_taken,
    }
}

pub fn switch(cases: &[(i32, usize)], default: usize) -> Terminator {
    Terminator::Switch(SwitchTable {
        cases: cases.to_vec(),
        default,
        decoding: Default::default(),
    })
}

pub fn reconstruct(method: &MethodBody) -> ReconstructedMethod {
    reconstruct_with(method, &ReconstructionOptions::default())
}

pub fn reconstruct_with(method: &MethodBody, options: &ReconstructionOptions) -> ReconstructedMethod {
    let types = DescriptorTypeLookup::new();
    match reconstruct_method(method, &types, options) {
        Ok(reconstructed) => reconstructed,
        Err(err) => panic!("reconstruction failed: {err}\n{method:#?}"),
    }
}

// ---------------------------------------------------------------------------
// Observable behavior

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
}

impl Value {
    fn int(self) -> i64 {
        match self {
            Value::Int(value) => value,
            Value::Double(value) => value as i64,
        }
    }

    fn double(self) -> f64 {
        match self {
            Value::Int(value) => value as f64,
            Value::Double(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Returned(Option<i64>),
    Threw(i64),
}

/// Calls made, in order, and how the method completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub calls: Vec<(String, Vec<i64>)>,
    pub completion: Completion,
}

/// Runtime class `T`: every call is recorded; `check` throws its argument when it is
/// negative; non-void calls return the sum of their arguments plus one.
#[derive(Default)]
struct Runtime {
    calls: Vec<(String, Vec<i64>)>,
}

impl Runtime {
    fn invoke(&mut self, method: &MethodRef, arguments: Vec<Value>) -> Result<Option<Value>, i64> {
        let arguments: Vec<i64> = arguments.into_iter().map(Value::int).collect();
        self.calls.push((method.name.clone(), arguments.clone()));
        if method.name == "check" {
            if let Some(&negative) = arguments.iter().find(|value| **value < 0) {
                return Err(negative);
            }
        }
        Ok((!method.descriptor.ends_with('V')).then(|| Value::Int(arguments.iter().sum::<i64>() + 1)))
    }
}

fn wrap(value: i64, kind: NumericKind) -> Value {
    match kind {
        NumericKind::Int => Value::Int(value as i32 as i64),
        _ => Value::Int(value),
    }
}

fn arithmetic(op: ArithmeticOp, kind: NumericKind, left: Value, right: Value) -> Value {
    if kind.is_floating() {
        let (l, r) = (left.double(), right.double());
        let value = match op {
            ArithmeticOp::Add => l + r,
            ArithmeticOp::Sub => l - r,
            ArithmeticOp::Mul => l * r,
            ArithmeticOp::Div => l / r,
            ArithmeticOp::Rem => l % r,
            _ => panic!("bitwise {op:?} on floating operands"),
        };
        return Value::Double(if kind == NumericKind::Float { value as f32 as f64 } else { value });
    }
    let (l, r) = (left.int(), right.int());
    let bits = if kind == NumericKind::Int { 31 } else { 63 };
    let value = match op {
        ArithmeticOp::Add => l.wrapping_add(r),
        ArithmeticOp::Sub => l.wrapping_sub(r),
        ArithmeticOp::Mul => l.wrapping_mul(r),
        ArithmeticOp::Div => l.wrapping_div(r),
        ArithmeticOp::Rem => l.wrapping_rem(r),
        ArithmeticOp::Shl => l.wrapping_shl((r & bits) as u32),
        ArithmeticOp::Shr => l.wrapping_shr((r & bits) as u32),
        ArithmeticOp::Ushr if kind == NumericKind::Int => ((l as u32) >> (r & bits)) as i64,
        ArithmeticOp::Ushr => ((l as u64) >> (r & bits)) as i64,
        ArithmeticOp::And => l & r,
        ArithmeticOp::Or => l | r,
        ArithmeticOp::Xor => l ^ r,
    };
    wrap(value, kind)
}

fn three_way(left: Value, right: Value, nan_bias: Option<NanBias>) -> i64 {
    match (left, right, nan_bias) {
        (Value::Int(l), Value::Int(r), _) => l.cmp(&r) as i64,
        (l, r, bias) => {
            let (l, r) = (l.double(), r.double());
            match l.partial_cmp(&r) {
                Some(ordering) => ordering as i64,
                None => bias.map_or(0, |bias| bias.value() as i64),
            }
        }
    }
}

fn convert(value: Value, to: PrimitiveKind) -> Value {
    match (value, to) {
        (Value::Double(v), PrimitiveKind::Int) => Value::Int(v as i32 as i64),
        (Value::Double(v), PrimitiveKind::Long) => Value::Int(v as i64),
        (Value::Double(v), PrimitiveKind::Byte) => Value::Int(v as i32 as i8 as i64),
        (Value::Double(v), PrimitiveKind::Short) => Value::Int(v as i32 as i16 as i64),
        (Value::Double(v), PrimitiveKind::Char) => Value::Int(v as i32 as u16 as i64),
        (Value::Double(v), PrimitiveKind::Float) => Value::Double(v as f32 as f64),
        (Value::Double(v), _) => Value::Double(v),
        (Value::Int(v), PrimitiveKind::Int) => Value::Int(v as i32 as i64),
        (Value::Int(v), PrimitiveKind::Byte) => Value::Int(v as i8 as i64),
        (Value::Int(v), PrimitiveKind::Short) => Value::Int(v as i16 as i64),
        (Value::Int(v), PrimitiveKind::Char) => Value::Int(v as u16 as i64),
        (Value::Int(v), PrimitiveKind::Float) => Value::Double(v as f32 as f64),
        (Value::Int(v), PrimitiveKind::Double) => Value::Double(v as f64),
        (Value::Int(v), _) => Value::Int(v),
    }
}

// ---------------------------------------------------------------------------
// Block graph interpreter

pub fn run_bytecode(method: &MethodBody, arguments: &[Value]) -> Outcome {
    let mut runtime = Runtime::default();
    let mut locals: Vec<Option<Value>> = vec![None; method.locals.len().max(arguments.len())];
    for (index, argument) in arguments.iter().enumerate() {
        locals[index] = Some(*argument);
    }
    let mut stack: Vec<Value> = vec![];
    let mut current = 0;
    let mut steps = 0;

    let completion = 'run: loop {
        steps += 1;
        assert!(steps < STEP_LIMIT, "bytecode did not terminate");
        let block = &method.blocks[current];
        let mut thrown = None;
        for op in &block.ops {
            match execute(op, &mut stack, &mut locals, &mut runtime) {
                Ok(()) => {}
                Err(exception) => {
                    thrown = Some(exception);
                    break;
                }
            }
        }
        let next = match thrown {
            Some(exception) => Err(exception),
            None => terminate(method, &block.terminator, &mut stack),
        };
        match next {
            Ok(Ok(target)) => current = target,
            Ok(Err(completion)) => break 'run completion,
            Err(exception) => {
                let handler = method
                    .exception_table
                    .iter()
                    .find(|entry| entry.covers(current))
                    .map(|entry| entry.handler);
                match handler {
                    Some(handler) => {
                        stack.clear();
                        stack.push(Value::Int(exception));
                        current = handler;
                    }
                    None => break 'run Completion::Threw(exception),
                }
            }
        }
    };
    Outcome {
        calls: runtime.calls,
        completion,
    }
}

fn execute(op: &StackOp, stack: &mut Vec<Value>, locals: &mut Vec<Option<Value>>, runtime: &mut Runtime) -> Result<(), i64> {
    let mut pop = |stack: &mut Vec<Value>| stack.pop().expect("operand stack underflow");
    match op {
        StackOp::Push(constant) => stack.push(match constant {
            Constant::Int(v) => Value::Int(*v as i64),
            Constant::Long(v) => Value::Int(*v),
            Constant::Float(v) => Value::Double(*v as f64),
            Constant::Double(v) => Value::Double(*v),
            _ => Value::Int(0),
        }),
        StackOp::Load(local) => stack.push(locals[*local as usize].expect("read of unassigned local")),
        StackOp::Store(local) => {
            let index = *local as usize;
            if locals.len() <= index {
                locals.resize(index + 1, None);
            }
            locals[index] = Some(pop(stack));
        }
        StackOp::Increment { local, delta } => {
            let slot = &mut locals[*local as usize];
            let value = slot.expect("increment of unassigned local").int();
            *slot = Some(wrap(value + *delta as i64, NumericKind::Int));
        }
        StackOp::Arithmetic { op, kind } => {
            let right = pop(stack);
            let left = pop(stack);
            stack.push(arithmetic(*op, *kind, left, right));
        }
        StackOp::Negate(kind) => {
            let value = pop(stack);
            stack.push(match value {
                Value::Double(v) => Value::Double(-v),
                Value::Int(v) => wrap(v.wrapping_neg(), *kind),
            });
        }
        StackOp::Compare { nan_bias, .. } => {
            let right = pop(stack);
            let left = pop(stack);
            stack.push(Value::Int(three_way(left, right, *nan_bias)));
        }
        StackOp::Convert { to, .. } => {
            let value = pop(stack);
            stack.push(convert(value, *to));
        }
        StackOp::Invoke { method, .. } => {
            let (parameters, _) = parse_method_descriptor(&method.descriptor).expect("descriptor");
            let mut arguments: Vec<Value> = (0..parameters.len()).map(|_| pop(stack)).collect();
            arguments.reverse();
            if let Some(result) = runtime.invoke(method, arguments)? {
                stack.push(result);
            }
        }
        StackOp::Dup => {
            let top = *stack.last().expect("operand stack underflow");
            stack.push(top);
        }
        StackOp::Pop => {
            pop(stack);
        }
        StackOp::Swap => {
            let top = pop(stack);
            let below = pop(stack);
            stack.push(top);
            stack.push(below);
        }
        other => panic!("test interpreter does not support {other:?}"),
    }
    Ok(())
}

/// Next block, or how the method completed; `Err` carries a thrown value.
fn terminate(method: &MethodBody, terminator: &Terminator, stack: &mut Vec<Value>) -> Result<Result<usize, Completion>, i64> {
    let mut pop = || stack.pop().expect("operand stack underflow");
    Ok(match terminator {
        Terminator::FallThrough(target) | Terminator::Jump(target) => Ok(*target),
        Terminator::Branch {
            condition,
            taken,
            not_taken,
        } => {
            let holds = match condition {
                BranchCondition::Zero(op) => op.holds_for(pop().int().signum() as i32),
                BranchCondition::Operands(op) => {
                    let right = pop();
                    let left = pop();
                    op.holds_for(three_way(left, right, None) as i32)
                }
                BranchCondition::Null => pop().int() == 0,
                BranchCondition::NonNull => pop().int() != 0,
            };
            Ok(if holds { *taken } else { *not_taken })
        }
        Terminator::Switch(table) => {
            let key = pop().int();
            let target = table
                .cases
                .iter()
                .find(|(value, _)| *value as i64 == key)
                .map_or(table.default, |(_, target)| *target);
            Ok(target)
        }
        Terminator::Return if method.descriptor.ends_with('V') => Err(Completion::Returned(None)),
        Terminator::Return => Err(Completion::Returned(Some(pop().int()))),
        Terminator::Throw => return Err(pop().int()),
    })
}

// ---------------------------------------------------------------------------
// Statement tree interpreter

enum Flow {
    Normal,
    Break(Option<String>),
    Continue(Option<String>),
    Return(Option<Value>),
    Throw(i64),
}

struct TreeInterpreter {
    runtime: Runtime,
    variables: BTreeMap<VariableId, Value>,
    caught: Option<i64>,
    steps: usize,
}

pub fn run_tree(method: &ReconstructedMethod, arguments: &[Value]) -> Outcome {
    let mut interpreter = TreeInterpreter {
        runtime: Runtime::default(),
        variables: BTreeMap::new(),
        caught: None,
        steps: 0,
    };
    for (index, argument) in arguments.iter().enumerate() {
        interpreter
            .variables
            .insert(VariableId::Local(index as u16), *argument);
    }
    let completion = match interpreter.block(&method.body) {
        Flow::Normal => Completion::Returned(None),
        Flow::Return(value) => Completion::Returned(value.map(Value::int)),
        Flow::Throw(exception) => Completion::Threw(exception),
        Flow::Break(label) => panic!("break {label:?} escaped the method"),
        Flow::Continue(label) => panic!("continue {label:?} escaped the method"),
    };
    Outcome {
        calls: interpreter.runtime.calls,
        completion,
    }
}

impl TreeInterpreter {
    fn block(&mut self, statements: &[Statement]) -> Flow {
        for statement in statements {
            match self.statement(statement) {
                Flow::Normal => {}
                other => return other,
            }
        }
        Flow::Normal
    }

    fn condition(&mut self, condition: &ExpressionNode) -> Result<bool, i64> {
        Ok(self.eval(condition)?.int() != 0)
    }

    fn statement(&mut self, statement: &Statement) -> Flow {
        self.steps += 1;
        assert!(self.steps < STEP_LIMIT, "statement tree did not terminate");
        macro_rules! value {
            ($expr:expr) => {
                match self.eval($expr) {
                    Ok(value) => value,
                    Err(exception) => return Flow::Throw(exception),
                }
            };
        }
        match statement {
            Statement::Expression(expr) => {
                value!(expr);
                Flow::Normal
            }
            Statement::Declare { variable, value, .. } => {
                if let Some(value) = value {
                    let value = value!(value);
                    self.variables.insert(*variable, value);
                }
                Flow::Normal
            }
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                if value!(condition).int() != 0 {
                    self.block(then_body)
                } else {
                    self.block(else_body)
                }
            }
            Statement::Loop {
                kind,
                label,
                condition,
                body,
                update,
            } => loop {
                if *kind == LoopKind::PreTest {
                    let condition = condition.as_ref().expect("pre-test loop without condition");
                    match self.condition(condition) {
                        Ok(true) => {}
                        Ok(false) => return Flow::Normal,
                        Err(exception) => return Flow::Throw(exception),
                    }
                }
                match self.block(body) {
                    Flow::Normal | Flow::Continue(None) => {}
                    Flow::Continue(Some(target)) if label.as_ref() == Some(&target) => {}
                    Flow::Break(None) => return Flow::Normal,
                    Flow::Break(Some(target)) if label.as_ref() == Some(&target) => return Flow::Normal,
                    other => return other,
                }
                match self.block(update) {
                    Flow::Normal => {}
                    other => return other,
                }
                if *kind == LoopKind::PostTest {
                    let condition = condition.as_ref().expect("post-test loop without condition");
                    match self.condition(condition) {
                        Ok(true) => {}
                        Ok(false) => return Flow::Normal,
                        Err(exception) => return Flow::Throw(exception),
                    }
                }
            },
            Statement::Switch {
                label,
                selector,
                cases,
            } => {
                let key = value!(selector).int();
                let matches = |labels: &[CaseLabel]| {
                    labels.iter().any(|case| match case {
                        CaseLabel::Int(value) => *value as i64 == key,
                        CaseLabel::Char(value) => *value as i64 == key,
                        _ => false,
                    })
                };
                let start = cases
                    .iter()
                    .position(|case| matches(&case.labels))
                    .or_else(|| cases.iter().position(|case| case.labels.contains(&CaseLabel::Default)));
                let Some(start) = start else {
                    return Flow::Normal;
                };
                for case in &cases[start..] {
                    match self.block(&case.body) {
                        Flow::Normal => {}
                        Flow::Break(None) => return Flow::Normal,
                        Flow::Break(Some(target)) if label.as_ref() == Some(&target) => return Flow::Normal,
                        other => return other,
                    }
                }
                Flow::Normal
            }
            Statement::Try {
                body,
                catches,
                finally,
            } => {
                let mut flow = self.block(body);
                if let Flow::Throw(exception) = flow {
                    if let Some(clause) = catches.first() {
                        self.variables.insert(clause.variable, Value::Int(exception));
                        self.caught = Some(exception);
                        flow = self.block(&clause.body);
                    }
                }
                match finally {
                    Some(finally) => match self.block(finally) {
                        Flow::Normal => flow,
                        other => other,
                    },
                    None => flow,
                }
            }
            Statement::Break { label } => Flow::Break(label.clone()),
            Statement::Continue { label } => Flow::Continue(label.clone()),
            Statement::Return(value) => match value {
                Some(value) => Flow::Return(Some(value!(value))),
                None => Flow::Return(None),
            },
            Statement::Throw(value) => Flow::Throw(value!(value).int()),
            Statement::Assert { condition, message } => {
                if value!(condition).int() == 0 {
                    let message = match message {
                        Some(message) => value!(message).int(),
                        None => 0,
                    };
                    return Flow::Throw(message);
                }
                Flow::Normal
            }
            Statement::MonitorEnter(value) | Statement::MonitorExit(value) => {
                value!(value);
                Flow::Normal
            }
        }
    }

    fn eval(&mut self, expr: &ExpressionNode) -> Result<Value, i64> {
        Ok(match &expr.kind {
            ExpressionKind::Constant(literal) => match literal {
                Literal::Boolean(value) => Value::Int(*value as i64),
                Literal::Char(value) => Value::Int(*value as i64),
                Literal::Int(value) => Value::Int(*value as i64),
                Literal::Long(value) => Value::Int(*value),
                Literal::Float(value) => Value::Double(*value as f64),
                Literal::Double(value) => Value::Double(*value),
                _ => Value::Int(0),
            },
            ExpressionKind::Variable(id) => *self
                .variables
                .get(id)
                .unwrap_or_else(|| panic!("read of unassigned {id:?}")),
            ExpressionKind::Binary { op, kind, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                arithmetic(*op, *kind, left, right)
            }
            ExpressionKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match (op, value) {
                    (UnaryOp::Not, value) => Value::Int((value.int() == 0) as i64),
                    (UnaryOp::Negate, Value::Double(v)) => Value::Double(-v),
                    (UnaryOp::Negate, Value::Int(v)) if expr.ty == SemanticType::Long => Value::Int(v.wrapping_neg()),
                    (UnaryOp::Negate, Value::Int(v)) => wrap(v.wrapping_neg(), NumericKind::Int),
                }
            }
            ExpressionKind::Comparison {
                op,
                semantics,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let unordered = left.double().is_nan() || right.double().is_nan();
                let holds = match (semantics, unordered) {
                    (NanSemantics::Unordered, true) => true,
                    (_, true) => false,
                    _ => op.holds_for(three_way(left, right, None) as i32),
                };
                Value::Int(holds as i64)
            }
            ExpressionKind::ThreeWayCompare {
                nan_bias, left, right, ..
            } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Value::Int(three_way(left, right, *nan_bias))
            }
            ExpressionKind::MethodCall { method, arguments, .. } => {
                let mut values = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    values.push(self.eval(argument)?);
                }
                self.runtime.invoke(method, values)?.unwrap_or(Value::Int(0))
            }
            ExpressionKind::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                if self.condition(condition)? {
                    self.eval(then_value)?
                } else {
                    self.eval(else_value)?
                }
            }
            ExpressionKind::Switch { selector, arms } => {
                let key = self.eval(selector)?.int();
                let matches = |label: &CaseLabel| match label {
                    CaseLabel::Int(value) => *value as i64 == key,
                    CaseLabel::Char(value) => *value as i64 == key,
                    _ => false,
                };
                let arm = arms
                    .iter()
                    .find(|arm| arm.labels.iter().any(matches))
                    .or_else(|| arms.iter().find(|arm| arm.labels.contains(&CaseLabel::Default)))
                    .expect("switch expression without a matching arm");
                self.eval(&arm.value)?
            }
            ExpressionKind::LogicalAnd(left, right) => {
                Value::Int((self.condition(left)? && self.condition(right)?) as i64)
            }
            ExpressionKind::LogicalOr(left, right) => {
                Value::Int((self.condition(left)? || self.condition(right)?) as i64)
            }
            ExpressionKind::Cast { target, operand } => {
                let value = self.eval(operand)?;
                let to = match target {
                    SemanticType::Boolean | SemanticType::Int => PrimitiveKind::Int,
                    SemanticType::Byte => PrimitiveKind::Byte,
                    SemanticType::Char => PrimitiveKind::Char,
                    SemanticType::Short => PrimitiveKind::Short,
                    SemanticType::Long => PrimitiveKind::Long,
                    SemanticType::Float => PrimitiveKind::Float,
                    SemanticType::Double => PrimitiveKind::Double,
                    _ => return Ok(value),
                };
                convert(value, to)
            }
            ExpressionKind::Assignment { target, value } => {
                let value = self.eval(value)?;
                let id = target.as_variable().expect("assignment to a variable");
                self.variables.insert(id, value);
                value
            }
            ExpressionKind::Increment { target, delta, prefix } => {
                let id = target.as_variable().expect("increment of a variable");
                let old = *self
                    .variables
                    .get(&id)
                    .unwrap_or_else(|| panic!("increment of unassigned {id:?}"));
                let new = wrap(old.int() + *delta as i64, NumericKind::Int);
                self.variables.insert(id, new);
                if *prefix {
                    new
                } else {
                    old
                }
            }
            ExpressionKind::CaughtException => Value::Int(self.caught.expect("no exception in flight")),
            other => panic!("test interpreter does not support {other:?}"),
        })
    }
}

/// Reconstructs `method` and checks that the tree behaves like the block graph on
/// every argument list.
pub fn assert_round_trip(method: &MethodBody, inputs: &[Vec<Value>]) -> ReconstructedMethod {
    let reconstructed = reconstruct(method);
    for arguments in inputs {
        assert_eq!(
            run_tree(&reconstructed, arguments),
            run_bytecode(method, arguments),
            "diverged on {arguments:?}\n{:#?}",
            reconstructed.body
        );
    }
    reconstructed
}

pub fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Vec<Value>> {
    values.into_iter().map(|value| vec![Value::Int(value)]).collect()
}

// ---------------------------------------------------------------------------
// Tree queries

pub fn walk_statements<'a>(statements: &'a [Statement], visit: &mut impl FnMut(&'a Statement)) {
    for statement in statements {
        visit(statement);
        match statement {
            Statement::If {
                then_body, else_body, ..
            } => {
                walk_statements(then_body, visit);
                walk_statements(else_body, visit);
            }
            Statement::Loop { body, update, .. } => {
                walk_statements(body, visit);
                walk_statements(update, visit);
            }
            Statement::Switch { cases, .. } => {
                for case in cases {
                    walk_statements(&case.body, visit);
                }
            }
            Statement::Try {
                body,
                catches,
                finally,
            } => {
                walk_statements(body, visit);
                for clause in catches {
                    walk_statements(&clause.body, visit);
                }
                if let Some(finally) = finally {
                    walk_statements(finally, visit);
                }
            }
            _ => {}
        }
    }
}

/// Number of calls to `T.name` appearing in the tree.
pub fn count_calls(statements: &[Statement], name: &str) -> usize {
    let mut count = 0;
    walk_statements(statements, &mut |statement| {
        for expr in statement.head_expressions() {
            expr.walk(&mut |node| {
                if matches!(&node.kind, ExpressionKind::MethodCall { method, .. } if method.name == name) {
                    count += 1;
                }
            });
        }
    });
    count
}

pub fn loops(statements: &[Statement]) -> Vec<&Statement> {
    let mut found = vec![];
    walk_statements(statements, &mut |statement| {
        if matches!(statement, Statement::Loop { .. }) {
            found.push(statement);
        }
    });
    found
}

/// Calls `T.log(value)` appearing in the tree.
pub fn count_logs(statements: &[Statement], value: i32) -> usize {
    let mut count = 0;
    walk_statements(statements, &mut |statement| {
        for expr in statement.head_expressions() {
            expr.walk(&mut |node| {
                if let ExpressionKind::MethodCall { method, arguments, .. } = &node.kind {
                    if method.name == "log" && arguments.first().and_then(ExpressionNode::as_int) == Some(value) {
                        count += 1;
                    }
                }
            });
        }
    });
    count
}

pub fn conditionals(statements: &[Statement]) -> Vec<&Statement> {
    let mut found = vec![];
    walk_statements(statements, &mut |statement| {
        if matches!(statement, Statement::If { .. }) {
            found.push(statement);
        }
    });
    found
}

pub fn declarations(statements: &[Statement]) -> usize {
    let mut count = 0;
    walk_statements(statements, &mut |statement| {
        if matches!(statement, Statement::Declare { .. }) {
            count += 1;
        }
    });
    count
}
