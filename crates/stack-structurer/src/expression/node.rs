// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use crate::bytecode::{ArithmeticOp, BlockId, CompareOp, FieldRef, InvokeKind, LocalId, MethodRef, NanBias, NumericKind};
use crate::control_flow_reconstruction::region::CaseLabel;
use crate::types::SemanticType;
use serde::Serialize;

/// Identity of a variable in the reconstructed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableId {
    /// Entry of the method's local variable table.
    Local(LocalId),
    /// Operand stack slot carried across a control-flow merge.
    Stack(usize),
    /// Value materialised to avoid evaluating it twice or out of order.
    Temp(usize),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Null,
    Boolean(bool),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(String),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Null, Literal::Null) => true,
            (Literal::Boolean(a), Literal::Boolean(b)) => a == b,
            (Literal::Char(a), Literal::Char(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Long(a), Literal::Long(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Double(a), Literal::Double(b)) => a.to_bits() == b.to_bits(),
            (Literal::String(a), Literal::String(b)) => a == b,
            (Literal::Class(a), Literal::Class(b)) => a == b,
            _ => false,
        }
    }
}

/// Outcome of a comparison when an operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NanSemantics {
    /// Integer or reference operands; NaN cannot occur.
    Integral,
    /// False when the operands are unordered (the source operators `<`, `==`, ...).
    Ordered,
    /// True when the operands are unordered.
    Unordered,
}

impl NanSemantics {
    /// Semantics of `three_way(l, r) op 0` for a compare instruction with `bias`.
    pub fn of(op: CompareOp, bias: Option<NanBias>) -> Self {
        match bias {
            None => NanSemantics::Integral,
            Some(bias) if op.holds_for(bias.value()) => NanSemantics::Unordered,
            Some(_) => NanSemantics::Ordered,
        }
    }

    pub fn negate(self) -> Self {
        match self {
            NanSemantics::Integral => NanSemantics::Integral,
            NanSemantics::Ordered => NanSemantics::Unordered,
            NanSemantics::Unordered => NanSemantics::Ordered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionKind {
    Constant(Literal),
    Variable(VariableId),
    Field {
        /// `None` for static fields.
        target: Option<Box<ExpressionNode>>,
        field: FieldRef,
    },
    Binary {
        op: ArithmeticOp,
        kind: NumericKind,
        left: Box<ExpressionNode>,
        right: Box<ExpressionNode>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ExpressionNode>,
    },
    Comparison {
        op: CompareOp,
        semantics: NanSemantics,
        left: Box<ExpressionNode>,
        right: Box<ExpressionNode>,
    },
    /// `lcmp` / `fcmpl` / ... result consumed as a value rather than by a branch.
    ThreeWayCompare {
        kind: NumericKind,
        nan_bias: Option<NanBias>,
        left: Box<ExpressionNode>,
        right: Box<ExpressionNode>,
    },
    MethodCall {
        kind: InvokeKind,
        method: MethodRef,
        receiver: Option<Box<ExpressionNode>>,
        arguments: Vec<ExpressionNode>,
    },
    Conditional {
        condition: Box<ExpressionNode>,
        then_value: Box<ExpressionNode>,
        else_value: Box<ExpressionNode>,
    },
    /// `switch (selector) { case .. -> value; .. }`. Only the matching arm is evaluated.
    Switch {
        selector: Box<ExpressionNode>,
        arms: Vec<SwitchValue>,
    },
    LogicalAnd(Box<ExpressionNode>, Box<ExpressionNode>),
    LogicalOr(Box<ExpressionNode>, Box<ExpressionNode>),
    ArrayAccess {
        array: Box<ExpressionNode>,
        index: Box<ExpressionNode>,
    },
    ArrayLength(Box<ExpressionNode>),
    NewObject {
        class: String,
        constructor: MethodRef,
        arguments: Vec<ExpressionNode>,
    },
    NewArray {
        element: SemanticType,
        dimensions: Vec<ExpressionNode>,
    },
    Cast {
        target: SemanticType,
        operand: Box<ExpressionNode>,
    },
    InstanceOf {
        operand: Box<ExpressionNode>,
        class: String,
    },
    /// Assignment usable as a value; the target is a variable, field or array element.
    Assignment {
        target: Box<ExpressionNode>,
        value: Box<ExpressionNode>,
    },
    Increment {
        target: Box<ExpressionNode>,
        delta: i32,
        prefix: bool,
    },
    /// The exception object on entry to a handler.
    CaughtException,
    /// Incoming stack slot of a block, replaced once cross-block values are resolved.
    Placeholder { block: BlockId, slot: usize },
    /// Result of `new` whose constructor has not run yet.
    Uninitialized {
        class: String,
        block: BlockId,
        operand: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchValue {
    pub labels: Vec<CaseLabel>,
    pub value: ExpressionNode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpressionNode {
    pub kind: ExpressionKind,
    pub ty: SemanticType,
}

impl ExpressionNode {
    pub fn new(kind: ExpressionKind, ty: SemanticType) -> Self {
        Self { kind, ty }
    }

    pub fn literal(literal: Literal) -> Self {
        let ty = match &literal {
            Literal::Null => SemanticType::Null,
            Literal::Boolean(_) => SemanticType::Boolean,
            Literal::Char(_) => SemanticType::Char,
            Literal::Int(_) => SemanticType::Int,
            Literal::Long(_) => SemanticType::Long,
            Literal::Float(_) => SemanticType::Float,
            Literal::Double(_) => SemanticType::Double,
            Literal::String(_) => SemanticType::string(),
            Literal::Class(_) => SemanticType::Object("java/lang/Class".to_string()),
        };
        Self::new(ExpressionKind::Constant(literal), ty)
    }

    pub fn variable(id: VariableId, ty: SemanticType) -> Self {
        Self::new(ExpressionKind::Variable(id), ty)
    }

    pub fn int(value: i32) -> Self {
        Self::literal(Literal::Int(value))
    }

    pub fn boolean(value: bool) -> Self {
        Self::literal(Literal::Boolean(value))
    }

    pub fn not(operand: ExpressionNode) -> Self {
        Self::new(
            ExpressionKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            },
            SemanticType::Boolean,
        )
    }

    pub fn and(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::new(
            ExpressionKind::LogicalAnd(Box::new(left), Box::new(right)),
            SemanticType::Boolean,
        )
    }

    pub fn or(left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::new(
            ExpressionKind::LogicalOr(Box::new(left), Box::new(right)),
            SemanticType::Boolean,
        )
    }

    pub fn assign(target: ExpressionNode, value: ExpressionNode) -> Self {
        let ty = target.ty.clone();
        Self::new(
            ExpressionKind::Assignment {
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn as_variable(&self) -> Option<VariableId> {
        match self.kind {
            ExpressionKind::Variable(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.kind {
            ExpressionKind::Constant(Literal::Int(value)) => Some(value),
            _ => None,
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&ExpressionNode> {
        use ExpressionKind::*;
        match &self.kind {
            Constant(_) | Variable(_) | CaughtException | Placeholder { .. } | Uninitialized { .. } => {
                vec![]
            }
            Field { target, .. } => target.iter().map(|t| t.as_ref()).collect(),
            Binary { left, right, .. }
            | Comparison { left, right, .. }
            | ThreeWayCompare { left, right, .. }
            | LogicalAnd(left, right)
            | LogicalOr(left, right) => vec![left.as_ref(), right.as_ref()],
            Unary { operand, .. } | Cast { operand, .. } | InstanceOf { operand, .. } => {
                vec![operand.as_ref()]
            }
            ArrayLength(array) => vec![array.as_ref()],
            MethodCall {
                receiver,
                arguments,
                ..
            } => receiver
                .iter()
                .map(|r| r.as_ref())
                .chain(arguments.iter())
                .collect(),
            Conditional {
                condition,
                then_value,
                else_value,
            } => vec![condition.as_ref(), then_value.as_ref(), else_value.as_ref()],
            Switch { selector, arms } => std::iter::once(selector.as_ref())
                .chain(arms.iter().map(|arm| &arm.value))
                .collect(),
            ArrayAccess { array, index } => vec![array.as_ref(), index.as_ref()],
            NewObject { arguments, .. } => arguments.iter().collect(),
            NewArray { dimensions, .. } => dimensions.iter().collect(),
            Assignment { target, value } => vec![target.as_ref(), value.as_ref()],
            Increment { target, .. } => vec![target.as_ref()],
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut ExpressionNode> {
        use ExpressionKind::*;
        match &mut self.kind {
            Constant(_) | Variable(_) | CaughtException | Placeholder { .. } | Uninitialized { .. } => {
                vec![]
            }
            Field { target, .. } => target.iter_mut().map(|t| t.as_mut()).collect(),
            Binary { left, right, .. }
            | Comparison { left, right, .. }
            | ThreeWayCompare { left, right, .. }
            | LogicalAnd(left, right)
            | LogicalOr(left, right) => vec![left.as_mut(), right.as_mut()],
            Unary { operand, .. } | Cast { operand, .. } | InstanceOf { operand, .. } => {
                vec![operand.as_mut()]
            }
            ArrayLength(array) => vec![array.as_mut()],
            MethodCall {
                receiver,
                arguments,
                ..
            } => receiver
                .iter_mut()
                .map(|r| r.as_mut())
                .chain(arguments.iter_mut())
                .collect(),
            Conditional {
                condition,
                then_value,
                else_value,
            } => vec![condition.as_mut(), then_value.as_mut(), else_value.as_mut()],
            Switch { selector, arms } => std::iter::once(selector.as_mut())
                .chain(arms.iter_mut().map(|arm| &mut arm.value))
                .collect(),
            ArrayAccess { array, index } => vec![array.as_mut(), index.as_mut()],
            NewObject { arguments, .. } => arguments.iter_mut().collect(),
            NewArray { dimensions, .. } => dimensions.iter_mut().collect(),
            Assignment { target, value } => vec![target.as_mut(), value.as_mut()],
            Increment { target, .. } => vec![target.as_mut()],
        }
    }

    /// Pre-order visit of the whole tree.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a ExpressionNode)) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            visit(node);
            let children = node.children();
            stack.extend(children.into_iter().rev());
        }
    }

    /// Bottom-up rewrite of every node.
    pub fn rewrite(&mut self, f: &mut impl FnMut(&mut ExpressionNode)) {
        for child in self.children_mut() {
            child.rewrite(f);
        }
        f(self);
    }

    /// Whether evaluating the node changes program state.
    pub fn has_side_effects(&self) -> bool {
        let mut effects = false;
        self.walk(&mut |node| {
            if matches!(
                node.kind,
                ExpressionKind::MethodCall { .. }
                    | ExpressionKind::Assignment { .. }
                    | ExpressionKind::Increment { .. }
                    | ExpressionKind::NewObject { .. }
                    | ExpressionKind::NewArray { .. }
                    | ExpressionKind::Placeholder { .. }
            ) {
                effects = true;
            }
        });
        effects
    }

    /// Whether the value depends on heap state (fields, array elements, calls).
    pub fn reads_memory(&self) -> bool {
        let mut reads = false;
        self.walk(&mut |node| {
            if matches!(
                node.kind,
                ExpressionKind::Field { .. }
                    | ExpressionKind::ArrayAccess { .. }
                    | ExpressionKind::ArrayLength(_)
                    | ExpressionKind::MethodCall { .. }
                    | ExpressionKind::Placeholder { .. }
            ) {
                reads = true;
            }
        });
        reads
    }

    pub fn reads_variable(&self, id: VariableId) -> bool {
        let mut found = false;
        self.walk(&mut |node| {
            if node.as_variable() == Some(id) {
                found = true;
            }
        });
        found
    }

    /// Constants, variables and the caught exception can be duplicated freely.
    pub fn is_trivial(&self) -> bool {
        matches!(
            self.kind,
            ExpressionKind::Constant(_)
                | ExpressionKind::Variable(_)
                | ExpressionKind::Uninitialized { .. }
        )
    }

    pub fn count_variable(&self, id: VariableId) -> usize {
        let mut count = 0;
        self.walk(&mut |node| {
            if node.as_variable() == Some(id) {
                count += 1;
            }
        });
        count
    }
}
