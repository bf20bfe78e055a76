// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Typed stack operations and terminators making up a method body.
//!
//! These records are produced by the bytecode reader; the reconstruction engine only
//! consumes them. Block ids are indexes into the method's block list, which is kept in
//! physical (bytecode) order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type BlockId = usize;

/// Index into the method's local variable table.
pub type LocalId = u16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// A class literal, given as an internal name.
    Class(String),
}

// Floating point constants compare by bit pattern so NaN payloads survive equality checks
// (finally deduplication compares duplicated code for equality).
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) => true,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Long(a), Constant::Long(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Double(a), Constant::Double(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            (Constant::Class(a), Constant::Class(b)) => a == b,
            _ => false,
        }
    }
}

/// Computational kinds of the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericKind {
    Int,
    Long,
    Float,
    Double,
}

impl NumericKind {
    pub fn is_floating(self) -> bool {
        matches!(self, NumericKind::Float | NumericKind::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl CompareOp {
    /// The operator holding exactly when `self` does not (for totally ordered operands).
    pub fn inverse(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Ge => CompareOp::Lt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Le => CompareOp::Gt,
        }
    }

    /// Evaluate the operator against the result of a three-way comparison.
    pub fn holds_for(self, ordering: i32) -> bool {
        match self {
            CompareOp::Eq => ordering == 0,
            CompareOp::Ne => ordering != 0,
            CompareOp::Lt => ordering < 0,
            CompareOp::Ge => ordering >= 0,
            CompareOp::Gt => ordering > 0,
            CompareOp::Le => ordering <= 0,
        }
    }
}

/// Result pushed by a floating point three-way compare when either operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NanBias {
    /// `fcmpl` / `dcmpl`: NaN compares as -1.
    Less,
    /// `fcmpg` / `dcmpg`: NaN compares as 1.
    Greater,
}

impl NanBias {
    pub fn value(self) -> i32 {
        match self {
            NanBias::Less => -1,
            NanBias::Greater => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeKind {
    Static,
    Virtual,
    Interface,
    Special,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackOp {
    Push(Constant),
    Load(LocalId),
    Store(LocalId),
    Increment { local: LocalId, delta: i32 },
    Arithmetic { op: ArithmeticOp, kind: NumericKind },
    Negate(NumericKind),
    /// `lcmp` (no bias), `fcmpl`/`fcmpg`, `dcmpl`/`dcmpg`.
    Compare { kind: NumericKind, nan_bias: Option<NanBias> },
    Convert { from: NumericKind, to: PrimitiveKind },
    GetField(FieldRef),
    PutField(FieldRef),
    Invoke { kind: InvokeKind, method: MethodRef },
    New(String),
    NewArray { element: String, dimensions: u8 },
    /// Array element access; `element` is the element descriptor.
    ArrayLoad(String),
    ArrayStore(String),
    ArrayLength,
    InstanceOf(String),
    CheckCast(String),
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Pop,
    Pop2,
    Swap,
    MonitorEnter,
    MonitorExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchCondition {
    /// `ifeq` .. `ifle`: compares the top of stack against zero.
    Zero(CompareOp),
    /// `if_icmpXX` / `if_acmpXX`: compares the two topmost values.
    Operands(CompareOp),
    Null,
    NonNull,
}

/// How the integer keys of a switch are presented as case labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaseDecoding {
    #[default]
    Integer,
    /// Keys are ordinals of the named enum type.
    EnumOrdinal { enum_type: String },
    /// Keys index a table of string labels resolved by the reader.
    Strings { labels: BTreeMap<i32, String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchTable {
    pub cases: Vec<(i32, BlockId)>,
    pub default: BlockId,
    #[serde(default)]
    pub decoding: CaseDecoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    FallThrough(BlockId),
    Jump(BlockId),
    Branch {
        condition: BranchCondition,
        taken: BlockId,
        not_taken: BlockId,
    },
    Switch(SwitchTable),
    Return,
    Throw,
}

impl Terminator {
    /// Normal (non-exceptional) successors in terminator order.
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Terminator::FallThrough(target) | Terminator::Jump(target) => vec![*target],
            Terminator::Branch { taken, not_taken, .. } => vec![*taken, *not_taken],
            Terminator::Switch(table) => table
                .cases
                .iter()
                .map(|(_, target)| *target)
                .chain(std::iter::once(table.default))
                .collect(),
            Terminator::Return | Terminator::Throw => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    #[serde(default)]
    pub ops: Vec<StackOp>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    /// First protected block.
    pub start: BlockId,
    /// First block after the protected range.
    pub end: BlockId,
    pub handler: BlockId,
    /// Internal name of the caught class; `None` catches everything.
    #[serde(default)]
    pub catch_type: Option<String>,
}

impl ExceptionEntry {
    pub fn covers(&self, block: BlockId) -> bool {
        self.start <= block && block < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariable {
    /// Source name, absent for compiler-synthesized slots.
    #[serde(default)]
    pub name: Option<String>,
    pub descriptor: String,
}

/// A method body as handed over by the bytecode reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub is_static: bool,
    /// Receiver (for instance methods) and parameters come first.
    #[serde(default)]
    pub locals: Vec<LocalVariable>,
    pub blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub exception_table: Vec<ExceptionEntry>,
}
