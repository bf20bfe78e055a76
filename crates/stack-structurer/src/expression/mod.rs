// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Expression reconstruction
//!
//! Turns the operand-stack code of each block into expression trees and statements,
//! and provides the boolean rewrites shared with the structuring passes.

pub mod builder;
pub mod enum_switch;
pub mod node;
pub mod short_circuit;
pub mod simplify;
pub mod variables;

pub use builder::{BlockSummary, BuiltMethod, ExitExpression, ExpressionStackBuilder};
pub use node::{ExpressionKind, ExpressionNode, Literal, NanSemantics, SwitchValue, UnaryOp, VariableId};
pub use variables::{VariableInfo, VariableRegistry};
