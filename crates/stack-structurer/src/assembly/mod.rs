// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Statement tree assembly module
//!
//! Lowers a resolved region tree to statements and applies the source-level passes:
//! conditional folding, temporary inlining, finally merging, asserts and declarations.

pub mod assembler;
pub mod declarations;
pub mod finally;
pub mod inlining;
pub mod statement;
pub mod string_switch;
pub mod ternary;
pub mod tidy;

pub use assembler::{AssembledMethod, StatementTreeAssembler};
pub use statement::{CatchClause, Statement, SwitchCase};
