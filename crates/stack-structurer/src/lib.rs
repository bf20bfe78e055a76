// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Structured reconstruction of stack-machine method bodies.
//!
//! A method arrives as basic blocks of typed stack operations plus an exception table
//! and leaves as a tree of statements: conditionals, loops, switches and try blocks
//! over typed expressions. [`reconstruct_method`] runs the whole pipeline for a single
//! method; methods are independent of each other and may be processed in parallel
//! against a shared [`TypeLookup`].

pub mod assembly;
pub mod bytecode;
pub mod cache;
pub mod control_flow_reconstruction;
pub mod error;
pub mod expression;
pub mod graph;
pub mod options;
pub mod pipeline;
pub mod types;

pub use assembly::{CatchClause, Statement, SwitchCase};
pub use bytecode::MethodBody;
pub use cache::SingleFlight;
pub use error::{Diagnostic, ReconstructionError, Result};
pub use expression::{ExpressionNode, VariableInfo};
pub use graph::BasicBlockGraph;
pub use options::ReconstructionOptions;
pub use pipeline::{reconstruct_method, ReconstructedMethod};
pub use types::{DescriptorTypeLookup, SemanticType, TypeLookup};
