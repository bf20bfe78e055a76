// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Control flow reconstruction module
//!
//! Recovers structured regions (conditionals, loops, switches, try blocks) from the
//! block graph, then resolves every remaining transfer into break, continue, return
//! or fall-through.

pub mod classifier;
pub mod dominance;
pub mod flow;
pub mod jumps;
pub mod region;

pub use classifier::{classify, Classification, ClassifierContext};
pub use dominance::{find_natural_loops, DominatorTree, NaturalLoop};
pub use flow::{FlowExit, FlowGraph, FlowNode};
pub use jumps::{resolve_jumps, ResolvedRegion};
pub use region::{CaseLabel, Condition, LoopKind, LoopRegion, Region, SwitchRegion, TryRegion};
