// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use crate::bytecode::BlockId;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Location of a region in the structure tree, outermost first (`method/loop#1/if@4`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionPath(pub Vec<String>);

impl RegionPath {
    pub fn root() -> Self {
        RegionPath(vec!["method".to_string()])
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        RegionPath(segments)
    }
}

impl fmt::Display for RegionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0.join("/"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("structure error at block {block}{}, region {region_path}: {message}", operand_suffix(.operand))]
pub struct StructureError {
    pub block: BlockId,
    pub operand: Option<usize>,
    pub region_path: RegionPath,
    pub message: String,
}

fn operand_suffix(operand: &Option<usize>) -> String {
    operand
        .map(|index| format!(" operand {}", index))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("unsupported construct at block {block}: {construct}")]
pub struct UnsupportedConstruct {
    pub block: BlockId,
    pub construct: String,
}

/// Fatal for the method being reconstructed. No partial tree is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionError {
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedConstruct),
}

impl ReconstructionError {
    pub fn structure(block: BlockId, operand: Option<usize>, message: impl Into<String>) -> Self {
        ReconstructionError::Structure(StructureError {
            block,
            operand,
            region_path: RegionPath::default(),
            message: message.into(),
        })
    }

    pub fn structure_at(block: BlockId, region_path: RegionPath, message: impl Into<String>) -> Self {
        ReconstructionError::Structure(StructureError {
            block,
            operand: None,
            region_path,
            message: message.into(),
        })
    }

    pub fn unsupported(block: BlockId, construct: impl Into<String>) -> Self {
        ReconstructionError::Unsupported(UnsupportedConstruct {
            block,
            construct: construct.into(),
        })
    }
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;

/// Recoverable findings, collected on the reconstructed method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    /// A cycle or jump pattern that had to be approximated.
    UnstructuredGraph { block: BlockId, detail: String },
    /// Several interpretations were valid; the one with fewer labels was kept.
    AmbiguousClassification {
        block: BlockId,
        chosen: String,
        alternatives: usize,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnstructuredGraph { block, detail } => {
                write!(f, "unstructured graph at block {}: {}", block, detail)
            }
            Diagnostic::AmbiguousClassification {
                block,
                chosen,
                alternatives,
            } => write!(
                f,
                "ambiguous classification at block {}: chose {} over {} alternative(s)",
                block, chosen, alternatives
            ),
        }
    }
}
