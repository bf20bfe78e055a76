// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Switches for the optional rewrites applied on top of plain structuring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconstructionOptions {
    /// Collapse chains of conditional blocks into `&&` / `||`.
    pub fold_short_circuit: bool,
    /// Fold if/else arms assigning one stack slot into a conditional expression.
    pub fold_conditionals: bool,
    /// Emit `for` loops when a latch only updates counters and is a continue target.
    pub recognize_for_loops: bool,
    pub recognize_asserts: bool,
    pub inline_temporaries: bool,
    /// Merge the `hashCode` and index switches javac emits for a string switch.
    pub recognize_string_switches: bool,
    /// Prefix for synthesized loop and switch labels.
    pub label_prefix: String,
}

impl Default for ReconstructionOptions {
    fn default() -> Self {
        Self {
            fold_short_circuit: true,
            fold_conditionals: true,
            recognize_for_loops: true,
            recognize_asserts: true,
            inline_temporaries: true,
            recognize_string_switches: true,
            label_prefix: "label".to_string(),
        }
    }
}
