// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Args;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use stack_structurer::ReconstructionOptions;
use std::path::Path;

/// Represents options provided to the tool. Most of those options are configured via a toml
/// source; some over the command line flags.
///
/// NOTE: any fields carrying structured data must appear at the end for making
/// toml printing work. When changing this config, use `--print-config` to
/// verify this works.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Where the JSON results are written; standard output when empty.
    pub output_path: String,
    /// Verbosity level for logging.
    pub verbosity_level: LevelFilter,

    /// BEGIN OF STRUCTURED OPTIONS. DO NOT ADD VALUE FIELDS AFTER THIS
    /// Options for the reconstruction passes.
    pub reconstruction: ReconstructionOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            output_path: String::new(),
            verbosity_level: LevelFilter::Warn,
            reconstruction: ReconstructionOptions::default(),
        }
    }
}

impl Options {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration `{}`", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid configuration `{}`", path.display()))
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Command line flags win over the configuration file.
    pub fn apply(&mut self, config: &GeneralConfig) {
        if config.verbose {
            self.verbosity_level = LevelFilter::Debug;
        }
        if let Some(output) = &config.output {
            self.output_path = output.clone();
        }
        if let Some(prefix) = &config.label_prefix {
            self.reconstruction.label_prefix = prefix.clone();
        }
        let passes = &mut self.reconstruction;
        passes.fold_short_circuit &= !config.no_short_circuit;
        passes.fold_conditionals &= !config.no_conditionals;
        passes.recognize_for_loops &= !config.no_for_loops;
        passes.recognize_asserts &= !config.no_asserts;
        passes.inline_temporaries &= !config.no_inline;
        passes.recognize_string_switches &= !config.no_string_switches;
    }
}

/// General decompile options
#[derive(Args, Debug, Default)]
#[clap(next_help_heading = "General Options")]
pub struct GeneralConfig {
    /// Write the JSON results to this file instead of standard output
    #[clap(name = "output", long, short = 'o', global = true)]
    pub output: Option<String>,

    /// Log reconstruction progress to standard error
    #[clap(name = "verbose", long, short = 'v', global = true)]
    pub verbose: bool,

    /// Print the effective configuration as TOML and exit
    #[clap(name = "print-config", long, global = true)]
    pub print_config: bool,

    /// Prefix for generated loop and switch labels
    #[clap(name = "label-prefix", long, global = true)]
    pub label_prefix: Option<String>,

    /// Keep chained conditions as nested ifs
    #[clap(name = "no-short-circuit", long, global = true)]
    pub no_short_circuit: bool,

    /// Keep if/else assignments instead of conditional expressions
    #[clap(name = "no-conditionals", long, global = true)]
    pub no_conditionals: bool,

    /// Emit while loops instead of for loops
    #[clap(name = "no-for-loops", long, global = true)]
    pub no_for_loops: bool,

    /// Keep assertion guards as plain ifs
    #[clap(name = "no-asserts", long, global = true)]
    pub no_asserts: bool,

    /// Keep every materialised temporary
    #[clap(name = "no-inline", long, global = true)]
    pub no_inline: bool,

    /// Keep the two switches javac emits for a switch on a string
    #[clap(name = "no-string-switches", long, global = true)]
    pub no_string_switches: bool,
}
