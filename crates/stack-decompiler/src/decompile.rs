// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use crate::options::{GeneralConfig, Options};
use anyhow::Context;
use colored::Colorize;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use stack_structurer::{
    reconstruct_method, DescriptorTypeLookup, MethodBody, ReconstructedMethod, ReconstructionError,
    ReconstructionOptions, SingleFlight, TypeLookup,
};
use simplelog::{Config, WriteLogger};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Input document: the classes to decompile plus the enum types and javac switch maps
/// their switches refer to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Batch {
    #[serde(default)]
    pub enums: BTreeMap<String, Vec<String>>,
    /// Keyed by `Owner.$SwitchMap$E`: the constant behind each stored switch key.
    #[serde(default)]
    pub switch_maps: BTreeMap<String, BTreeMap<i32, String>>,
    #[serde(default)]
    pub classes: Vec<ClassInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassInput {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassOutput {
    pub name: String,
    pub methods: Vec<MethodOutput>,
}

impl ClassOutput {
    pub fn failures(&self) -> usize {
        self.methods
            .iter()
            .filter(|method| matches!(method, MethodOutput::Failed { .. }))
            .count()
    }
}

/// A method either reconstructs completely or is reported as failed; the other methods
/// of its class are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodOutput {
    Reconstructed(ReconstructedMethod),
    Failed {
        name: String,
        descriptor: String,
        message: String,
        error: ReconstructionError,
    },
}

pub fn decompile_class(
    class: &ClassInput,
    types: &dyn TypeLookup,
    options: &ReconstructionOptions,
) -> ClassOutput {
    let methods = class
        .methods
        .iter()
        .map(|method| match reconstruct_method(method, types, options) {
            Ok(reconstructed) => {
                debug!(
                    "reconstructed {}.{}{}",
                    class.name, method.name, method.descriptor
                );
                MethodOutput::Reconstructed(reconstructed)
            }
            Err(error) => {
                warn!(
                    "cannot reconstruct {}.{}{}: {}",
                    class.name, method.name, method.descriptor, error
                );
                MethodOutput::Failed {
                    name: method.name.clone(),
                    descriptor: method.descriptor.clone(),
                    message: error.to_string(),
                    error,
                }
            }
        })
        .collect();
    ClassOutput {
        name: class.name.clone(),
        methods,
    }
}

/// Identity of a class entry: its name plus the full method contents. The `Debug`
/// rendering is used because JSON writes every non-finite constant as `null`.
type ClassKey = (String, String);

fn class_key(class: &ClassInput) -> ClassKey {
    (class.name.clone(), format!("{:?}", class.methods))
}

/// Decompiles every class on the blocking pool. The descriptor cache is shared by all
/// workers; identical class entries listed more than once are reconstructed a single
/// time, while entries that only share a name are each reconstructed.
pub async fn decompile_batch(
    batch: Batch,
    options: Arc<ReconstructionOptions>,
) -> anyhow::Result<Vec<Arc<ClassOutput>>> {
    let types = Arc::new(DescriptorTypeLookup::with_enums(batch.enums).with_switch_maps(batch.switch_maps));
    let cache: Arc<SingleFlight<ClassKey, Arc<ClassOutput>>> = Arc::new(SingleFlight::new());

    let tasks = batch.classes.into_iter().map(|class| {
        let types = types.clone();
        let cache = cache.clone();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            cache.get_or_compute(&class_key(&class), || {
                Arc::new(decompile_class(&class, types.as_ref(), &options))
            })
        })
    });
    let outputs = futures::future::try_join_all(tasks).await?;
    info!("decompiled {} distinct classes", cache.len());
    Ok(outputs)
}

pub fn load_batch(path: &Path) -> anyhow::Result<Batch> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read input `{}`", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("malformed input `{}`", path.display()))
}

pub fn load_options(config_path: Option<&Path>, general_config: &GeneralConfig) -> anyhow::Result<Options> {
    let mut options = match config_path {
        Some(path) => Options::from_toml_file(path)?,
        None => Options::default(),
    };
    options.apply(general_config);
    Ok(options)
}

pub async fn execute(
    input: Option<&Path>,
    config_path: Option<&Path>,
    general_config: GeneralConfig,
) -> anyhow::Result<()> {
    let options = load_options(config_path, &general_config)?;
    // A second initialisation only fails when a logger is already installed.
    let _ = WriteLogger::init(options.verbosity_level, Config::default(), std::io::stderr());
    debug!("{} version: {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    if general_config.print_config {
        print!("{}", options.to_toml()?);
        return Ok(());
    }

    let input = input.context("no input file given")?;
    let batch = load_batch(input)?;
    let outputs = decompile_batch(batch, Arc::new(options.reconstruction.clone())).await?;

    let failures: usize = outputs.iter().map(|class| class.failures()).sum();
    let json = serde_json::to_string_pretty(&outputs)?;
    if options.output_path.is_empty() {
        println!("{}", json);
    } else {
        std::fs::write(&options.output_path, json)
            .with_context(|| format!("cannot write output `{}`", options.output_path))?;
    }

    if failures > 0 {
        eprintln!(
            "{}",
            format!("{} method(s) could not be reconstructed", failures)
                .bold()
                .yellow()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_structurer::bytecode::{BasicBlock, Constant, StackOp, Terminator};

    const BATCH: &str = r#"{
        "classes": [
            {
                "name": "A",
                "methods": [
                    {
                        "name": "id",
                        "descriptor": "(I)I",
                        "is_static": true,
                        "locals": [{ "descriptor": "I" }],
                        "blocks": [{ "ops": [{ "load": 0 }], "terminator": "return" }]
                    },
                    {
                        "name": "bad",
                        "descriptor": "(Q)V",
                        "is_static": true,
                        "blocks": [{ "terminator": "return" }]
                    }
                ]
            },
            { "name": "A", "methods": [] }
        ]
    }"#;

    const ID: &str = r#"{
        "name": "id",
        "descriptor": "(I)I",
        "is_static": true,
        "locals": [{ "descriptor": "I" }],
        "blocks": [{ "ops": [{ "load": 0 }], "terminator": "return" }]
    }"#;

    #[tokio::test]
    async fn test_failed_method_does_not_affect_siblings() {
        let batch: Batch = serde_json::from_str(BATCH).unwrap();
        let outputs = decompile_batch(batch, Arc::new(ReconstructionOptions::default()))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[1].methods.is_empty());
        let methods = &outputs[0].methods;
        assert_eq!(methods.len(), 2);
        assert!(matches!(methods[0], MethodOutput::Reconstructed(_)));
        assert!(matches!(
            methods[1],
            MethodOutput::Failed {
                error: ReconstructionError::Unsupported(_),
                ..
            }
        ));
        assert_eq!(outputs[0].failures(), 1);
    }

    #[tokio::test]
    async fn test_same_name_different_bodies_are_kept_apart() {
        let id: MethodBody = serde_json::from_str(ID).unwrap();
        let mut other = id.clone();
        other.name = "other".to_string();
        let class = |methods: Vec<MethodBody>| ClassInput {
            name: "A".to_string(),
            methods,
        };
        let batch = Batch {
            classes: vec![class(vec![id.clone()]), class(vec![other]), class(vec![id])],
            ..Batch::default()
        };
        let outputs = decompile_batch(batch, Arc::new(ReconstructionOptions::default()))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(!Arc::ptr_eq(&outputs[0], &outputs[1]));
        assert!(Arc::ptr_eq(&outputs[0], &outputs[2]));
        let names = |output: &ClassOutput| {
            output
                .methods
                .iter()
                .map(|method| match method {
                    MethodOutput::Reconstructed(method) => method.name.clone(),
                    MethodOutput::Failed { name, .. } => name.clone(),
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&outputs[0]), vec!["id"]);
        assert_eq!(names(&outputs[1]), vec!["other"]);
    }

    #[test]
    fn test_non_finite_constants_give_distinct_keys() {
        let class = |value: f64| ClassInput {
            name: "A".to_string(),
            methods: vec![MethodBody {
                name: "f".to_string(),
                descriptor: "()D".to_string(),
                is_static: true,
                locals: vec![],
                blocks: vec![BasicBlock {
                    ops: vec![StackOp::Push(Constant::Double(value))],
                    terminator: Terminator::Return,
                }],
                exception_table: vec![],
            }],
        };
        assert_ne!(class_key(&class(f64::NAN)), class_key(&class(f64::INFINITY)));
        assert_eq!(class_key(&class(1.5)), class_key(&class(1.5)));
    }

    #[test]
    fn test_switch_maps_are_read() {
        let batch: Batch = serde_json::from_str(
            r#"{
                "enums": { "Color": ["RED", "GREEN", "BLUE"] },
                "switch_maps": { "Main$1.$SwitchMap$Color": { "1": "BLUE", "2": "RED" } }
            }"#,
        )
        .unwrap();
        let types = DescriptorTypeLookup::with_enums(batch.enums).with_switch_maps(batch.switch_maps);
        let map = types.switch_map("Main$1", "$SwitchMap$Color").unwrap();
        assert_eq!(map.get(&1).map(String::as_str), Some("BLUE"));
        assert_eq!(map.get(&2).map(String::as_str), Some("RED"));
        assert!(types.switch_map("Main$2", "$SwitchMap$Color").is_none());
    }

    #[test]
    fn test_output_is_tagged() {
        let batch: Batch = serde_json::from_str(BATCH).unwrap();
        let output = decompile_class(
            &batch.classes[0],
            &DescriptorTypeLookup::new(),
            &ReconstructionOptions::default(),
        );
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["methods"][0]["status"], "reconstructed");
        assert_eq!(json["methods"][1]["status"], "failed");
        assert_eq!(json["methods"][1]["name"], "bad");
    }
}
