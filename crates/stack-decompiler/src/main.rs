// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::*;
use colored::Colorize;
use decompile::execute;
use options::GeneralConfig;

mod decompile;
mod options;

#[derive(Parser)]
#[clap(
    name = env!("CARGO_BIN_NAME"),
    about = "Reconstructs structured statement trees from stack-machine method bodies given as JSON",
    rename_all = "kebab-case",
    author,
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Args {
    /// JSON file with the classes and method bodies to decompile
    pub input: Option<PathBuf>,

    /// TOML configuration file
    #[clap(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// General options
    #[clap(flatten)]
    pub general_config: GeneralConfig,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let result = execute(
        args.input.as_deref(),
        args.config.as_deref(),
        args.general_config,
    )
    .await;

    if let Err(err) = result {
        let err = format!("{:?}", err);
        eprintln!("{}", err.bold().red());
        std::process::exit(1);
    }
}
