// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::format::oplist::{DEFAULT_GROUP, OpList, SuperLayout};

fn read_layout(path: &Path) -> Result<SuperLayout> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read layout TOML: {path:?}"))?;
    let mut layout: SuperLayout = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse layout TOML: {path:?}"))?;

    // The holding group always exists on the device.
    layout.groups.entry(DEFAULT_GROUP.to_owned()).or_insert(0);

    layout
        .validate()
        .with_context(|| format!("Layout is invalid: {path:?}"))?;

    Ok(layout)
}

fn replay_subcommand(cli: &ReplayCli) -> Result<()> {
    let mut layout = read_layout(&cli.source)?;

    let data = fs::read_to_string(&cli.op_list)
        .with_context(|| format!("Failed to read op list: {:?}", cli.op_list))?;
    let op_list = data
        .parse::<OpList>()
        .with_context(|| format!("Failed to parse op list: {:?}", cli.op_list))?;

    layout
        .replay(&op_list)
        .with_context(|| format!("Failed to replay op list: {:?}", cli.op_list))?;

    info!(
        "Replayed {} operations without exceeding any group size",
        op_list.operations().count(),
    );

    if let Some(path) = &cli.target {
        let expected = read_layout(path)?;
        if layout != expected {
            bail!("Final layout does not match {path:?}:\n{layout:#?}");
        }

        info!("Final layout matches {path:?}");
    }

    if !cli.quiet {
        let data = toml_edit::ser::to_string_pretty(&layout)
            .context("Failed to serialize final layout")?;
        print!("{data}");
    }

    Ok(())
}

pub fn oplist_main(cli: &OpListCli) -> Result<()> {
    match &cli.command {
        OpListCommand::Replay(c) => replay_subcommand(c),
    }
}

/// Replay an op list against a super partition layout.
///
/// Every operation is applied in order and every group size is checked after
/// each step. The final layout is printed as TOML.
#[derive(Debug, Parser)]
struct ReplayCli {
    /// Path to the layout TOML before the op list is applied.
    #[arg(long, value_name = "FILE", value_parser)]
    source: PathBuf,

    /// Path to the op list.
    #[arg(long, value_name = "FILE", value_parser)]
    op_list: PathBuf,

    /// Path to the expected layout TOML after the op list is applied.
    #[arg(long, value_name = "FILE", value_parser)]
    target: Option<PathBuf>,

    /// Don't print the final layout.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum OpListCommand {
    Replay(ReplayCli),
}

/// Inspect dynamic partition op lists.
#[derive(Debug, Parser)]
pub struct OpListCli {
    #[command(subcommand)]
    command: OpListCommand,
}
