// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Package-level driver that assembles the install script for a full or an
//! incremental update.

use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    config::Config,
    hooks::{DeviceHooks, HookContext},
    output::OutputSink,
    plan::{block::BlockDifference, dynamic::DynamicPartitionsDifference},
    script::{EdifyScript, ScriptSink},
    stream,
};

/// Name of the install script artifact.
pub const SCRIPT_NAME: &str = "updater-script";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PackageKind {
    /// Every partition is written unconditionally.
    #[default]
    Full,
    /// Partitions are patched from a verified source build.
    Incremental,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PackageOptions {
    pub kind: PackageKind,
    /// Verify every partition after it has been written.
    pub verify: bool,
}

fn hook_context<'a>(
    config: &'a Config,
    script: &'a mut EdifyScript,
    output: &'a mut dyn OutputSink,
) -> HookContext<'a> {
    HookContext {
        config,
        script,
        output,
    }
}

/// Write the install script and every artifact it references to `output`.
/// The script is also returned.
pub fn write_package(
    config: &Config,
    options: PackageOptions,
    hooks: &dyn DeviceHooks,
    dynamic: &DynamicPartitionsDifference<BlockDifference>,
    output: &mut dyn OutputSink,
    cancel_signal: &AtomicBool,
) -> Result<EdifyScript> {
    let mut script = EdifyScript::new();

    let write = match options.kind {
        PackageKind::Full => write_full,
        PackageKind::Incremental => write_incremental,
    };
    write(config, options, hooks, dynamic, &mut script, output, cancel_signal)?;

    output
        .write(SCRIPT_NAME, &script.to_bytes(), false)
        .with_context(|| format!("Failed to write {SCRIPT_NAME}"))?;

    info!(
        "Wrote {:?} package with {} script lines",
        options.kind,
        script.lines().len(),
    );

    Ok(script)
}

fn write_full(
    config: &Config,
    options: PackageOptions,
    hooks: &dyn DeviceHooks,
    dynamic: &DynamicPartitionsDifference<BlockDifference>,
    script: &mut EdifyScript,
    output: &mut dyn OutputSink,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    hooks
        .full_ota_assertions(&mut hook_context(config, script, &mut *output))
        .context("Device assertions hook failed")?;
    hooks
        .full_ota_install_begin(&mut hook_context(config, script, &mut *output))
        .context("Install begin hook failed")?;

    let extra_diffs = hooks
        .full_ota_block_differences(config)
        .context("Failed to get additional partitions from hooks")?;

    stream::check_cancel(cancel_signal)?;

    dynamic
        .write_script(script, output, options.verify)
        .context("Failed to write dynamic partitions update")?;

    for diff in &extra_diffs {
        stream::check_cancel(cancel_signal)?;

        diff.write_script(script, output, None, options.verify)
            .with_context(|| format!("Failed to write {} update", diff.partition()))?;
    }

    hooks
        .full_ota_install_end(&mut hook_context(config, script, &mut *output))
        .context("Install end hook failed")?;

    Ok(())
}

fn write_incremental(
    config: &Config,
    options: PackageOptions,
    hooks: &dyn DeviceHooks,
    dynamic: &DynamicPartitionsDifference<BlockDifference>,
    script: &mut EdifyScript,
    output: &mut dyn OutputSink,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    hooks
        .incremental_ota_assertions(&mut hook_context(config, script, &mut *output))
        .context("Device assertions hook failed")?;

    let extra_diffs = hooks
        .incremental_ota_block_differences(config)
        .context("Failed to get additional partitions from hooks")?;

    script.print("Verifying current system...");
    hooks
        .incremental_ota_verify_begin(&mut hook_context(config, script, &mut *output))
        .context("Verify begin hook failed")?;

    let all_diffs = dynamic
        .partition_updates()
        .iter()
        .map(|u| &u.block_difference)
        .chain(&extra_diffs);

    for diff in all_diffs {
        stream::check_cancel(cancel_signal)?;

        diff.write_verify_script(script, true)
            .with_context(|| format!("Failed to write {} verification", diff.partition()))?;
    }

    hooks
        .incremental_ota_verify_end(&mut hook_context(config, script, &mut *output))
        .context("Verify end hook failed")?;

    script.comment("---- start making changes here ----");

    hooks
        .incremental_ota_install_begin(&mut hook_context(config, script, &mut *output))
        .context("Install begin hook failed")?;

    dynamic
        .write_script(script, output, options.verify)
        .context("Failed to write dynamic partitions update")?;

    for diff in &extra_diffs {
        stream::check_cancel(cancel_signal)?;

        diff.write_script(script, output, None, options.verify)
            .with_context(|| format!("Failed to write {} update", diff.partition()))?;
    }

    hooks
        .incremental_ota_install_end(&mut hook_context(config, script, &mut *output))
        .context("Install end hook failed")?;

    Ok(())
}
