// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Optional device-specific additions to the install script.

use anyhow::Result;

use crate::{config::Config, output::OutputSink, plan::block::BlockDifference, script::ScriptSink};

/// Context passed to every hook.
pub struct HookContext<'a> {
    pub config: &'a Config,
    pub script: &'a mut dyn ScriptSink,
    pub output: &'a mut dyn OutputSink,
}

/// Device-specific extension points. Every method has a no-op default, so an
/// implementation only needs to override what it uses.
pub trait DeviceHooks {
    /// Called before anything else in a full install script.
    fn full_ota_assertions(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called after the assertions, before any partition is written.
    fn full_ota_install_begin(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Additional non-dynamic partitions to write in a full install.
    fn full_ota_block_differences(&self, _config: &Config) -> Result<Vec<BlockDifference>> {
        Ok(vec![])
    }

    /// Called after every partition has been written.
    fn full_ota_install_end(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn incremental_ota_assertions(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called before the source partitions are verified.
    fn incremental_ota_verify_begin(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn incremental_ota_verify_end(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn incremental_ota_install_begin(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Additional non-dynamic partitions to patch in an incremental install.
    fn incremental_ota_block_differences(
        &self,
        _config: &Config,
    ) -> Result<Vec<BlockDifference>> {
        Ok(vec![])
    }

    fn incremental_ota_install_end(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Hooks for devices without any customizations.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDeviceHooks;

impl DeviceHooks for NoDeviceHooks {}
