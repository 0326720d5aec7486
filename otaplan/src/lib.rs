/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Block-based OTA update planning. The semver versioning covers the CLI
//! only. All Rust APIs can change at any time, even in patch releases.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod config;
pub mod diff;
pub mod format;
pub mod hooks;
pub mod image;
pub mod ota;
pub mod output;
pub mod plan;
pub mod script;
pub mod stream;
pub mod util;
