/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod block;
pub mod blockimgdiff;
pub mod dynamic;
