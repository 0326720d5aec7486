/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod blockmap;
pub mod compression;
pub mod fstab;
pub mod oplist;
pub mod rangeset;
pub mod sparse;
pub mod transfer;
