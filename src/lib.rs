// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

pub mod backend;
pub mod bits;
pub mod core;
pub mod dmi;
pub mod error;
pub mod retry;
pub mod sim;
pub mod trace;
