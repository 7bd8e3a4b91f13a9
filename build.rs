// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! This build script only exists so the Windows builds of the debug tools do not depend
//! on a separately installed Visual C runtime. It does nothing on other platforms.

fn main()
{
	static_vcruntime::metabuild();
}
