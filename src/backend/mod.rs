// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

pub mod bitbang;
pub mod ftdi;
pub mod jtag;
pub mod socket;

use std::fmt::{Display, Formatter};

use clap::ValueEnum;

use crate::dmi::Backend;
use crate::error::DebugError;

pub use self::jtag::JtagBackend;
pub use self::socket::SocketBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind
{
	/// Simulator debug socket
	Sim,
	/// JTAG cable
	Jtag,
}

impl Display for BackendKind
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		match self {
			Self::Sim => write!(f, "sim"),
			Self::Jtag => write!(f, "jtag"),
		}
	}
}

/// Open and initialise a backend of the given kind. `target` is a `host:port` pair for the
/// simulator, or a `cable[:params]` description for JTAG.
pub fn open(kind: BackendKind, target: Option<&str>) -> Result<Box<dyn Backend>, DebugError>
{
	match kind {
		BackendKind::Sim => Ok(Box::new(SocketBackend::connect(target)?)),
		BackendKind::Jtag => {
			let cable = jtag::open_cable(target)?;
			Ok(Box::new(JtagBackend::new(cable)?))
		},
	}
}
