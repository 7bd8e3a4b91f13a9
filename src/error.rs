// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Module for error handling code.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DebugError
{
	#[error("Invalid target '{target}': {reason}")]
	BadTarget
	{
		target: String,
		reason: String,
	},

	#[error("Unknown host '{0}'")]
	UnknownHost(String),

	#[error("Connection to '{host}' failed")]
	ConnectError
	{
		#[source]
		source: io::Error,

		/// The `host:port` pair that the connection was attempted against
		host: String,
	},

	#[error("Debug link closed by the remote end")]
	Disconnected,

	#[error("Short reply from debug module: got {got} bytes, expected {expected}")]
	ShortReply
	{
		got: usize,
		expected: usize,
	},

	#[error("Debug module still busy after {polls} polls")]
	RetryLimit
	{
		polls: u64,
	},

	#[error("Debug module still busy after {0:?}")]
	RetryTimeout(Duration),

	#[error("Unknown JTAG cable '{0}'")]
	UnsupportedCable(String),

	#[error("No USB device found for JTAG cable '{0}'")]
	CableNotFound(String),

	#[error("USB failure while {action}")]
	Usb
	{
		action: &'static str,
		#[source]
		source: io::Error,
	},

	#[error("JTAG setup failed: {0}")]
	JtagSetup(String),

	#[error("Unknown JTAG instruction '{0}'")]
	UnknownInstruction(String),

	#[error("Transport I/O failure")]
	Io(#[from] io::Error),
}

#[macro_export]
macro_rules! log_and_return
{
	($err:expr) => {
		let err = $err;
		log::error!("{}", err);
		return Err(err.into());
	}
}
