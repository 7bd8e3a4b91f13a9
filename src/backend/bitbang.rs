// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! JTAG cable speaking the remote-bitbang protocol over TCP.
//!
//! Each byte sent sets the TCK/TMS/TDI pins (`'0'..='7'`), drives the reset lines (`'r'..='u'`),
//! asks for the current TDO value (`'R'`, answered with `'0'` or `'1'`) or ends the session
//! (`'Q'`). Pin writes are queued up and only sent when a TDO sample is needed, so a whole scan
//! costs a single round trip.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use bitvec::prelude::*;
use log::{debug, trace};

use crate::backend::jtag::JtagTap;
use crate::backend::socket::{DEFAULT_SIM_HOST, DEFAULT_SIM_PORT, parse_target};
use crate::bits::ScanBits;
use crate::error::DebugError;

pub const READ_TDO: u8 = b'R';
pub const QUIT: u8 = b'Q';

/// Encode a pin write command
pub fn pin_command(tck: bool, tms: bool, tdi: bool) -> u8
{
	b'0' + ((tck as u8) << 2 | (tms as u8) << 1 | tdi as u8)
}

/// Encode a reset line command
pub fn reset_command(trst: bool, srst: bool) -> u8
{
	b'r' + ((trst as u8) << 1 | srst as u8)
}

pub struct RemoteBitbang<S: Read + Write = TcpStream>
{
	stream: S,
	pending: Vec<u8>,
	samples: usize,
}

impl RemoteBitbang<TcpStream>
{
	/// Connect to a remote-bitbang server given as `host[:port]`
	pub fn connect(params: Option<&str>) -> Result<Self, DebugError>
	{
		let (host, port) = match params {
			Some(params) => parse_target(params)?,
			None => (DEFAULT_SIM_HOST.to_string(), DEFAULT_SIM_PORT),
		};
		debug!("Opening remote bitbang cable host '{}' port {}", host, port);

		let addrs: Vec<_> = (host.as_str(), port)
			.to_socket_addrs()
			.map_err(|_| DebugError::UnknownHost(host.clone()))?
			.collect();
		if addrs.is_empty() {
			return Err(DebugError::UnknownHost(host));
		}
		let stream = TcpStream::connect(&addrs[..]).map_err(|source| DebugError::ConnectError {
			source,
			host: format!("{}:{}", host, port),
		})?;
		stream.set_nodelay(true)?;
		Ok(Self::new(stream))
	}
}

impl<S: Read + Write> RemoteBitbang<S>
{
	pub fn new(stream: S) -> Self
	{
		Self {
			stream,
			pending: Vec::new(),
			samples: 0,
		}
	}

	/// One TCK cycle starting on a falling edge. TDO is sampled while TCK is low and TMS/TDI
	/// get latched by the TAP on the rising edge.
	fn clock(&mut self, tms: bool, tdi: bool, sample: bool)
	{
		self.pending.push(pin_command(false, tms, tdi));
		if sample {
			self.pending.push(READ_TDO);
			self.samples += 1;
		}
		self.pending.push(pin_command(true, tms, tdi));
	}

	fn write_tms(&mut self, sequence: &[bool])
	{
		for &tms in sequence {
			self.clock(tms, false, false);
		}
	}

	/// Send everything queued up and collect the TDO samples it asked for
	fn flush(&mut self) -> Result<ScanBits, DebugError>
	{
		trace!("bitbang send: {}", String::from_utf8_lossy(&self.pending));
		self.stream.write_all(&self.pending)?;
		self.stream.flush()?;
		self.pending.clear();

		let mut replies = vec![0u8; self.samples];
		let mut filled = 0;
		while filled < replies.len() {
			let count = self.stream.read(&mut replies[filled..])?;
			if count == 0 {
				return Err(DebugError::Disconnected);
			}
			filled += count;
		}
		self.samples = 0;

		let mut bits = ScanBits::with_capacity(replies.len());
		for reply in replies {
			match reply {
				b'0' => bits.push(false),
				b'1' => bits.push(true),
				other => {
					return Err(DebugError::JtagSetup(format!(
						"bad TDO sample 0x{:02x} from remote bitbang server",
						other
					)));
				},
			}
		}
		Ok(bits)
	}

	/// Shift a register from one of the Shift-xR states, leaving on the last bit and parking
	/// back in Run-Test/Idle
	fn shift(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		let last = bits.len().saturating_sub(1);
		for (index, bit) in bits.iter().by_vals().enumerate() {
			self.clock(index == last, bit, true);
		}
		// Exit1 -> Update -> Run-Test/Idle
		self.write_tms(&[true, false]);
		self.flush()
	}

	/// Drive the TRST and SRST lines
	pub fn set_resets(&mut self, trst: bool, srst: bool) -> Result<(), DebugError>
	{
		self.pending.push(reset_command(trst, srst));
		self.flush()?;
		Ok(())
	}
}

impl<S: Read + Write> JtagTap for RemoteBitbang<S>
{
	fn tap_reset(&mut self) -> Result<(), DebugError>
	{
		self.pending.push(reset_command(false, false));
		// Five clocks with TMS high reach Test-Logic-Reset from anywhere
		self.write_tms(&[true, true, true, true, true, false]);
		self.flush()?;
		Ok(())
	}

	fn shift_ir(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		self.write_tms(&[true, true, false, false]);
		self.shift(bits)
	}

	fn shift_dr(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		self.write_tms(&[true, false, false]);
		self.shift(bits)
	}
}

impl<S: Read + Write> Drop for RemoteBitbang<S>
{
	fn drop(&mut self)
	{
		self.pending.clear();
		self.samples = 0;
		let _ = self.stream.write_all(&[QUIT]);
	}
}
