// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Debug Module Interface command layer.
//!
//! A DMI transaction is a single 74-bit scan: a 2 bit opcode, 64 bits of data and an 8 bit
//! register address, in that order starting from bit 0. The reply comes back in the same bit
//! positions with the opcode field replaced by a status code.

use bitmask_enum::bitmask;

use crate::bits::{BitReader, BitWriter, ScanBits};
use crate::error::DebugError;

/// Total length of a DMI scan in bits
pub const DMI_SCAN_BITS: usize = 74;
pub const DMI_OP_BITS: usize = 2;
pub const DMI_DATA_BITS: usize = 64;
pub const DMI_ADDR_BITS: usize = 8;

/// Register addresses in the debug module's DMI space
pub mod regs
{
	pub const WB_ADDR: u8 = 0x00;
	pub const WB_DATA: u8 = 0x01;
	pub const WB_CTRL: u8 = 0x02;

	pub const CORE_CTRL: u8 = 0x10;
	pub const CORE_STAT: u8 = 0x11;
	pub const CORE_NIA: u8 = 0x12;
	pub const CORE_MSR: u8 = 0x13;

	pub const GSPR_INDEX: u8 = 0x14;
	pub const GSPR_DATA: u8 = 0x15;

	pub const LOG_ADDR: u8 = 0x16;
	pub const LOG_DATA: u8 = 0x17;

	/// Writing here asks a simulator to terminate
	pub const SIM_QUIT: u8 = 0xff;
}

/// Value written to WB_CTRL ahead of any Wishbone access: all byte lanes, auto-increment on
pub const WB_CTRL_DEFAULT: u64 = 0x7ff;
pub const WB_CTRL_AUTOINC: u64 = 1 << 10;

/// Stop bit of the LOG_ADDR register
pub const LOG_STOP: u64 = 0x8000_0000;

#[bitmask(u64)]
pub enum CoreCtrl
{
	Stop = 1 << 0,
	Reset = 1 << 1,
	IcReset = 1 << 2,
	Step = 1 << 3,
	Start = 1 << 4,
}

#[bitmask(u64)]
pub enum CoreStat
{
	Stopping = 1 << 0,
	Stopped = 1 << 1,
	Term = 1 << 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiOp
{
	Nop = 0,
	Read = 1,
	Write = 2,
}

impl DmiOp
{
	pub fn from_bits(bits: u8) -> Option<Self>
	{
		match bits & 3 {
			0 => Some(Self::Nop),
			1 => Some(Self::Read),
			2 => Some(Self::Write),
			_ => None,
		}
	}
}

/// Status codes found in the opcode position of a reply
pub mod status
{
	pub const OK: u8 = 0;
	pub const BUSY: u8 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmiRequest
{
	pub op: DmiOp,
	pub addr: u8,
	pub data: u64,
}

impl DmiRequest
{
	pub fn new(op: DmiOp, addr: u8, data: u64) -> Self
	{
		Self {
			op,
			addr,
			data,
		}
	}

	pub fn to_scan(&self) -> BitWriter
	{
		let mut writer = BitWriter::new();
		writer
			.push(self.op as u64, DMI_OP_BITS)
			.push(self.data, DMI_DATA_BITS)
			.push(self.addr as u64, DMI_ADDR_BITS);
		writer
	}

	/// Decode a request scan. Returns `None` if the opcode field holds the reserved value 3
	pub fn from_scan(reader: &mut BitReader<'_>) -> Option<Self>
	{
		let op = DmiOp::from_bits(reader.take(DMI_OP_BITS) as u8)?;
		let data = reader.take(DMI_DATA_BITS);
		let addr = reader.take(DMI_ADDR_BITS) as u8;
		Some(Self::new(op, addr, data))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmiReply
{
	/// The raw 2 bit status code
	pub status: u8,
	pub data: u64,
}

impl DmiReply
{
	pub fn from_scan(reader: &mut BitReader<'_>) -> Self
	{
		let status = reader.take(DMI_OP_BITS) as u8;
		let data = reader.take(DMI_DATA_BITS);
		Self {
			status,
			data,
		}
	}

	pub fn to_scan(&self, addr: u8) -> ScanBits
	{
		let mut writer = BitWriter::new();
		writer
			.push(self.status as u64, DMI_OP_BITS)
			.push(self.data, DMI_DATA_BITS)
			.push(addr as u64, DMI_ADDR_BITS);
		writer.into_bits()
	}
}

/// Types implementing this trait carry DMI commands to a debug module and hand back its reply.
/// Creating a backend value is what initialises its link.
pub trait Backend
{
	/// Reset the debug link itself (not the core behind it)
	fn reset(&mut self) -> Result<(), DebugError>;

	/// Perform one scan. `Ok` holds whatever status the debug module replied with,
	/// while transport level failures are reported as errors.
	fn command(&mut self, op: DmiOp, addr: u8, data: u64) -> Result<DmiReply, DebugError>;
}

impl<B: Backend + ?Sized> Backend for Box<B>
{
	fn reset(&mut self) -> Result<(), DebugError>
	{
		(**self).reset()
	}

	fn command(&mut self, op: DmiOp, addr: u8, data: u64) -> Result<DmiReply, DebugError>
	{
		(**self).command(op, addr, data)
	}
}
