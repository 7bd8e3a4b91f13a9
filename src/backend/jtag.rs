// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use bitvec::prelude::*;
use log::{debug, info};

use crate::backend::bitbang::RemoteBitbang;
use crate::backend::ftdi::{self, FtdiCable};
use crate::bits::{BitReader, ScanBits};
use crate::dmi::{Backend, DMI_SCAN_BITS, DmiOp, DmiReply, DmiRequest};
use crate::error::DebugError;
use crate::log_and_return;

pub const DEFAULT_CABLE: &str = "DigilentHS1";

/// Instruction register length of the FPGA TAP the debug module sits behind
pub const IR_LENGTH: usize = 6;

/// Types implementing this trait give TAP level access to a JTAG chain. All operations start
/// and finish in Run-Test/Idle.
pub trait JtagTap
{
	/// Force the TAP through Test-Logic-Reset and park it in Run-Test/Idle
	fn tap_reset(&mut self) -> Result<(), DebugError>;
	/// Shift `bits` into the instruction register, returning what was shifted out
	fn shift_ir(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>;
	/// Shift `bits` into the currently selected data register, returning what was shifted out
	fn shift_dr(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>;
}

impl<T: JtagTap + ?Sized> JtagTap for Box<T>
{
	fn tap_reset(&mut self) -> Result<(), DebugError>
	{
		(**self).tap_reset()
	}

	fn shift_ir(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		(**self).shift_ir(bits)
	}

	fn shift_dr(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		(**self).shift_dr(bits)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRegister
{
	pub name: String,
	pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction
{
	pub name: String,
	pub opcode: ScanBits,
	pub data_register: String,
}

/// A manually described part on the JTAG chain: its IR length, and the data registers and
/// instructions that we know how to use on it
#[derive(Debug, Clone)]
pub struct JtagPart
{
	ir_length: usize,
	registers: Vec<DataRegister>,
	instructions: Vec<Instruction>,
}

impl JtagPart
{
	/// Describe a part with only the mandatory BYPASS instruction and register
	pub fn manual(ir_length: usize) -> Self
	{
		let mut part = Self {
			ir_length,
			registers: vec![DataRegister {
				name: "BR".into(),
				length: 1,
			}],
			instructions: Vec::new(),
		};
		part.instructions.push(Instruction {
			name: "BYPASS".into(),
			opcode: bitvec![u8, Lsb0; 1; ir_length],
			data_register: "BR".into(),
		});
		part
	}

	pub fn ir_length(&self) -> usize
	{
		self.ir_length
	}

	pub fn data_register_define(&mut self, name: &str, length: usize) -> Result<(), DebugError>
	{
		if self.register(name).is_some() {
			return Err(DebugError::JtagSetup(format!("data register {} already defined", name)));
		}
		if length == 0 {
			return Err(DebugError::JtagSetup(format!("data register {} has no bits", name)));
		}
		self.registers.push(DataRegister {
			name: name.into(),
			length,
		});
		Ok(())
	}

	/// Define an instruction from its opcode written out MSB first, e.g. `"000011"`
	pub fn instruction_define(&mut self, name: &str, opcode: &str, data_register: &str) -> Result<(), DebugError>
	{
		if opcode.len() != self.ir_length {
			return Err(DebugError::JtagSetup(format!(
				"instruction {} opcode '{}' is not {} bits long",
				name, opcode, self.ir_length
			)));
		}
		if self.register(data_register).is_none() {
			return Err(DebugError::JtagSetup(format!(
				"instruction {} refers to unknown data register {}",
				name, data_register
			)));
		}
		let mut bits = ScanBits::with_capacity(self.ir_length);
		for digit in opcode.chars().rev() {
			match digit {
				'0' => bits.push(false),
				'1' => bits.push(true),
				_ => {
					return Err(DebugError::JtagSetup(format!(
						"instruction {} opcode '{}' is not a binary string",
						name, opcode
					)));
				},
			}
		}
		self.instructions.retain(|instruction| instruction.name != name);
		self.instructions.push(Instruction {
			name: name.into(),
			opcode: bits,
			data_register: data_register.into(),
		});
		Ok(())
	}

	pub fn instruction(&self, name: &str) -> Option<&Instruction>
	{
		self.instructions.iter().find(|instruction| instruction.name == name)
	}

	pub fn register(&self, name: &str) -> Option<&DataRegister>
	{
		self.registers.iter().find(|register| register.name == name)
	}

	/// The Microwatt FPGA TAP: IDCODE to identify the device, USER2 to reach the debug module
	pub fn microwatt() -> Result<Self, DebugError>
	{
		let mut part = Self::manual(IR_LENGTH);
		part.data_register_define("IDCODE_REG", 32)?;
		part.instruction_define("IDCODE", "001001", "IDCODE_REG")?;
		part.data_register_define("USER2_REG", DMI_SCAN_BITS)?;
		part.instruction_define("USER2", "000011", "USER2_REG")?;
		Ok(part)
	}
}

/// Talks DMI to the debug module through the USER2 data register of a JTAG TAP
pub struct JtagBackend<T>
{
	tap: T,
	part: JtagPart,
	active_length: usize,
	idcode: u32,
}

impl<T: JtagTap> JtagBackend<T>
{
	pub fn new(tap: T) -> Result<Self, DebugError>
	{
		let mut backend = Self {
			tap,
			part: JtagPart::microwatt()?,
			active_length: 0,
			idcode: 0,
		};
		backend.tap.tap_reset()?;

		backend.set_instruction("IDCODE")?;
		let idcode = backend.shift_data(&bitvec![u8, Lsb0; 0; backend.active_length])?;
		backend.idcode = BitReader::new(&idcode).take(32) as u32;
		info!("Found device ID: 0x{:08x}", backend.idcode);

		backend.set_instruction("USER2")?;
		Ok(backend)
	}

	pub fn idcode(&self) -> u32
	{
		self.idcode
	}

	pub fn set_instruction(&mut self, name: &str) -> Result<(), DebugError>
	{
		let instruction = match self.part.instruction(name) {
			Some(instruction) => instruction.clone(),
			None => {
				log_and_return!(DebugError::UnknownInstruction(name.into()));
			},
		};
		let length = self
			.part
			.register(&instruction.data_register)
			.map(|register| register.length)
			.ok_or_else(|| DebugError::UnknownInstruction(name.into()))?;
		debug!("JTAG instruction {} ({} bit data register)", name, length);
		self.tap.shift_ir(&instruction.opcode)?;
		self.active_length = length;
		Ok(())
	}

	fn shift_data(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		let out = self.tap.shift_dr(bits)?;
		if out.len() < bits.len() {
			return Err(DebugError::ShortReply {
				got: out.len(),
				expected: bits.len(),
			});
		}
		Ok(out)
	}
}

impl<T: JtagTap> Backend for JtagBackend<T>
{
	fn reset(&mut self) -> Result<(), DebugError>
	{
		// A TAP reset selects IDCODE, so put USER2 back afterwards
		self.tap.tap_reset()?;
		self.set_instruction("USER2")
	}

	fn command(&mut self, op: DmiOp, addr: u8, data: u64) -> Result<DmiReply, DebugError>
	{
		let scan = DmiRequest::new(op, addr, data).to_scan();
		let out = self.shift_data(scan.as_bits())?;
		Ok(DmiReply::from_scan(&mut BitReader::new(&out)))
	}
}

/// Open a JTAG cable from a `name[:params]` description
pub fn open_cable(target: Option<&str>) -> Result<Box<dyn JtagTap>, DebugError>
{
	let target = target.unwrap_or(DEFAULT_CABLE);
	let (cable, params) = match target.split_once(':') {
		Some((cable, params)) => (cable, Some(params)),
		None => (target, None),
	};
	debug!("Opening jtag backend cable '{}'", cable);

	match cable {
		"remote_bitbang" | "bitbang" => Ok(Box::new(RemoteBitbang::connect(params)?)),
		_ => match ftdi::cable_kind(cable) {
			Some(kind) => Ok(Box::new(FtdiCable::open(kind, params)?)),
			None => {
				log_and_return!(DebugError::UnsupportedCable(cable.into()));
			},
		},
	}
}
