// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Software model of the Microwatt debug module registers.
//!
//! The core itself is not simulated: it never runs on its own, but can be stopped, started,
//! reset and single stepped. A step advances NIA by one instruction and records a completed
//! entry in the execution log.

use log::{debug, info, warn};

use crate::dmi::{CoreCtrl, CoreStat, LOG_STOP, WB_CTRL_AUTOINC, regs};
use crate::sim::dtm::DebugModule;
use crate::trace::{LOG_ENTRY_WORDS, LogEntry};

/// MSR value after a core reset: 64-bit mode, little endian
pub const MSR_RESET: u64 = 0x8000_0000_0000_0001;
/// `attn`, which stops the core for good
pub const ATTN_INSN: u32 = 0x0000_0200;

const GSPR_COUNT: usize = 64;
const WB_CTRL_MASK: u64 = 0x7ff;
const LOG_CURSOR_MASK: u64 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig
{
	/// Size of the execution log ring in entries, a power of two
	pub log_entries: u64,
	/// Bytes of Wishbone memory, from address 0
	pub mem_size: usize,
	pub reset_vector: u64,
}

impl Default for SimConfig
{
	fn default() -> Self
	{
		Self {
			log_entries: 256,
			mem_size: 1024 * 1024,
			reset_vector: 0,
		}
	}
}

pub struct SimDebugModule
{
	config: SimConfig,
	stat: CoreStat,
	nia: u64,
	msr: u64,
	gspr: [u64; GSPR_COUNT],
	gspr_index: usize,
	memory: Vec<u64>,
	wb_addr: u64,
	wb_ctrl: u64,
	log: Vec<u64>,
	log_write_ptr: u64,
	log_stopped: bool,
	log_cursor: u64,
	quit: bool,
}

impl SimDebugModule
{
	pub fn new(config: SimConfig) -> Self
	{
		// A ring needs at least one entry and the size inference needs a power of two
		let log_entries = config.log_entries.max(1).next_power_of_two();
		let config = SimConfig {
			log_entries,
			..config
		};
		Self {
			config,
			stat: CoreStat::none(),
			nia: config.reset_vector,
			msr: MSR_RESET,
			gspr: [0; GSPR_COUNT],
			gspr_index: 0,
			memory: vec![0; config.mem_size.div_ceil(8)],
			wb_addr: 0,
			wb_ctrl: WB_CTRL_MASK,
			log: vec![0; log_entries as usize * LOG_ENTRY_WORDS],
			log_write_ptr: 0,
			log_stopped: true,
			log_cursor: 0,
			quit: false,
		}
	}

	pub fn config(&self) -> &SimConfig
	{
		&self.config
	}

	pub fn stat(&self) -> CoreStat
	{
		self.stat
	}

	pub fn nia(&self) -> u64
	{
		self.nia
	}

	pub fn set_gspr(&mut self, index: usize, value: u64)
	{
		self.gspr[index % GSPR_COUNT] = value;
	}

	pub fn log_capturing(&self) -> bool
	{
		!self.log_stopped
	}

	/// Copy `bytes` into memory at `addr` as little endian words
	pub fn load(&mut self, addr: u64, bytes: &[u8])
	{
		for (offset, byte) in bytes.iter().enumerate() {
			let addr = addr + offset as u64;
			if let Some(word) = self.memory.get_mut((addr / 8) as usize) {
				let shift = (addr % 8) * 8;
				*word = (*word & !(0xff << shift)) | ((*byte as u64) << shift);
			}
		}
	}

	pub fn read_word(&self, addr: u64) -> Option<u64>
	{
		self.memory.get((addr / 8) as usize).copied()
	}

	fn byte_lanes(&self) -> u64
	{
		(0..8)
			.filter(|lane| self.wb_ctrl & (1 << lane) != 0)
			.fold(0, |mask, lane| mask | (0xff << (lane * 8)))
	}

	fn advance_wb_addr(&mut self)
	{
		if self.wb_ctrl & WB_CTRL_AUTOINC != 0 {
			self.wb_addr = self.wb_addr.wrapping_add(8);
		}
	}

	fn wb_read(&mut self) -> u64
	{
		let data = match self.read_word(self.wb_addr) {
			Some(word) => word & self.byte_lanes(),
			None => {
				warn!("Wishbone read from unmapped address {:016x}", self.wb_addr);
				0
			},
		};
		self.advance_wb_addr();
		data
	}

	fn wb_write(&mut self, data: u64)
	{
		let lanes = self.byte_lanes();
		match self.memory.get_mut((self.wb_addr / 8) as usize) {
			Some(word) => *word = (*word & !lanes) | (data & lanes),
			None => warn!("Wishbone write to unmapped address {:016x}", self.wb_addr),
		}
		self.advance_wb_addr();
	}

	fn record(&mut self, entry: LogEntry)
	{
		if self.log_stopped {
			return;
		}
		let base = (self.log_write_ptr as usize) * LOG_ENTRY_WORDS;
		self.log[base..base + LOG_ENTRY_WORDS].copy_from_slice(&entry.to_words());
		self.log_write_ptr = (self.log_write_ptr + 1) % self.config.log_entries;
	}

	fn step(&mut self)
	{
		if !self.stat.contains(CoreStat::Stopped) {
			debug!("Ignoring step of a running core");
			return;
		}
		if self.stat.contains(CoreStat::Term) {
			return;
		}
		let insn = match self.read_word(self.nia) {
			Some(word) => (word >> ((self.nia & 4) * 8)) as u32,
			None => 0,
		};
		self.record(LogEntry::completed(self.nia, insn));
		if insn == ATTN_INSN {
			info!("attn at {:016x}, core terminated", self.nia);
			self.stat |= CoreStat::Term;
			return;
		}
		self.nia = self.nia.wrapping_add(4);
	}

	fn core_ctrl(&mut self, ctrl: CoreCtrl)
	{
		if ctrl.contains(CoreCtrl::Stop) {
			self.stat |= CoreStat::Stopping | CoreStat::Stopped;
		}
		if ctrl.contains(CoreCtrl::Reset) {
			self.nia = self.config.reset_vector;
			self.msr = MSR_RESET;
			self.stat &= !CoreStat::Term;
		}
		if ctrl.contains(CoreCtrl::IcReset) {
			debug!("icache reset");
		}
		if ctrl.contains(CoreCtrl::Step) {
			self.step();
		}
		if ctrl.contains(CoreCtrl::Start) {
			self.stat = CoreStat::none();
		}
	}

	/// LOG_ADDR as read back: the write pointer with the ring size bit above it, then the stop
	/// bit and read cursor
	fn log_addr(&self) -> u64
	{
		let stop = if self.log_stopped {
			LOG_STOP
		} else {
			0
		};
		((self.config.log_entries | self.log_write_ptr) << 32) | stop | self.log_cursor
	}

	fn set_log_addr(&mut self, data: u64)
	{
		self.log_stopped = data & LOG_STOP != 0;
		self.log_cursor = (data & LOG_CURSOR_MASK) % self.log.len() as u64;
	}

	fn log_data(&mut self) -> u64
	{
		let data = self.log[self.log_cursor as usize];
		self.log_cursor = (self.log_cursor + 1) % self.log.len() as u64;
		data
	}
}

impl DebugModule for SimDebugModule
{
	fn dmi_read(&mut self, addr: u8) -> u64
	{
		match addr {
			regs::WB_ADDR => self.wb_addr,
			regs::WB_DATA => self.wb_read(),
			regs::WB_CTRL => self.wb_ctrl,
			regs::CORE_CTRL => 0,
			regs::CORE_STAT => self.stat.bits(),
			regs::CORE_NIA => self.nia,
			regs::CORE_MSR => self.msr,
			regs::GSPR_INDEX => self.gspr_index as u64,
			regs::GSPR_DATA => self.gspr[self.gspr_index],
			regs::LOG_ADDR => self.log_addr(),
			regs::LOG_DATA => self.log_data(),
			_ => {
				debug!("Read from unknown DMI register {:02x}", addr);
				0
			},
		}
	}

	fn dmi_write(&mut self, addr: u8, data: u64)
	{
		match addr {
			regs::WB_ADDR => self.wb_addr = data,
			regs::WB_DATA => self.wb_write(data),
			regs::WB_CTRL => self.wb_ctrl = data & WB_CTRL_MASK,
			regs::CORE_CTRL => self.core_ctrl(CoreCtrl::from(data)),
			regs::GSPR_INDEX => self.gspr_index = (data as usize) % GSPR_COUNT,
			regs::LOG_ADDR => self.set_log_addr(data),
			regs::SIM_QUIT => {
				info!("Terminate requested by debug client");
				self.quit = true;
			},
			_ => debug!("Write of {:016x} to read-only or unknown DMI register {:02x}", data, addr),
		}
	}

	fn terminate_requested(&self) -> bool
	{
		self.quit
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::dmi::WB_CTRL_DEFAULT;
	use crate::trace::LogGeometry;

	fn model() -> SimDebugModule
	{
		SimDebugModule::new(SimConfig {
			log_entries: 16,
			mem_size: 4096,
			reset_vector: 0x100,
		})
	}

	#[test]
	fn stop_start()
	{
		let mut model = model();
		assert_eq!(model.dmi_read(regs::CORE_STAT), 0);
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Stop.bits());
		assert_eq!(model.dmi_read(regs::CORE_STAT), 0b011);
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Start.bits());
		assert_eq!(model.dmi_read(regs::CORE_STAT), 0);
	}

	#[test]
	fn step_only_moves_a_stopped_core()
	{
		let mut model = model();
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Step.bits());
		assert_eq!(model.nia(), 0x100);
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Stop.bits());
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Step.bits());
		assert_eq!(model.nia(), 0x104);
	}

	#[test]
	fn attn_terminates()
	{
		let mut model = model();
		model.load(0x100, &ATTN_INSN.to_le_bytes());
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Stop.bits());
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Step.bits());
		assert_eq!(model.dmi_read(regs::CORE_STAT), 0b111);
		assert_eq!(model.nia(), 0x100);
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Reset.bits());
		assert_eq!(model.dmi_read(regs::CORE_STAT), 0b011);
		assert_eq!(model.dmi_read(regs::CORE_MSR), MSR_RESET);
	}

	#[test]
	fn wishbone_auto_increment_and_lanes()
	{
		let mut model = model();
		model.dmi_write(regs::WB_CTRL, WB_CTRL_DEFAULT);
		model.dmi_write(regs::WB_ADDR, 0x10);
		model.dmi_write(regs::WB_DATA, 0x1111);
		model.dmi_write(regs::WB_DATA, 0x2222);
		assert_eq!(model.dmi_read(regs::WB_ADDR), 0x20);
		assert_eq!(model.read_word(0x18), Some(0x2222));

		// Low four lanes only, no increment
		model.dmi_write(regs::WB_CTRL, 0x0f);
		model.dmi_write(regs::WB_ADDR, 0x10);
		model.dmi_write(regs::WB_DATA, u64::MAX);
		assert_eq!(model.read_word(0x10), Some(0xffff_ffff));
		assert_eq!(model.dmi_read(regs::WB_ADDR), 0x10);
	}

	#[test]
	fn gsprs()
	{
		let mut model = model();
		model.set_gspr(32, 0xabcd);
		model.dmi_write(regs::GSPR_INDEX, 32);
		assert_eq!(model.dmi_read(regs::GSPR_DATA), 0xabcd);
	}

	#[test]
	fn log_ring_reports_its_size()
	{
		let mut model = model();
		model.dmi_write(regs::LOG_ADDR, 0);
		assert!(model.log_capturing());
		model.dmi_write(regs::CORE_CTRL, CoreCtrl::Stop.bits());
		for _ in 0..3 {
			model.dmi_write(regs::CORE_CTRL, CoreCtrl::Step.bits());
		}
		model.dmi_write(regs::LOG_ADDR, LOG_STOP);
		let geometry = LogGeometry::from_log_addr(model.dmi_read(regs::LOG_ADDR));
		assert_eq!(geometry.entries, 16);
		assert_eq!(geometry.write_ptr, 3);

		// Seek to entry 1 and read its fetch address back
		model.dmi_write(regs::LOG_ADDR, LOG_STOP | (1 << 2));
		let words: Vec<u64> = (0..LOG_ENTRY_WORDS).map(|_| model.dmi_read(regs::LOG_DATA)).collect();
		let entry = LogEntry::from_words([words[0], words[1], words[2], words[3]]);
		assert_eq!(entry.nia(), 0x104);
	}

	#[test]
	fn quit_request()
	{
		let mut model = model();
		assert!(!model.terminate_requested());
		model.dmi_write(regs::SIM_QUIT, 0);
		assert!(model.terminate_requested());
	}
}
