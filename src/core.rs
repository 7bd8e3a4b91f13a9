// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Control of the core behind the debug module: run state, registers, memory and the execution
//! log. Every operation is one or more DMI round trips, nothing is cached on this side.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use color_eyre::eyre::{Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};

use crate::dmi::{Backend, CoreCtrl, CoreStat, LOG_STOP, WB_CTRL_DEFAULT, regs};
use crate::retry::{Dmi, RetryPolicy};
use crate::trace::LogGeometry;

/// Number of GSPRs reachable through GSPR_INDEX
pub const GSPR_COUNT: u64 = 64;

/// Names of the fast SPRs that follow the 32 GPRs in the GSPR file
const FAST_SPR_NAMES: [&str; 13] = [
	"lr", "ctr", "srr0", "srr1", "hsrr0", "hsrr1", "sprg0", "sprg1", "sprg2", "sprg3", "hsprg0", "hsprg1", "xer",
];

/// Display name of a GSPR index
pub fn gspr_name(index: u64) -> String
{
	if index <= 31 {
		format!("r{}", index)
	} else if let Some(name) = FAST_SPR_NAMES.get((index - 32) as usize) {
		(*name).into()
	} else {
		format!("gspr{}", index)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState
{
	Running,
	Stopping,
	Stopped,
	/// Stopped without the stop request still being held
	Restarting,
	Terminated,
	/// TERM set without STOPPED
	Inconsistent,
}

impl From<CoreStat> for CoreState
{
	fn from(stat: CoreStat) -> Self
	{
		if stat.contains(CoreStat::Stopped) {
			if !stat.contains(CoreStat::Stopping) {
				Self::Restarting
			} else if stat.contains(CoreStat::Term) {
				Self::Terminated
			} else {
				Self::Stopped
			}
		} else if stat.contains(CoreStat::Stopping) {
			Self::Stopping
		} else if stat.contains(CoreStat::Term) {
			Self::Inconsistent
		} else {
			Self::Running
		}
	}
}

impl Display for CoreState
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		let text = match self {
			Self::Running => "running",
			Self::Stopping => "stopping",
			Self::Stopped => "stopped",
			Self::Restarting => "stopped (restarting?)",
			Self::Terminated => "stopped (terminated)",
			Self::Inconsistent => "odd state (TERM but no STOP)",
		};
		write!(f, "{}", text)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreStatus
{
	pub stat: CoreStat,
	pub state: CoreState,
	pub nia: u64,
	pub msr: u64,
}

impl Display for CoreStatus
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		writeln!(f, "Core: {}", self.state)?;
		writeln!(f, " NIA: {:016x}", self.nia)?;
		write!(f, " MSR: {:016x}", self.msr)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome
{
	Stepped,
	NotStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemWord
{
	pub addr: u64,
	pub data: u64,
}

impl Display for MemWord
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		write!(f, "{:016x}: {:016x}", self.addr, self.data)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprValue
{
	pub index: u64,
	pub value: u64,
}

impl Display for GprValue
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		write!(f, "{}:\t{:016x}", gspr_name(self.index), self.value)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmiValue
{
	pub addr: u8,
	pub data: u64,
}

impl Display for DmiValue
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		write!(f, "{:02x}: {:016x}", self.addr, self.data)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStopInfo
{
	pub geometry: LogGeometry,
}

impl Display for LogStopInfo
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		write!(
			f,
			"Log size = {} entries, write ptr = {:x}",
			self.geometry.entries, self.geometry.write_ptr
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDumpInfo
{
	pub geometry: LogGeometry,
	/// LOG_ADDR as found before the dump, and as restored afterwards
	pub log_addr: u64,
}

impl Display for LogDumpInfo
{
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
	{
		writeln!(f, "Log size = {} entries", self.geometry.entries)?;
		write!(f, "{} done", self.geometry.bytes())
	}
}

/// A debug session against one core
pub struct DebugSession<B>
{
	dmi: Dmi<B>,
	show_progress: bool,
}

impl<B: Backend> DebugSession<B>
{
	pub fn new(backend: B) -> Self
	{
		Self::with_policy(backend, RetryPolicy::default())
	}

	pub fn with_policy(backend: B, policy: RetryPolicy) -> Self
	{
		Self {
			dmi: Dmi::with_policy(backend, policy),
			show_progress: false,
		}
	}

	/// Show progress bars for the long running transfers
	pub fn with_progress(mut self, show_progress: bool) -> Self
	{
		self.show_progress = show_progress;
		self
	}

	pub fn dmi(&mut self) -> &mut Dmi<B>
	{
		&mut self.dmi
	}

	pub fn into_backend(self) -> B
	{
		self.dmi.into_backend()
	}

	fn progress_bar(&self, length: u64) -> Result<ProgressBar>
	{
		if !self.show_progress {
			return Ok(ProgressBar::hidden());
		}
		Ok(ProgressBar::new(length).with_style(
			ProgressStyle::default_bar()
				.template(" {percent:>3}% |{bar:50}| {bytes}/{total_bytes} [{binary_bytes_per_sec} {elapsed}]")?,
		))
	}

	fn core_ctrl(&mut self, ctrl: CoreCtrl, what: &'static str) -> Result<()>
	{
		self.dmi.write(regs::CORE_CTRL, ctrl.bits()).wrap_err(what)
	}

	fn core_stat(&mut self) -> Result<CoreStat>
	{
		let stat = self.dmi.read(regs::CORE_STAT).wrap_err("reading core status")?;
		Ok(CoreStat::from(stat))
	}

	pub fn status(&mut self) -> Result<CoreStatus>
	{
		let stat = self.core_stat()?;
		let nia = self.dmi.read(regs::CORE_NIA).wrap_err("reading core NIA")?;
		let msr = self.dmi.read(regs::CORE_MSR).wrap_err("reading core MSR")?;
		debug!("Core status = 0x{:x}", stat.bits());
		Ok(CoreStatus {
			stat,
			state: CoreState::from(stat),
			nia,
			msr,
		})
	}

	pub fn stop(&mut self) -> Result<()>
	{
		self.core_ctrl(CoreCtrl::Stop, "stopping core")
	}

	pub fn start(&mut self) -> Result<()>
	{
		self.core_ctrl(CoreCtrl::Start, "starting core")
	}

	pub fn reset(&mut self) -> Result<()>
	{
		self.core_ctrl(CoreCtrl::Reset, "resetting core")
	}

	pub fn icache_reset(&mut self) -> Result<()>
	{
		self.core_ctrl(CoreCtrl::IcReset, "resetting icache")
	}

	/// Single step the core, which is only allowed while it is stopped
	pub fn step(&mut self) -> Result<StepOutcome>
	{
		if !self.core_stat()?.contains(CoreStat::Stopped) {
			return Ok(StepOutcome::NotStopped);
		}
		self.core_ctrl(CoreCtrl::Step, "stepping core")?;
		Ok(StepOutcome::Stepped)
	}

	/// Read `count` GSPRs starting at `reg`, clipped to the end of the register file
	pub fn gpr_read(&mut self, reg: u64, count: u64) -> Result<Vec<GprValue>>
	{
		let reg = reg & 0x3f;
		let count = count.min(GSPR_COUNT - reg);
		let mut values = Vec::with_capacity(count as usize);
		for index in reg..reg + count {
			self.dmi
				.write(regs::GSPR_INDEX, index)
				.wrap_err("setting GPR index")?;
			let value = self.dmi.read(regs::GSPR_DATA).wrap_err("reading GPR data")?;
			values.push(GprValue {
				index,
				value,
			});
		}
		Ok(values)
	}

	fn wishbone_setup(&mut self, addr: u64) -> Result<()>
	{
		self.dmi
			.write(regs::WB_CTRL, WB_CTRL_DEFAULT)
			.wrap_err("writing WB_CTRL")?;
		self.dmi.write(regs::WB_ADDR, addr).wrap_err("writing WB_ADDR")
	}

	/// Read `count` consecutive 64-bit words, handing each one to `each` as soon as it
	/// arrives. WB_ADDR is only written once, the debug module advances it after each data
	/// access. Words read before a failure have already been delivered.
	pub fn mem_read(&mut self, addr: u64, count: u64, mut each: impl FnMut(MemWord)) -> Result<()>
	{
		self.wishbone_setup(addr)?;
		let mut addr = addr;
		for _ in 0..count {
			let data = self.dmi.read(regs::WB_DATA).wrap_err("reading WB_DATA")?;
			each(MemWord {
				addr,
				data,
			});
			addr = addr.wrapping_add(8);
		}
		Ok(())
	}

	/// [`Self::mem_read`], collected
	pub fn mem_read_words(&mut self, addr: u64, count: u64) -> Result<Vec<MemWord>>
	{
		let mut words = Vec::with_capacity(count.min(4096) as usize);
		self.mem_read(addr, count, |word| words.push(word))?;
		Ok(words)
	}

	pub fn mem_write(&mut self, addr: u64, data: u64) -> Result<()>
	{
		self.wishbone_setup(addr)?;
		self.dmi.write(regs::WB_DATA, data).wrap_err("writing WB_DATA")
	}

	/// Copy a file into memory at `addr`, returning the number of bytes sent. A trailing
	/// partial word is padded out with zeros.
	pub fn load(&mut self, path: &Path, addr: u64) -> Result<u64>
	{
		let mut file = File::open(path).wrap_err_with(|| format!("opening '{}'", path.display()))?;
		let length = file.metadata().map(|metadata| metadata.len()).unwrap_or(0);
		self.wishbone_setup(addr)?;

		let progress = self.progress_bar(length.next_multiple_of(8))?;
		let mut count = 0u64;
		loop {
			let mut word = [0u8; 8];
			let read = read_word(&mut file, &mut word)
				.wrap_err_with(|| format!("reading '{}'", path.display()))?;
			if read == 0 {
				break;
			}
			self.dmi
				.write(regs::WB_DATA, u64::from_le_bytes(word))
				.wrap_err("writing WB_DATA")?;
			count += 8;
			progress.inc(8);
			if read < word.len() {
				break;
			}
		}
		progress.finish_and_clear();
		Ok(count)
	}

	/// Copy memory at `addr` out to a file, returning the number of bytes saved. At least one
	/// word is always transferred.
	pub fn save(&mut self, path: &Path, addr: u64, size: u64) -> Result<u64>
	{
		let file = File::create(path).wrap_err_with(|| format!("creating '{}'", path.display()))?;
		let mut file = BufWriter::new(file);
		self.wishbone_setup(addr)?;

		let progress = self.progress_bar(size.max(8).next_multiple_of(8))?;
		let mut count = 0u64;
		loop {
			let data = self.dmi.read(regs::WB_DATA).wrap_err("reading WB_DATA")?;
			file.write_all(&data.to_le_bytes()).wrap_err("writing save file")?;
			count += 8;
			progress.inc(8);
			if count >= size {
				break;
			}
		}
		file.flush().wrap_err("writing save file")?;
		progress.finish_and_clear();
		Ok(count)
	}

	/// Arm capture into the execution log
	pub fn log_start(&mut self) -> Result<()>
	{
		self.dmi.write(regs::LOG_ADDR, 0).wrap_err("writing LOG_ADDR")
	}

	pub fn log_stop(&mut self) -> Result<LogStopInfo>
	{
		self.dmi
			.write(regs::LOG_ADDR, LOG_STOP)
			.wrap_err("writing LOG_ADDR")?;
		let laddr = self.dmi.read(regs::LOG_ADDR).wrap_err("reading LOG_ADDR")?;
		Ok(LogStopInfo {
			geometry: LogGeometry::from_log_addr(laddr),
		})
	}

	/// Dump the whole log ring, oldest entry first, then put LOG_ADDR back the way it was
	/// (which restarts capture if it was running)
	pub fn log_dump(&mut self, path: &Path) -> Result<LogDumpInfo>
	{
		let file = File::create(path).wrap_err_with(|| format!("creating '{}'", path.display()))?;
		let mut file = BufWriter::new(file);

		let orig_laddr = self.dmi.read(regs::LOG_ADDR).wrap_err("reading LOG_ADDR")?;
		if orig_laddr & LOG_STOP == 0 {
			self.dmi
				.write(regs::LOG_ADDR, LOG_STOP)
				.wrap_err("writing LOG_ADDR")?;
		}

		let geometry = LogGeometry::from_log_addr(orig_laddr);
		self.dmi
			.write(regs::LOG_ADDR, geometry.seek_oldest())
			.wrap_err("writing LOG_ADDR")?;

		let progress = self.progress_bar(geometry.bytes())?;
		for _ in 0..geometry.words() {
			let data = self.dmi.read(regs::LOG_DATA).wrap_err("reading LOG_DATA")?;
			file.write_all(&data.to_le_bytes())
				.wrap_err_with(|| format!("writing '{}'", path.display()))?;
			progress.inc(8);
		}
		file.flush()
			.wrap_err_with(|| format!("writing '{}'", path.display()))?;
		progress.finish_and_clear();

		self.dmi
			.write(regs::LOG_ADDR, orig_laddr)
			.wrap_err("writing LOG_ADDR")?;
		Ok(LogDumpInfo {
			geometry,
			log_addr: orig_laddr,
		})
	}

	/// Ask a simulator to terminate. Hardware ignores this, and a simulator may well go away
	/// before acknowledging it, so failures are only reported.
	pub fn quit(&mut self)
	{
		if let Err(error) = self.dmi.write(regs::SIM_QUIT, 0) {
			warn!("Quit request failed: {}", error);
		}
	}

	pub fn dmi_read(&mut self, addr: u8) -> Result<DmiValue>
	{
		let data = self
			.dmi
			.read(addr)
			.wrap_err_with(|| format!("reading DMI register {:02x}", addr))?;
		Ok(DmiValue {
			addr,
			data,
		})
	}

	pub fn dmi_write(&mut self, addr: u8, data: u64) -> Result<()>
	{
		self.dmi
			.write(addr, data)
			.wrap_err_with(|| format!("writing DMI register {:02x}", addr))
	}
}

/// Fill `word` from `reader` as far as possible, returning how many bytes were read
fn read_word(reader: &mut impl Read, word: &mut [u8; 8]) -> std::io::Result<usize>
{
	let mut filled = 0;
	while filled < word.len() {
		let count = reader.read(&mut word[filled..])?;
		if count == 0 {
			break;
		}
		filled += count;
	}
	Ok(filled)
}
