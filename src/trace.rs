// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Execution log ring helpers and decoding of the trace records it holds.
//!
//! The core records one 256-bit entry per cycle into a power-of-two sized ring. Reading LOG_ADDR
//! hands back the write pointer in the upper 32 bits, with the ring size bit set above the
//! pointer itself, which is how the ring size is inferred.

use std::fmt::Write;

use bitfield::bitfield;

use crate::dmi::LOG_STOP;

pub const LOG_ENTRY_WORDS: usize = 4;
pub const LOG_ENTRY_BYTES: usize = LOG_ENTRY_WORDS * 8;

/// Find the ring size from a write pointer: the smallest power of two above `waddr >> 1`
pub fn log_ring_size(waddr: u64) -> u64
{
	let mut lsize = 1u64;
	while lsize != 0 && (waddr >> 1) >= lsize {
		lsize <<= 1;
	}
	lsize
}

/// Where the log ring is, as reported by a LOG_ADDR read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGeometry
{
	/// Ring size in entries
	pub entries: u64,
	/// Index of the next entry to be written, which is the oldest entry in a full ring
	pub write_ptr: u64,
}

impl LogGeometry
{
	pub fn from_log_addr(laddr: u64) -> Self
	{
		let waddr = laddr >> 32;
		let entries = log_ring_size(waddr);
		Self {
			entries,
			write_ptr: waddr & !entries,
		}
	}

	/// LOG_ADDR value that keeps capture stopped and seeks the read cursor to the oldest entry
	pub fn seek_oldest(&self) -> u64
	{
		LOG_STOP | (self.write_ptr << 2)
	}

	/// Number of 64-bit words making up the whole ring
	pub fn words(&self) -> u64
	{
		self.entries * LOG_ENTRY_WORDS as u64
	}

	pub fn bytes(&self) -> u64
	{
		self.entries * LOG_ENTRY_BYTES as u64
	}
}

bitfield! {
	/// Fetch and icache state
	#[derive(Clone, Copy, Default, PartialEq, Eq)]
	pub struct FetchWord(u64);
	impl Debug;
	pub nia_lo, set_nia_lo: 41, 0;
	pub nia_hi, set_nia_hi: 42;
	pub ic_ra_valid, set_ic_ra_valid: 43;
	pub ic_access_ok, set_ic_access_ok: 44;
	pub ic_is_miss, set_ic_is_miss: 45;
	pub ic_is_hit, set_ic_is_hit: 46;
	pub u8, ic_way, set_ic_way: 49, 47;
	pub ic_state, set_ic_state: 50;
	pub u8, ic_part_nia, set_ic_part_nia: 54, 51;
	pub ic_fetch_failed, set_ic_fetch_failed: 55;
	pub ic_stall_out, set_ic_stall_out: 56;
	pub ic_wb_stall, set_ic_wb_stall: 57;
	pub ic_wb_cyc, set_ic_wb_cyc: 58;
	pub ic_wb_stb, set_ic_wb_stb: 59;
	pub u8, ic_wb_adr, set_ic_wb_adr: 62, 60;
	pub ic_wb_ack, set_ic_wb_ack: 63;
}

bitfield! {
	/// Instruction word plus decode and execute pipeline state
	#[derive(Clone, Copy, Default, PartialEq, Eq)]
	pub struct DecodeWord(u64);
	impl Debug;
	pub u32, ic_insn, set_ic_insn: 31, 0;
	pub ic_valid, set_ic_valid: 32;
	pub d1_valid, set_d1_valid: 33;
	pub u8, d1_unit, set_d1_unit: 35, 34;
	pub u8, d1_part_nia, set_d1_part_nia: 39, 36;
	pub u8, d1_insn_type, set_d1_insn_type: 45, 40;
	pub d2_bypass_a, set_d2_bypass_a: 46;
	pub d2_bypass_b, set_d2_bypass_b: 47;
	pub d2_bypass_c, set_d2_bypass_c: 48;
	pub d2_stall_out, set_d2_stall_out: 49;
	pub d2_stopped_out, set_d2_stopped_out: 50;
	pub d2_valid, set_d2_valid: 51;
	pub u8, d2_part_nia, set_d2_part_nia: 55, 52;
	pub e1_flush_out, set_e1_flush_out: 56;
	pub e1_stall_out, set_e1_stall_out: 57;
	pub e1_redirect, set_e1_redirect: 58;
	pub e1_valid, set_e1_valid: 59;
	pub e1_write_enable, set_e1_write_enable: 60;
}

bitfield! {
	/// Interrupt and MSR state, load/store, dcache and writeback
	#[derive(Clone, Copy, Default, PartialEq, Eq)]
	pub struct ExecuteWord(u64);
	impl Debug;
	pub e1_irq_state, set_e1_irq_state: 0;
	pub e1_irq, set_e1_irq: 1;
	pub e1_exception, set_e1_exception: 2;
	pub e1_msr_dr, set_e1_msr_dr: 3;
	pub e1_msr_ir, set_e1_msr_ir: 4;
	pub e1_msr_pr, set_e1_msr_pr: 5;
	pub e1_msr_ee, set_e1_msr_ee: 6;
	pub u8, ls_state, set_ls_state: 14, 12;
	pub ls_dw_done, set_ls_dw_done: 15;
	pub ls_min_done, set_ls_min_done: 16;
	pub ls_do_valid, set_ls_do_valid: 17;
	pub ls_mo_valid, set_ls_mo_valid: 18;
	pub ls_lo_valid, set_ls_lo_valid: 19;
	pub ls_eo_except, set_ls_eo_except: 20;
	pub ls_stall_out, set_ls_stall_out: 21;
	pub u8, dc_state, set_dc_state: 25, 23;
	pub dc_ra_valid, set_dc_ra_valid: 26;
	pub u8, dc_tlb_way, set_dc_tlb_way: 29, 27;
	pub dc_stall_out, set_dc_stall_out: 30;
	pub u8, dc_op, set_dc_op: 33, 31;
	pub dc_do_valid, set_dc_do_valid: 34;
	pub dc_do_error, set_dc_do_error: 35;
	pub dc_wb_cyc, set_dc_wb_cyc: 36;
	pub dc_wb_stb, set_dc_wb_stb: 37;
	pub dc_wb_ack, set_dc_wb_ack: 38;
	pub dc_wb_stall, set_dc_wb_stall: 39;
	pub u8, dc_wb_adr, set_dc_wb_adr: 42, 40;
	pub u8, cr_wr_mask, set_cr_wr_mask: 50, 43;
	pub u8, cr_wr_data, set_cr_wr_data: 54, 51;
	pub cr_wr_enable, set_cr_wr_enable: 55;
	pub u8, reg_wr_reg, set_reg_wr_reg: 62, 56;
	pub reg_wr_enable, set_reg_wr_enable: 63;
}

/// One trace record as stored in the log ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogEntry
{
	pub fetch: FetchWord,
	pub decode: DecodeWord,
	pub execute: ExecuteWord,
	pub reg_wr_data: u64,
}

impl LogEntry
{
	pub fn from_words(words: [u64; LOG_ENTRY_WORDS]) -> Self
	{
		Self {
			fetch: FetchWord(words[0]),
			decode: DecodeWord(words[1]),
			execute: ExecuteWord(words[2]),
			reg_wr_data: words[3],
		}
	}

	pub fn to_words(&self) -> [u64; LOG_ENTRY_WORDS]
	{
		[self.fetch.0, self.decode.0, self.execute.0, self.reg_wr_data]
	}

	/// Decode a record from the little endian layout `ldump` writes
	pub fn from_bytes(bytes: &[u8; LOG_ENTRY_BYTES]) -> Self
	{
		let mut words = [0u64; LOG_ENTRY_WORDS];
		for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
			let mut raw = [0u8; 8];
			raw.copy_from_slice(chunk);
			*word = u64::from_le_bytes(raw);
		}
		Self::from_words(words)
	}

	/// The record left behind by an instruction fetched from `nia` that completed in execute
	pub fn completed(nia: u64, insn: u32) -> Self
	{
		let mut entry = Self::default();
		entry.fetch.set_nia_lo((nia >> 2) & ((1 << 42) - 1));
		entry.fetch.set_nia_hi(nia >> 63 != 0);
		entry.fetch.set_ic_ra_valid(true);
		entry.fetch.set_ic_access_ok(true);
		entry.fetch.set_ic_is_hit(true);
		entry.decode.set_ic_insn(insn);
		entry.decode.set_ic_valid(true);
		entry.decode.set_e1_valid(true);
		entry
	}

	pub fn nia(&self) -> u64
	{
		let hi = if self.fetch.nia_hi() {
			0xc000_0000_0000_0000
		} else {
			0
		};
		hi | (self.fetch.nia_lo() << 2)
	}

	/// Whether an instruction completed in this cycle
	pub fn completes(&self) -> bool
	{
		self.execute.ls_lo_valid() || self.decode.e1_valid()
	}
}

const UNITS: [&str; 4] = ["--", "al", "ls", "fp"];

const OPS: [&str; 64] = [
	"illegal", "nop    ", "add    ", "and    ", "attn   ", "b      ", "bc     ", "bcreg  ",
	"bperm  ", "cmp    ", "cmpb   ", "cmpeqb ", "cmprb  ", "cntz   ", "crop   ", "darn   ",
	"dcbf   ", "dcbst  ", "dcbt   ", "dcbtst ", "dcbz   ", "div    ", "dive   ", "exts   ",
	"extswsl", "fpop   ", "fpopi  ", "icbi   ", "icbt   ", "isel   ", "isync  ", "ld     ",
	"st     ", "fpload ", "fpstore", "mcrxrx ", "mfcr   ", "mfmsr  ", "mfspr  ", "mod    ",
	"mtcrf  ", "mtmsr  ", "mtspr  ", "mull64 ", "mulh64 ", "mulh32 ", "or     ", "popcnt ",
	"prty   ", "rfid   ", "rlc    ", "rlcl   ", "rlcr   ", "sc     ", "setb   ", "shl    ",
	"shr    ", "sync   ", "tlbie  ", "trap   ", "xor    ", "bcd    ", "addg6s ", "ffail  ",
];

/// Short names of the fast SPRs, as they show up as GSPR writeback targets
const SPR_NAMES: [&str; 13] = [
	"lr ", "ctr", "sr0", "sr1", "hr0", "hr1", "sg0", "sg1", "sg2", "sg3", "hg0", "hg1", "xer",
];

const HEADER: &str = "        fetch1 NIA      icache                         decode1       decode2   execute1         loadstore  dcache       CR   GSPR\n     ----------------   TAHW S -WB-- pN --insn--    pN un op         pN byp    FR IIE MSR  WC   SD MM CE   SRTO DE -WB-- c ms reg val\n                        LdMy t csnSa IA             IA it            IA abc    le srx EPID em   tw rd mx   tAwp vr csnSa 0 k\n";

/// Lines between repeats of the column header
const HEADER_INTERVAL: u64 = 20;

fn flag(set: bool, c: char) -> char
{
	if set {
		c
	} else {
		' '
	}
}

fn either(set: bool, yes: char, no: char) -> char
{
	if set {
		yes
	} else {
		no
	}
}

/// Renders a stream of log entries as a cycle by cycle pipeline table
pub struct LogFormatter
{
	/// Full fetch addresses by the low bits the later pipeline stages keep
	full_nia: [u64; 16],
	lineno: u64,
	completed: u64,
}

impl Default for LogFormatter
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl LogFormatter
{
	pub fn new() -> Self
	{
		let mut full_nia = [0u64; 16];
		for (index, nia) in full_nia.iter_mut().enumerate() {
			*nia = (index as u64) << 2;
		}
		Self {
			full_nia,
			lineno: 1,
			completed: 0,
		}
	}

	fn part_nia(&self, part: u8) -> u64
	{
		self.full_nia[(part & 0xf) as usize] & 0xff
	}

	/// Format one entry, preceded by the column header every few lines
	pub fn format_entry(&mut self, entry: &LogEntry) -> String
	{
		let fetch = &entry.fetch;
		let decode = &entry.decode;
		let exec = &entry.execute;
		self.full_nia[(fetch.nia_lo() & 0xf) as usize] = entry.nia();

		let mut out = String::new();
		if self.lineno % HEADER_INTERVAL == 1 {
			out.push_str(HEADER);
		}

		// Writing to a String can't fail
		let _ = write!(
			out,
			"{:4} {}0000{:011x} {} ",
			self.lineno,
			either(fetch.nia_hi(), 'c', '0'),
			fetch.nia_lo() << 2,
			flag(fetch.ic_stall_out(), '|')
		);
		let _ = write!(
			out,
			"{}{}{}{} {} {}{}{}{}{} {:02x} ",
			either(fetch.ic_ra_valid(), ' ', 'T'),
			either(fetch.ic_access_ok(), ' ', 'X'),
			either(fetch.ic_is_hit(), 'H', either(fetch.ic_is_miss(), 'M', ' ')),
			fetch.ic_way(),
			flag(fetch.ic_state(), 'W'),
			flag(fetch.ic_wb_cyc(), 'c'),
			flag(fetch.ic_wb_stb(), 's'),
			fetch.ic_wb_adr(),
			flag(fetch.ic_wb_stall(), 'S'),
			flag(fetch.ic_wb_ack(), 'a'),
			self.part_nia(fetch.ic_part_nia())
		);
		if decode.ic_valid() {
			let _ = write!(out, "{:08x}", decode.ic_insn());
		} else if fetch.ic_fetch_failed() {
			out.push_str("!!!!!!!!");
		} else {
			out.push_str("--------");
		}
		let _ = write!(
			out,
			" {}{} {:02x} ",
			flag(decode.ic_valid(), '>'),
			flag(decode.d2_stall_out(), '|'),
			self.part_nia(decode.d1_part_nia())
		);
		if decode.d1_valid() {
			let _ = write!(
				out,
				"{} {}",
				UNITS[decode.d1_unit() as usize & 3],
				OPS[decode.d1_insn_type() as usize & 63]
			);
		} else {
			out.push_str("-- -------");
		}
		let _ = write!(
			out,
			" {}{} ",
			flag(decode.d1_valid(), '>'),
			flag(decode.d2_stall_out(), '|')
		);
		let _ = write!(
			out,
			"{:02x} {}{}{} {}{} ",
			self.part_nia(decode.d2_part_nia()),
			flag(decode.d2_bypass_a(), 'a'),
			flag(decode.d2_bypass_b(), 'b'),
			flag(decode.d2_bypass_c(), 'c'),
			flag(decode.d2_valid(), '>'),
			flag(decode.e1_stall_out(), '|')
		);
		let _ = write!(
			out,
			"{}{} {}{}{} {}{}{}{} {}{} ",
			flag(decode.e1_flush_out(), 'F'),
			flag(decode.e1_redirect(), 'R'),
			flag(exec.e1_irq_state(), 'w'),
			flag(exec.e1_irq(), 'I'),
			flag(exec.e1_exception(), 'X'),
			flag(exec.e1_msr_ee(), 'E'),
			either(exec.e1_msr_pr(), 'u', 's'),
			flag(exec.e1_msr_ir(), 'I'),
			flag(exec.e1_msr_dr(), 'D'),
			flag(decode.e1_write_enable(), 'W'),
			flag(decode.e1_valid(), 'C')
		);
		let _ = write!(
			out,
			"{} {}{} {}{} {}{} {} ",
			flag(exec.ls_stall_out(), '|'),
			exec.ls_state(),
			exec.ls_dw_done() as u8,
			flag(exec.ls_mo_valid(), 'M'),
			flag(exec.ls_min_done(), 'm'),
			flag(exec.ls_lo_valid(), 'C'),
			flag(exec.ls_eo_except(), 'X'),
			flag(exec.ls_do_valid(), '>')
		);
		let _ = write!(
			out,
			"{}{}{}{} {}{} {}{}{}{}{} ",
			exec.dc_state(),
			flag(exec.dc_ra_valid(), 'R'),
			exec.dc_tlb_way(),
			exec.dc_op(),
			flag(exec.dc_do_valid(), 'V'),
			flag(exec.dc_do_error(), 'E'),
			flag(exec.dc_wb_cyc(), 'c'),
			flag(exec.dc_wb_stb(), 's'),
			exec.dc_wb_adr(),
			flag(exec.dc_wb_stall(), 'S'),
			flag(exec.dc_wb_ack(), 'a')
		);
		if exec.cr_wr_enable() {
			let _ = write!(out, "{:x}>{:02x} ", exec.cr_wr_data(), exec.cr_wr_mask());
		} else {
			out.push_str("     ");
		}
		if exec.reg_wr_enable() {
			let reg = exec.reg_wr_reg();
			if !(32..=44).contains(&reg) {
				let _ = write!(out, "r{:02}", reg);
			} else {
				out.push_str(SPR_NAMES[(reg - 32) as usize]);
			}
			let _ = write!(out, "={:016x}", entry.reg_wr_data);
		}
		out.push('\n');

		self.lineno += 1;
		if entry.completes() {
			self.completed += 1;
		}
		out
	}

	/// Number of entries formatted so far
	pub fn cycles(&self) -> u64
	{
		self.lineno - 1
	}

	pub fn completed(&self) -> u64
	{
		self.completed
	}

	pub fn summary(&self) -> String
	{
		format!(
			"{} instructions completed, {:.2} CPI",
			self.completed,
			self.cycles() as f64 / self.completed as f64
		)
	}
}
