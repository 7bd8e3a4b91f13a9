// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! JTAG TAP controller model driven by the remote-bitbang protocol.
//!
//! TMS and TDI are acted on at the rising edge of TCK and TDO changes on the falling edge, so a
//! client sampling TDO while TCK is low sees the bit about to be shifted out.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use bitvec::prelude::*;
use log::{debug, info, warn};

use crate::backend::bitbang::{QUIT, READ_TDO};
use crate::bits::{BitReader, ScanBits};
use crate::dmi::{DMI_SCAN_BITS, DmiRequest};
use crate::sim::dtm::{DebugModule, Dtm};

pub const IR_LENGTH: usize = 6;
pub const IDCODE: u32 = 0x0362_d093;

const INSN_IDCODE: u8 = 0b001001;
const INSN_USER2: u8 = 0b000011;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterState
{
	Select,
	Capture,
	Shift,
	Exit1,
	Pause,
	Exit2,
	Update,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TapState
{
	Reset,
	Idle,
	Dr(RegisterState),
	Ir(RegisterState),
}

impl TapState
{
	/// The state the TAP moves to on a rising TCK edge with the given TMS
	pub fn next(self, tms: bool) -> Self
	{
		use RegisterState::*;
		match (self, tms) {
			(Self::Reset, true) => Self::Reset,
			(Self::Reset, false) => Self::Idle,
			(Self::Idle, true) => Self::Dr(Select),
			(Self::Idle, false) => Self::Idle,
			(Self::Dr(Select), true) => Self::Ir(Select),
			(Self::Ir(Select), true) => Self::Reset,
			(Self::Dr(Update) | Self::Ir(Update), true) => Self::Dr(Select),
			(Self::Dr(Update) | Self::Ir(Update), false) => Self::Idle,
			(Self::Dr(state), tms) => Self::Dr(state.next(tms)),
			(Self::Ir(state), tms) => Self::Ir(state.next(tms)),
		}
	}
}

impl RegisterState
{
	/// Transitions within a register column. Leaving the column from Select or Update is
	/// handled by [`TapState::next`].
	fn next(self, tms: bool) -> Self
	{
		match (self, tms) {
			(Self::Select, _) => Self::Capture,
			(Self::Capture | Self::Shift, true) => Self::Exit1,
			(Self::Capture | Self::Shift, false) => Self::Shift,
			(Self::Exit1 | Self::Exit2, true) => Self::Update,
			(Self::Exit1 | Self::Pause, false) => Self::Pause,
			(Self::Pause, true) => Self::Exit2,
			(Self::Exit2, false) => Self::Shift,
			(Self::Update, _) => Self::Update,
		}
	}
}

/// What a client asked of the TAP through one remote-bitbang byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitbangReply
{
	/// Nothing to send back
	None,
	/// A TDO sample to send back
	Tdo(u8),
	/// The client is done with the connection
	Quit,
}

pub struct TapController
{
	state: TapState,
	ir: u8,
	ir_shift: ScanBits,
	dr_shift: ScanBits,
	tck: bool,
	tdo: bool,
}

impl Default for TapController
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl TapController
{
	pub fn new() -> Self
	{
		Self {
			state: TapState::Reset,
			ir: INSN_IDCODE,
			ir_shift: ScanBits::new(),
			dr_shift: ScanBits::new(),
			tck: false,
			tdo: false,
		}
	}

	pub fn state(&self) -> TapState
	{
		self.state
	}

	pub fn instruction(&self) -> u8
	{
		self.ir
	}

	fn reset<M: DebugModule>(&mut self, dtm: &mut Dtm<M>)
	{
		self.state = TapState::Reset;
		self.ir = INSN_IDCODE;
		dtm.reset();
	}

	/// Handle one byte of the remote-bitbang protocol
	pub fn handle<M: DebugModule>(&mut self, command: u8, dtm: &mut Dtm<M>) -> BitbangReply
	{
		match command {
			b'0'..=b'7' => {
				let pins = command - b'0';
				self.set_pins(pins & 4 != 0, pins & 2 != 0, pins & 1 != 0, dtm);
			},
			b'r'..=b'u' => {
				// Only TRST reaches the TAP, SRST has nothing to reset here
				if (command - b'r') & 2 != 0 {
					self.reset(dtm);
				}
			},
			READ_TDO => return BitbangReply::Tdo(if self.tdo { b'1' } else { b'0' }),
			QUIT => {
				info!("Disconnecting JTAG");
				return BitbangReply::Quit;
			},
			b'B' | b'b' => (),
			other => warn!("Unknown JTAG command {}", other as char),
		}
		BitbangReply::None
	}

	fn set_pins<M: DebugModule>(&mut self, tck: bool, tms: bool, tdi: bool, dtm: &mut Dtm<M>)
	{
		let rising = tck && !self.tck;
		let falling = !tck && self.tck;
		self.tck = tck;
		if rising {
			self.rising_edge(tms, tdi, dtm);
		} else if falling {
			self.tdo = self.output();
		}
	}

	fn output(&self) -> bool
	{
		match self.state {
			TapState::Ir(RegisterState::Shift) => self.ir_shift.first().is_some_and(|bit| *bit),
			TapState::Dr(RegisterState::Shift) => self.dr_shift.first().is_some_and(|bit| *bit),
			_ => false,
		}
	}

	fn rising_edge<M: DebugModule>(&mut self, tms: bool, tdi: bool, dtm: &mut Dtm<M>)
	{
		match self.state {
			TapState::Ir(RegisterState::Capture) => {
				// IEEE 1149.1 wants 01 in the low bits of the captured IR
				self.ir_shift = bitvec![u8, Lsb0; 0; IR_LENGTH];
				self.ir_shift.set(0, true);
			},
			TapState::Ir(RegisterState::Shift) => shift_in(&mut self.ir_shift, tdi),
			TapState::Dr(RegisterState::Capture) => self.capture_dr(dtm),
			TapState::Dr(RegisterState::Shift) => shift_in(&mut self.dr_shift, tdi),
			_ => (),
		}

		let next = self.state.next(tms);
		match next {
			TapState::Reset if self.state != TapState::Reset => self.reset(dtm),
			TapState::Ir(RegisterState::Update) => {
				self.ir = self.ir_shift.load_le::<u8>();
				debug!("TAP instruction {:06b}", self.ir);
			},
			TapState::Dr(RegisterState::Update) => self.update_dr(dtm),
			_ => (),
		}
		self.state = next;
	}

	fn capture_dr<M: DebugModule>(&mut self, dtm: &mut Dtm<M>)
	{
		self.dr_shift = match self.ir {
			INSN_IDCODE => {
				let mut bits = bitvec![u8, Lsb0; 0; 32];
				bits.store_le(IDCODE);
				bits
			},
			INSN_USER2 => {
				let reply = dtm.capture();
				reply.to_scan(0)
			},
			// BYPASS, and anything we don't implement acts like it
			_ => bitvec![u8, Lsb0; 0; 1],
		};
	}

	fn update_dr<M: DebugModule>(&mut self, dtm: &mut Dtm<M>)
	{
		if self.ir != INSN_USER2 {
			return;
		}
		if self.dr_shift.len() != DMI_SCAN_BITS {
			warn!("USER2 update with {} bits", self.dr_shift.len());
			return;
		}
		if let Some(request) = DmiRequest::from_scan(&mut BitReader::new(&self.dr_shift)) {
			dtm.update(request);
		}
	}
}

/// Remote-bitbang listener feeding a [`TapController`]. Like the debug socket it serves one
/// client at a time and never blocks.
pub struct BitbangServer
{
	listener: TcpListener,
	client: Option<TcpStream>,
	tap: TapController,
}

impl BitbangServer
{
	pub fn bind(port: u16) -> io::Result<Self>
	{
		let listener = TcpListener::bind(("0.0.0.0", port))?;
		listener.set_nonblocking(true)?;
		info!("JTAG remote bitbang socket ready on {}", listener.local_addr()?);
		Ok(Self {
			listener,
			client: None,
			tap: TapController::new(),
		})
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr>
	{
		self.listener.local_addr()
	}

	pub fn connected(&self) -> bool
	{
		self.client.is_some()
	}

	/// Process whatever the client has sent so far. Returns whether anything was done.
	pub fn poll<M: DebugModule>(&mut self, dtm: &mut Dtm<M>) -> bool
	{
		if self.client.is_none() {
			match self.listener.accept() {
				Ok((stream, peer)) => {
					if let Err(error) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
						warn!("Failed to configure JTAG client socket: {}", error);
						return false;
					}
					info!("JTAG client connected ({})", peer);
					self.client = Some(stream);
				},
				Err(error) if error.kind() == ErrorKind::WouldBlock => return false,
				Err(error) => {
					warn!("JTAG socket accept failed: {}", error);
					return false;
				},
			}
		}
		let Some(client) = self.client.as_mut() else {
			return false;
		};

		let mut data = [0u8; 4096];
		let count = match client.read(&mut data) {
			Ok(0) => {
				info!("JTAG client disconnected");
				self.client = None;
				return true;
			},
			Ok(count) => count,
			Err(error) if error.kind() == ErrorKind::WouldBlock => return false,
			Err(error) => {
				warn!("JTAG read error, disconnecting ({})", error);
				self.client = None;
				return true;
			},
		};

		let mut replies = Vec::new();
		let mut quit = false;
		for &command in &data[..count] {
			match self.tap.handle(command, dtm) {
				BitbangReply::None => (),
				BitbangReply::Tdo(tdo) => replies.push(tdo),
				BitbangReply::Quit => {
					quit = true;
					break;
				},
			}
		}
		if !replies.is_empty() {
			let mut sent = 0;
			while sent < replies.len() {
				match client.write(&replies[sent..]) {
					Ok(0) => break,
					Ok(written) => sent += written,
					Err(error) if error.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
					Err(error) => {
						warn!("JTAG write error, disconnecting ({})", error);
						quit = true;
						break;
					},
				}
			}
		}
		if quit {
			self.client = None;
		}
		true
	}
}

/// Shift one bit in at the top of a register, dropping the bottom bit out
fn shift_in(register: &mut ScanBits, tdi: bool)
{
	if register.is_empty() {
		return;
	}
	register.shift_start(1);
	let last = register.len() - 1;
	register.set(last, tdi);
}
