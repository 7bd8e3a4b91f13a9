// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Debug transport module: turns 74-bit DMI scans into register accesses on a debug module.
//!
//! Each scan first captures the state of the previously issued operation (busy, or done with its
//! read data) and then issues whatever operation the scan carries.

use bitvec::prelude::*;
use log::{debug, trace};

use crate::bits::{BitReader, ScanBits};
use crate::dmi::{DMI_SCAN_BITS, DmiOp, DmiReply, DmiRequest, status};

/// The register side of a debug module as seen from its DMI port
pub trait DebugModule
{
	fn dmi_read(&mut self, addr: u8) -> u64;
	fn dmi_write(&mut self, addr: u8, data: u64);

	/// Whether a client asked for the simulation to end
	fn terminate_requested(&self) -> bool
	{
		false
	}
}

pub struct Dtm<M>
{
	module: M,
	/// Busy replies to give before an operation reports completion
	latency: u32,
	busy: u32,
	outstanding: bool,
	read_data: u64,
}

impl<M: DebugModule> Dtm<M>
{
	pub fn new(module: M) -> Self
	{
		Self::with_latency(module, 0)
	}

	pub fn with_latency(module: M, latency: u32) -> Self
	{
		Self {
			module,
			latency,
			busy: 0,
			outstanding: false,
			read_data: 0,
		}
	}

	pub fn module(&self) -> &M
	{
		&self.module
	}

	pub fn module_mut(&mut self) -> &mut M
	{
		&mut self.module
	}

	/// An operation has been issued and its completion not yet reported to the client
	pub fn outstanding(&self) -> bool
	{
		self.outstanding
	}

	/// Drop any operation in flight
	pub fn reset(&mut self)
	{
		debug!("DTM reset");
		self.busy = 0;
		self.outstanding = false;
	}

	/// The reply a scan would shift out right now
	pub fn capture(&mut self) -> DmiReply
	{
		if self.busy > 0 {
			self.busy -= 1;
			return DmiReply {
				status: status::BUSY,
				data: 0,
			};
		}
		self.outstanding = false;
		DmiReply {
			status: status::OK,
			data: self.read_data,
		}
	}

	/// Issue the operation shifted in by a scan. New operations are dropped while one is still
	/// in flight.
	pub fn update(&mut self, request: DmiRequest)
	{
		if request.op == DmiOp::Nop {
			return;
		}
		if self.busy > 0 {
			debug!("DTM busy, dropping {:?}", request);
			return;
		}
		trace!("DTM {:?} {:02x} {:016x}", request.op, request.addr, request.data);
		match request.op {
			DmiOp::Read => self.read_data = self.module.dmi_read(request.addr),
			DmiOp::Write => self.module.dmi_write(request.addr, request.data),
			DmiOp::Nop => (),
		}
		self.busy = self.latency;
		self.outstanding = true;
	}

	/// Run one full scan of the DMI register, returning the bits shifted out. Scans of any
	/// other length are treated as not reaching the DMI register and shift out zeros.
	pub fn scan(&mut self, bits: &BitSlice<u8, Lsb0>) -> ScanBits
	{
		if bits.len() != DMI_SCAN_BITS {
			debug!("Ignoring {} bit scan", bits.len());
			return bitvec![u8, Lsb0; 0; bits.len()];
		}
		let reply = self.capture();
		match DmiRequest::from_scan(&mut BitReader::new(bits)) {
			Some(request) => self.update(request),
			None => debug!("Ignoring scan with reserved opcode"),
		}
		reply.to_scan(0)
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[derive(Default)]
	struct Scratch
	{
		value: u64,
		reads: usize,
	}

	impl DebugModule for Scratch
	{
		fn dmi_read(&mut self, _addr: u8) -> u64
		{
			self.reads += 1;
			self.value
		}

		fn dmi_write(&mut self, _addr: u8, data: u64)
		{
			self.value = data;
		}
	}

	fn scan(dtm: &mut Dtm<Scratch>, op: DmiOp, addr: u8, data: u64) -> DmiReply
	{
		let out = dtm.scan(DmiRequest::new(op, addr, data).to_scan().as_bits());
		DmiReply::from_scan(&mut BitReader::new(&out))
	}

	#[test]
	fn completes_on_next_poll_without_latency()
	{
		let mut dtm = Dtm::new(Scratch::default());
		scan(&mut dtm, DmiOp::Write, 0x01, 0x55);
		assert!(dtm.outstanding());
		assert_eq!(scan(&mut dtm, DmiOp::Nop, 0, 0).status, status::OK);
		assert!(!dtm.outstanding());

		scan(&mut dtm, DmiOp::Read, 0x01, 0);
		let reply = scan(&mut dtm, DmiOp::Nop, 0, 0);
		assert_eq!(reply.status, status::OK);
		assert_eq!(reply.data, 0x55);
	}

	#[test]
	fn latency_gives_busy_replies()
	{
		let mut dtm = Dtm::with_latency(Scratch::default(), 3);
		dtm.module_mut().value = 7;
		scan(&mut dtm, DmiOp::Read, 0x01, 0);
		for _ in 0..3 {
			assert_eq!(scan(&mut dtm, DmiOp::Nop, 0, 0).status, status::BUSY);
		}
		let reply = scan(&mut dtm, DmiOp::Nop, 0, 0);
		assert_eq!(reply.status, status::OK);
		assert_eq!(reply.data, 7);
	}

	#[test]
	fn operations_while_busy_are_dropped()
	{
		let mut dtm = Dtm::with_latency(Scratch::default(), 2);
		scan(&mut dtm, DmiOp::Read, 0x01, 0);
		scan(&mut dtm, DmiOp::Read, 0x01, 0);
		assert_eq!(dtm.module().reads, 1);
		dtm.reset();
		assert_eq!(scan(&mut dtm, DmiOp::Nop, 0, 0).status, status::OK);
	}

	#[test]
	fn short_scans_are_ignored()
	{
		let mut dtm = Dtm::new(Scratch::default());
		let out = dtm.scan(bitvec![u8, Lsb0; 1; 32].as_bitslice());
		assert_eq!(out, bitvec![u8, Lsb0; 0; 32]);
		assert_eq!(dtm.module().reads, 0);
	}
}
