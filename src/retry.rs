// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! DMI read/write with poll-until-ready semantics.
//!
//! The debug module answers each scan with the status of the operation issued by a *previous*
//! scan, so a read or write is submitted once and then polled for with NOP scans until the
//! module stops reporting busy. A stalled Wishbone bus behind the debug module shows up here as
//! a long run of busy replies.

use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::dmi::{Backend, DmiOp, DmiReply, status};
use crate::error::DebugError;

/// How long to keep polling a busy debug module. The default polls forever.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy
{
	pub max_polls: Option<u64>,
	pub timeout: Option<Duration>,
}

impl RetryPolicy
{
	pub const UNBOUNDED: Self = Self {
		max_polls: None,
		timeout: None,
	};

	pub fn with_max_polls(mut self, polls: u64) -> Self
	{
		self.max_polls = Some(polls);
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self
	{
		self.timeout = Some(timeout);
		self
	}
}

pub struct Dmi<B>
{
	backend: B,
	policy: RetryPolicy,
}

impl<B: Backend> Dmi<B>
{
	pub fn new(backend: B) -> Self
	{
		Self::with_policy(backend, RetryPolicy::default())
	}

	pub fn with_policy(backend: B, policy: RetryPolicy) -> Self
	{
		Self {
			backend,
			policy,
		}
	}

	pub fn policy(&self) -> RetryPolicy
	{
		self.policy
	}

	pub fn backend(&self) -> &B
	{
		&self.backend
	}

	pub fn backend_mut(&mut self) -> &mut B
	{
		&mut self.backend
	}

	pub fn into_backend(self) -> B
	{
		self.backend
	}

	/// Read a debug module register
	pub fn read(&mut self, addr: u8) -> Result<u64, DebugError>
	{
		trace!("DMI read {:02x}", addr);
		// The reply to the submitting scan is for whatever came before it, so it gets dropped
		self.backend.command(DmiOp::Read, addr, 0)?;
		let reply = self.poll()?;
		trace!("DMI read {:02x} -> {:016x}", addr, reply.data);
		Ok(reply.data)
	}

	/// Write a debug module register
	pub fn write(&mut self, addr: u8, data: u64) -> Result<(), DebugError>
	{
		trace!("DMI write {:02x} <- {:016x}", addr, data);
		self.backend.command(DmiOp::Write, addr, data)?;
		self.poll()?;
		Ok(())
	}

	fn poll(&mut self) -> Result<DmiReply, DebugError>
	{
		let start = Instant::now();
		let mut polls = 0u64;
		loop {
			let reply = self.backend.command(DmiOp::Nop, 0, 0)?;
			polls += 1;
			match reply.status {
				status::OK => return Ok(reply),
				status::BUSY => (),
				code => warn!("Unknown status code {} !", code),
			}

			if let Some(max_polls) = self.policy.max_polls {
				if polls >= max_polls {
					return Err(DebugError::RetryLimit {
						polls,
					});
				}
			}
			if let Some(timeout) = self.policy.timeout {
				if start.elapsed() > timeout {
					return Err(DebugError::RetryTimeout(timeout));
				}
			}
		}
	}
}

#[cfg(test)]
mod tests
{
	use std::collections::VecDeque;

	use super::*;

	/// Replies with a scripted sequence of status codes to NOP scans, then OK forever
	struct ScriptedBackend
	{
		statuses: VecDeque<u8>,
		commands: Vec<(DmiOp, u8, u64)>,
		read_value: u64,
		always_busy: bool,
	}

	impl ScriptedBackend
	{
		fn new(statuses: &[u8]) -> Self
		{
			Self {
				statuses: statuses.iter().copied().collect(),
				commands: Vec::new(),
				read_value: 0x1234,
				always_busy: false,
			}
		}

		fn nops(&self) -> usize
		{
			self.commands.iter().filter(|(op, ..)| *op == DmiOp::Nop).count()
		}
	}

	impl Backend for ScriptedBackend
	{
		fn reset(&mut self) -> Result<(), DebugError>
		{
			Ok(())
		}

		fn command(&mut self, op: DmiOp, addr: u8, data: u64) -> Result<DmiReply, DebugError>
		{
			if self.always_busy {
				return Ok(DmiReply {
					status: status::BUSY,
					data: 0,
				});
			}
			self.commands.push((op, addr, data));
			if op != DmiOp::Nop {
				// Deliberately garbage: this reply must be ignored
				return Ok(DmiReply {
					status: status::OK,
					data: 0xbad,
				});
			}
			Ok(DmiReply {
				status: self.statuses.pop_front().unwrap_or(status::OK),
				data: self.read_value,
			})
		}
	}

	struct FailingBackend;

	impl Backend for FailingBackend
	{
		fn reset(&mut self) -> Result<(), DebugError>
		{
			Ok(())
		}

		fn command(&mut self, _op: DmiOp, _addr: u8, _data: u64) -> Result<DmiReply, DebugError>
		{
			Err(DebugError::Disconnected)
		}
	}

	#[test]
	fn read_polls_once_per_busy_reply()
	{
		for busy in 0..8 {
			let mut dmi = Dmi::new(ScriptedBackend::new(&vec![status::BUSY; busy]));
			assert_eq!(dmi.read(0x11).unwrap(), 0x1234);
			let backend = dmi.into_backend();
			assert_eq!(backend.nops(), busy + 1);
			assert_eq!(backend.commands[0], (DmiOp::Read, 0x11, 0));
			assert!(backend.commands[1..].iter().all(|command| *command == (DmiOp::Nop, 0, 0)));
		}
	}

	#[test]
	fn write_polls_once_per_busy_reply()
	{
		for busy in 0..8 {
			let mut dmi = Dmi::new(ScriptedBackend::new(&vec![status::BUSY; busy]));
			dmi.write(0x10, 0x10).unwrap();
			let backend = dmi.into_backend();
			assert_eq!(backend.commands.len(), busy + 2);
			assert_eq!(backend.commands[0], (DmiOp::Write, 0x10, 0x10));
			assert_eq!(backend.nops(), busy + 1);
		}
	}

	#[test]
	fn unknown_status_keeps_polling()
	{
		let mut dmi = Dmi::new(ScriptedBackend::new(&[2, status::BUSY, 1]));
		assert_eq!(dmi.read(0x12).unwrap(), 0x1234);
		assert_eq!(dmi.into_backend().nops(), 4);
	}

	#[test]
	fn transport_failure_is_reported()
	{
		let mut dmi = Dmi::new(FailingBackend);
		assert!(matches!(dmi.read(0x11), Err(DebugError::Disconnected)));
		assert!(matches!(dmi.write(0x10, 1), Err(DebugError::Disconnected)));
	}

	#[test]
	fn poll_limit_stops_a_permanently_busy_module()
	{
		let policy = RetryPolicy::default().with_max_polls(5);
		let mut dmi = Dmi::with_policy(ScriptedBackend::new(&[status::BUSY; 100]), policy);
		match dmi.read(0x11) {
			Err(DebugError::RetryLimit {
				polls,
			}) => assert_eq!(polls, 5),
			other => panic!("expected the retry limit to trip, got {:?}", other),
		}
		assert_eq!(dmi.into_backend().nops(), 5);
	}

	#[test]
	fn poll_timeout_stops_a_permanently_busy_module()
	{
		let policy = RetryPolicy::default().with_timeout(Duration::from_millis(20));
		let mut backend = ScriptedBackend::new(&[]);
		backend.always_busy = true;
		let mut dmi = Dmi::with_policy(backend, policy);
		assert!(matches!(dmi.write(0x10, 1), Err(DebugError::RetryTimeout(_))));
	}
}
