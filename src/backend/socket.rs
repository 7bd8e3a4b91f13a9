// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use log::{debug, trace};

use crate::bits::BitReader;
use crate::dmi::{Backend, DMI_DATA_BITS, DMI_OP_BITS, DMI_SCAN_BITS, DmiOp, DmiReply, DmiRequest};
use crate::error::DebugError;

pub const DEFAULT_SIM_HOST: &str = "localhost";
pub const DEFAULT_SIM_PORT: u16 = 13245;

/// Bit count sent as the first byte of a frame to ask the far end for a JTAG reset
pub const JTAG_RESET_BIT_COUNT: u8 = 255;

const FRAME_BUFFER_SIZE: usize = 16;
/// A reply carries the bit count byte followed by at least the status and data fields
const REPLY_FRAME_BYTES: usize = 1 + (DMI_OP_BITS + DMI_DATA_BITS).div_ceil(8);

/// Talks DMI to a simulator over its debug socket
pub struct SocketBackend
{
	stream: TcpStream,
}

/// Split a `host:port` target at the first `:`, filling in defaults for whichever half is missing
pub fn parse_target(target: &str) -> Result<(String, u16), DebugError>
{
	let (host, port) = match target.split_once(':') {
		Some((host, port)) => (host, port),
		None => (target, ""),
	};
	let host = if host.is_empty() {
		DEFAULT_SIM_HOST
	} else {
		host
	};
	let port = if port.is_empty() {
		DEFAULT_SIM_PORT
	} else {
		port.parse::<u16>().map_err(|_| DebugError::BadTarget {
			target: target.to_string(),
			reason: format!("'{}' is not a valid port number", port),
		})?
	};
	Ok((host.to_string(), port))
}

/// Build the on-wire frame for a request: the scan length in bits, then the scan itself
pub fn encode_frame(request: &DmiRequest) -> Vec<u8>
{
	let mut frame = Vec::with_capacity(FRAME_BUFFER_SIZE);
	frame.push(DMI_SCAN_BITS as u8);
	frame.extend(request.to_scan().into_bytes());
	frame
}

/// Decode a reply frame, skipping over its leading bit count byte
pub fn decode_reply(frame: &[u8]) -> DmiReply
{
	let payload = frame.get(1..).unwrap_or_default();
	DmiReply::from_scan(&mut BitReader::from_bytes(payload))
}

impl SocketBackend
{
	pub fn connect(target: Option<&str>) -> Result<Self, DebugError>
	{
		let (host, port) = match target {
			Some(target) => parse_target(target)?,
			None => (DEFAULT_SIM_HOST.to_string(), DEFAULT_SIM_PORT),
		};
		debug!("Opening sim backend host '{}' port {}", host, port);

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
		// Every scan is a tiny request/reply round trip, don't let Nagle sit on them
		stream.set_nodelay(true)?;
		Ok(Self {
			stream,
		})
	}

	pub fn from_stream(stream: TcpStream) -> Self
	{
		Self {
			stream,
		}
	}

	fn read_reply(&mut self) -> Result<Vec<u8>, DebugError>
	{
		let mut buffer = [0u8; FRAME_BUFFER_SIZE];
		let mut filled = 0;
		while filled < REPLY_FRAME_BYTES {
			let count = self.stream.read(&mut buffer[filled..])?;
			if count == 0 {
				return Err(if filled == 0 {
					DebugError::Disconnected
				} else {
					DebugError::ShortReply {
						got: filled,
						expected: REPLY_FRAME_BYTES,
					}
				});
			}
			filled += count;
		}
		Ok(buffer[..filled].to_vec())
	}
}

impl Backend for SocketBackend
{
	fn reset(&mut self) -> Result<(), DebugError>
	{
		// The far end consumes this without replying
		self.stream.write_all(&[JTAG_RESET_BIT_COUNT])?;
		Ok(())
	}

	fn command(&mut self, op: DmiOp, addr: u8, data: u64) -> Result<DmiReply, DebugError>
	{
		let frame = encode_frame(&DmiRequest::new(op, addr, data));
		trace!("sim send: {:02x?}", frame);
		self.stream.write_all(&frame)?;

		let reply = self.read_reply()?;
		trace!("sim recv: {:02x?}", reply);
		Ok(decode_reply(&reply))
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::dmi::regs;

	#[test]
	fn target_defaults()
	{
		assert_eq!(parse_target("localhost:13245").unwrap(), ("localhost".to_string(), 13245));
		assert_eq!(parse_target("sim-host").unwrap(), ("sim-host".to_string(), 13245));
		assert_eq!(parse_target("sim-host:").unwrap(), ("sim-host".to_string(), 13245));
		assert_eq!(parse_target(":4000").unwrap(), ("localhost".to_string(), 4000));
	}

	#[test]
	fn target_with_bad_port()
	{
		let result = parse_target("localhost:http");
		assert!(matches!(result, Err(DebugError::BadTarget { .. })));
	}

	#[test]
	fn frame_layout()
	{
		let frame = encode_frame(&DmiRequest::new(DmiOp::Read, regs::CORE_STAT, 0));
		// Bit count, then 74 bits rounded up to 10 bytes
		assert_eq!(frame.len(), 11);
		assert_eq!(frame[0], 74);
		// op=1 in the low bits of byte 1
		assert_eq!(frame[1], 0x01);
		// 0x11 starts at bit 66, i.e. bit 2 of byte 9
		assert_eq!(frame[9], 0x11 << 2);
		assert_eq!(frame[10], 0x00);
	}

	#[test]
	fn frame_round_trip()
	{
		for (op, addr, data) in [
			(DmiOp::Write, regs::WB_DATA, 0x0000_0000_dead_beef),
			(DmiOp::Read, 0xff, u64::MAX),
			(DmiOp::Nop, 0x00, 0),
		] {
			let frame = encode_frame(&DmiRequest::new(op, addr, data));
			let mut reader = BitReader::from_bytes(&frame[1..]);
			assert_eq!(DmiRequest::from_scan(&mut reader), Some(DmiRequest::new(op, addr, data)));
		}
	}

	#[test]
	fn reply_skips_bit_count()
	{
		let reply = DmiReply {
			status: 3,
			data: 0x0123_4567_89ab_cdef,
		};
		let mut frame = vec![74u8];
		let mut scan = reply.to_scan(0x11);
		scan.set_uninitialized(false);
		frame.extend(scan.into_vec());
		assert_eq!(decode_reply(&frame), reply);
	}
}
