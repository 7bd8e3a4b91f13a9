// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Simulator end of the debug socket.
//!
//! A request is a bit count byte followed by that many bits packed LSB first. The reply has the
//! same shape but its total length, bit count byte included, is only `ceil(N / 8)` bytes, so the
//! last byte's worth of bits never makes it back. Clients rely on this framing, keep it as is.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use bitvec::prelude::*;
use log::{info, trace, warn};

use crate::backend::socket::JTAG_RESET_BIT_COUNT;
use crate::bits::ScanBits;

/// Largest message read from the socket in one go
pub const MAX_PACKET: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message
{
	/// Reset the JTAG side of the link
	JtagReset,
	Scan(ScanBits),
}

/// Split the first message off the front of `data`, returning it with the number of bytes it
/// used up. A message shorter than its bit count says is truncated to what did arrive.
pub fn parse_message(data: &[u8]) -> Option<(Message, usize)>
{
	let (&size, payload) = data.split_first()?;
	if size == JTAG_RESET_BIT_COUNT {
		return Some((Message::JtagReset, 1));
	}

	let mut size = size as usize;
	let needed = size.div_ceil(8);
	let used = needed.min(payload.len());
	if payload.len() * 8 < size {
		warn!("Debug short read: {} bytes for {} bits, truncating", payload.len(), size);
		size = payload.len() * 8;
	}
	let bits = payload[..used].view_bits::<Lsb0>()[..size].to_bitvec();
	Some((Message::Scan(bits), 1 + used))
}

/// Build the reply frame for a scan's output bits
pub fn encode_response(bits: &BitSlice<u8, Lsb0>) -> Vec<u8>
{
	let size = bits.len().min(u8::MAX as usize);
	let mut frame = vec![0u8; 1 + size.div_ceil(8)];
	frame[0] = size as u8;
	frame[1..].view_bits_mut::<Lsb0>()[..size].copy_from_bitslice(&bits[..size]);
	frame.truncate(size.div_ceil(8));
	frame
}

/// Listening socket plus at most one connected client. Nothing here ever blocks.
pub struct DebugSocket
{
	listener: TcpListener,
	client: Option<TcpStream>,
	pending: Vec<u8>,
}

impl DebugSocket
{
	/// Listen on all interfaces. Port 0 picks a free port.
	pub fn bind(port: u16) -> io::Result<Self>
	{
		let listener = TcpListener::bind(("0.0.0.0", port))?;
		listener.set_nonblocking(true)?;
		info!("Debug socket ready on {}", listener.local_addr()?);
		Ok(Self {
			listener,
			client: None,
			pending: Vec::new(),
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

	fn check_connection(&mut self)
	{
		match self.listener.accept() {
			Ok((stream, peer)) => {
				if let Err(error) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
					warn!("Failed to configure debug client socket: {}", error);
					return;
				}
				info!("Debug client connected ! ({})", peer);
				self.pending.clear();
				self.client = Some(stream);
			},
			Err(error) if error.kind() == ErrorKind::WouldBlock => (),
			Err(error) => warn!("Debug socket accept failed: {}", error),
		}
	}

	fn disconnect(&mut self)
	{
		self.client = None;
		self.pending.clear();
	}

	/// Poll for the next message, accepting a new client first if there is none
	pub fn read_message(&mut self) -> Option<Message>
	{
		if self.pending.is_empty() {
			if self.client.is_none() {
				self.check_connection();
			}
			let client = self.client.as_mut()?;

			let mut data = [0u8; MAX_PACKET];
			match client.read(&mut data) {
				Ok(0) => {
					info!("Debug client disconnected !");
					self.disconnect();
					return None;
				},
				Ok(count) => {
					trace!("debug socket recv: {:02x?}", &data[..count]);
					self.pending.extend_from_slice(&data[..count]);
				},
				Err(error) if error.kind() == ErrorKind::WouldBlock => return None,
				Err(error) => {
					warn!("Debug read error, assuming client disconnected ! ({})", error);
					self.disconnect();
					return None;
				},
			}
		}

		let (message, used) = parse_message(&self.pending)?;
		self.pending.drain(..used);
		Some(message)
	}

	/// Send a scan's output bits back to the client
	pub fn write_response(&mut self, bits: &BitSlice<u8, Lsb0>)
	{
		let Some(client) = self.client.as_mut() else {
			return;
		};
		let frame = encode_response(bits);
		trace!("debug socket send: {:02x?}", frame);
		if let Err(error) = write_all_nonblocking(client, &frame) {
			warn!("Debug write error, ignoring ({})", error);
		}
	}
}

/// The client socket is non-blocking, but replies are tiny and the client is always waiting
/// for them, so just spin on a full send buffer
fn write_all_nonblocking(stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()>
{
	while !data.is_empty() {
		match stream.write(data) {
			Ok(0) => return Err(ErrorKind::WriteZero.into()),
			Ok(count) => data = &data[count..],
			Err(error) if error.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
			Err(error) => return Err(error),
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::backend::socket::{decode_reply, encode_frame};
	use crate::dmi::{DmiOp, DmiReply, DmiRequest};

	#[test]
	fn request_frames_parse()
	{
		let frame = encode_frame(&DmiRequest::new(DmiOp::Write, 0x10, 1));
		let (message, used) = parse_message(&frame).unwrap();
		assert_eq!(used, 11);
		match message {
			Message::Scan(bits) => {
				assert_eq!(bits.len(), 74);
				assert_eq!(bits[0..2].load_le::<u8>(), 2);
				assert_eq!(bits[66..74].load_le::<u8>(), 0x10);
			},
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn reset_sentinel_uses_one_byte()
	{
		let mut data = vec![255u8];
		data.extend(encode_frame(&DmiRequest::new(DmiOp::Nop, 0, 0)));
		assert_eq!(parse_message(&data), Some((Message::JtagReset, 1)));
		let (message, used) = parse_message(&data[1..]).unwrap();
		assert_eq!(used, 11);
		assert!(matches!(message, Message::Scan(bits) if bits.len() == 74));
	}

	#[test]
	fn short_messages_are_truncated()
	{
		let (message, used) = parse_message(&[74, 0xff, 0x01]).unwrap();
		assert_eq!(used, 3);
		assert_eq!(message, Message::Scan(bitvec![u8, Lsb0; 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0]));
		assert_eq!(parse_message(&[]), None);
	}

	#[test]
	fn response_length_counts_the_size_byte()
	{
		let reply = DmiReply {
			status: 0,
			data: 0x0123_4567_89ab_cdef,
		};
		let frame = encode_response(&reply.to_scan(0x11));
		// 74 bits: 10 bytes on the wire, bit count included
		assert_eq!(frame.len(), 10);
		assert_eq!(frame[0], 74);
		assert_eq!(decode_reply(&frame), reply);

		let frame = encode_response(bitvec![u8, Lsb0; 1; 8].as_bitslice());
		assert_eq!(frame, vec![8]);
	}
}
