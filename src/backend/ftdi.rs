// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! JTAG cables built around the MPSSE engine of FTDI USB bridges: Digilent HS1/HS2, bare
//! FT2232H/FT4232H/FT232H boards and the Olimex ARM-USB family.
//!
//! The chip is driven straight over USB. A scan is turned into a batch of MPSSE commands (TMS
//! walks, byte and bit shifts with TDO capture) ending in Send Immediate, written in one bulk
//! transfer, and the captured TDO bytes are read back in one go.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use async_io::{Timer, block_on};
use bitvec::prelude::*;
use futures_lite::FutureExt;
use log::{debug, info, trace, warn};
use nusb::DeviceInfo;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};

use crate::backend::jtag::JtagTap;
use crate::bits::ScanBits;
use crate::error::DebugError;

/// Default TCK frequency
pub const DEFAULT_KHZ: u32 = 1000;

const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// MPSSE opcodes, see FTDI AN_108
mod mpsse
{
	/// Clock bytes out on -ve TCK, in on +ve, LSB first
	pub const SHIFT_BYTES: u8 = 0x39;
	/// Clock bits out on -ve TCK, in on +ve, LSB first
	pub const SHIFT_BITS: u8 = 0x3b;
	/// Clock TMS bits out, TDI held at bit 7 of the data byte
	pub const TMS_BITS: u8 = 0x4b;
	/// As [`TMS_BITS`], capturing TDO
	pub const TMS_BITS_READ: u8 = 0x6b;
	pub const SET_LOW_PINS: u8 = 0x80;
	pub const SET_HIGH_PINS: u8 = 0x82;
	pub const LOOPBACK_OFF: u8 = 0x85;
	pub const CLOCK_DIVISOR: u8 = 0x86;
	pub const SEND_IMMEDIATE: u8 = 0x87;
	pub const DIVIDE_BY_5_OFF: u8 = 0x8a;
	pub const DIVIDE_BY_5_ON: u8 = 0x8b;
	/// Not an opcode. The engine answers it with [`BAD_COMMAND`] and the byte itself.
	pub const BOGUS: u8 = 0xaa;
	pub const BAD_COMMAND: u8 = 0xfa;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChipType
{
	FT2232C,
	FT2232H,
	FT4232H,
	FT232H,
}

impl ChipType
{
	/// Identify the chip from the bcdDevice field of its device descriptor
	pub fn from_device_version(version: u16) -> Option<Self>
	{
		match version {
			0x500 => Some(Self::FT2232C),
			0x700 => Some(Self::FT2232H),
			0x800 => Some(Self::FT4232H),
			0x900 => Some(Self::FT232H),
			_ => None,
		}
	}

	/// Size of the MPSSE command buffer
	pub fn buffer_size(self) -> usize
	{
		match self {
			Self::FT2232H | Self::FT4232H => 4096,
			Self::FT232H => 1024,
			Self::FT2232C => 128,
		}
	}

	/// Fastest TCK in kHz, with divide-by-5 off where the chip has it
	pub fn max_clock_khz(self) -> u32
	{
		match self {
			Self::FT2232C => 6_000,
			_ => 30_000,
		}
	}

	/// Whether the chip has the 60 MHz master clock that can skip the divide-by-5 prescaler
	pub fn has_divide_by_5(self) -> bool
	{
		self != Self::FT2232C
	}
}

/// Initial levels and directions of the 16 GPIO lines. The low byte drives ADBUS, where TCK,
/// TDI, TDO and TMS sit on bits 0 to 3, the high byte ACBUS.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PinLayout
{
	pub output: u16,
	pub direction: u16,
}

const GENERIC_LAYOUT: PinLayout = PinLayout {
	output: 0x0008,
	direction: 0x000b,
};

/// One of the cables this module knows how to find and set up
#[derive(Clone, Copy, Debug)]
pub struct FtdiCableKind
{
	pub name: &'static str,
	pub vid: u16,
	pub pid: u16,
	/// Product strings the cable reports, empty to accept any
	pub products: &'static [&'static str],
	/// Chip assumed when bcdDevice doesn't tell
	pub fallback_chip: ChipType,
	pub layout: PinLayout,
}

impl FtdiCableKind
{
	fn matches(&self, device: &DeviceInfo) -> bool
	{
		(device.vendor_id(), device.product_id()) == (self.vid, self.pid) &&
			(self.products.is_empty() ||
				device
					.product_string()
					.is_none_or(|product| self.products.contains(&product)))
	}
}

const DIGILENT_PRODUCTS: &[&str] = &["Digilent Adept USB Device", "Digilent USB Device"];

pub static FTDI_CABLES: &[FtdiCableKind] = &[
	FtdiCableKind {
		name: "DigilentHS1",
		vid: 0x0403,
		pid: 0x6010,
		products: DIGILENT_PRODUCTS,
		fallback_chip: ChipType::FT2232H,
		layout: PinLayout {
			output: 0x0088,
			direction: 0x008b,
		},
	},
	FtdiCableKind {
		name: "DigilentHS2",
		vid: 0x0403,
		pid: 0x6014,
		products: DIGILENT_PRODUCTS,
		fallback_chip: ChipType::FT232H,
		layout: PinLayout {
			output: 0x00e8,
			direction: 0x60eb,
		},
	},
	FtdiCableKind {
		name: "ft2232",
		vid: 0x0403,
		pid: 0x6010,
		products: &[],
		fallback_chip: ChipType::FT2232C,
		layout: GENERIC_LAYOUT,
	},
	FtdiCableKind {
		name: "ft4232",
		vid: 0x0403,
		pid: 0x6011,
		products: &[],
		fallback_chip: ChipType::FT4232H,
		layout: GENERIC_LAYOUT,
	},
	FtdiCableKind {
		name: "ft232h",
		vid: 0x0403,
		pid: 0x6014,
		products: &[],
		fallback_chip: ChipType::FT232H,
		layout: GENERIC_LAYOUT,
	},
	FtdiCableKind {
		name: "ARM-USB-OCD",
		vid: 0x15ba,
		pid: 0x0003,
		products: &[],
		fallback_chip: ChipType::FT2232C,
		layout: PinLayout {
			output: 0x0908,
			direction: 0x0b1b,
		},
	},
	FtdiCableKind {
		name: "ARM-USB-TINY",
		vid: 0x15ba,
		pid: 0x0004,
		products: &[],
		fallback_chip: ChipType::FT2232C,
		layout: PinLayout {
			output: 0x0808,
			direction: 0x0a1b,
		},
	},
	FtdiCableKind {
		name: "ARM-USB-TINY-H",
		vid: 0x15ba,
		pid: 0x002a,
		products: &[],
		fallback_chip: ChipType::FT2232H,
		layout: PinLayout {
			output: 0x0808,
			direction: 0x0a1b,
		},
	},
	FtdiCableKind {
		name: "ARM-USB-OCD-H",
		vid: 0x15ba,
		pid: 0x002b,
		products: &[],
		fallback_chip: ChipType::FT2232H,
		layout: PinLayout {
			output: 0x0908,
			direction: 0x0b1b,
		},
	},
];

/// Look a cable up by name, ignoring case
pub fn cable_kind(name: &str) -> Option<&'static FtdiCableKind>
{
	FTDI_CABLES.iter().find(|kind| kind.name.eq_ignore_ascii_case(name))
}

/// Options after the cable name: `serial=<string>`, `interface=<A-D>` and `khz=<TCK kHz>`,
/// separated by commas
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FtdiParams
{
	pub serial: Option<String>,
	pub interface: u8,
	pub khz: Option<u32>,
}

impl FtdiParams
{
	pub fn parse(params: Option<&str>) -> Result<Self, DebugError>
	{
		let mut result = Self::default();
		let Some(params) = params else {
			return Ok(result);
		};
		let bad = |reason: String| DebugError::BadTarget {
			target: params.into(),
			reason,
		};
		for param in params.split(',').filter(|param| !param.is_empty()) {
			let Some((key, value)) = param.split_once('=') else {
				return Err(bad(format!("'{}' is not key=value", param)));
			};
			match key {
				"serial" => result.serial = Some(value.into()),
				"interface" => {
					result.interface = match value {
						"A" | "a" | "0" => 0,
						"B" | "b" | "1" => 1,
						"C" | "c" | "2" => 2,
						"D" | "d" | "3" => 3,
						_ => return Err(bad(format!("no interface '{}'", value))),
					}
				},
				"khz" => {
					let khz = value
						.parse::<u32>()
						.ok()
						.filter(|&khz| khz != 0)
						.ok_or_else(|| bad(format!("bad clock speed '{}'", value)))?;
					result.khz = Some(khz);
				},
				_ => return Err(bad(format!("unknown parameter '{}'", key))),
			}
		}
		Ok(result)
	}
}

/// Clock divisor giving the fastest TCK not above `khz`, and the TCK that results
pub fn clock_divisor(max_khz: u32, khz: u32) -> (u16, u32)
{
	let khz = khz.clamp(1, max_khz);
	let divisor = (max_khz.div_ceil(khz) - 1).min(0xffff);
	(divisor as u16, max_khz / (divisor + 1))
}

/// Raw access to one interface of an FTDI chip. Reads strip the two modem status bytes the chip
/// puts in front of every USB packet.
pub struct FtdiDevice
{
	interface: nusb::Interface,
	/// wIndex of the vendor requests, 1 for interface A
	index: u16,
	read_ep: u8,
	write_ep: u8,
	packet_size: usize,
	pending: VecDeque<u8>,
	timeout: Duration,
}

fn usb_error(action: &'static str) -> impl FnOnce(io::Error) -> DebugError
{
	move |source| DebugError::Usb {
		action,
		source,
	}
}

impl FtdiDevice
{
	const SIO_RESET: u8 = 0x00;
	const SIO_RESET_SIO: u16 = 0;
	const SIO_PURGE_RX: u16 = 1;
	const SIO_PURGE_TX: u16 = 2;
	const SIO_SET_LATENCY_TIMER: u8 = 0x09;
	const SIO_SET_BITMODE: u8 = 0x0b;
	const BITMODE_RESET: u8 = 0x00;
	const BITMODE_MPSSE: u8 = 0x02;

	pub fn open(info: &DeviceInfo, interface: u8) -> Result<Self, DebugError>
	{
		let device = info.open().map_err(usb_error("opening the device"))?;
		// Bulk endpoints are 0x81/0x02 for interface A, 0x83/0x04 for B and so on
		let read_ep = 0x81 + 2 * interface;
		let write_ep = 0x02 + 2 * interface;

		let packet_size = device
			.active_configuration()
			.ok()
			.and_then(|config| {
				config
					.interface_alt_settings()
					.filter(|setting| setting.interface_number() == interface)
					.flat_map(|setting| {
						setting
							.endpoints()
							.map(|endpoint| (endpoint.address(), endpoint.max_packet_size()))
							.collect::<Vec<_>>()
					})
					.find(|(address, _)| *address == read_ep)
					.map(|(_, max_packet_size)| max_packet_size)
			})
			.unwrap_or_else(|| {
				warn!("No descriptor for endpoint 0x{:02x}, assuming full speed packets", read_ep);
				64
			});
		debug!("FTDI interface {} packets are {} bytes", interface, packet_size);

		let interface_handle = device
			.detach_and_claim_interface(interface)
			.map_err(usb_error("claiming the JTAG interface"))?;
		Ok(Self {
			interface: interface_handle,
			index: interface as u16 + 1,
			read_ep,
			write_ep,
			packet_size,
			pending: VecDeque::new(),
			timeout: USB_TIMEOUT,
		})
	}

	fn sio_write(&self, request: u8, value: u16, action: &'static str) -> Result<(), DebugError>
	{
		self.interface
			.control_out_blocking(
				Control {
					control_type: ControlType::Vendor,
					recipient: Recipient::Device,
					request,
					value,
					index: self.index,
				},
				&[],
				self.timeout,
			)
			.map_err(|error| DebugError::Usb {
				action,
				source: error.into(),
			})?;
		Ok(())
	}

	/// Reset the chip and switch it over to MPSSE mode with an empty pipeline
	pub fn enter_mpsse(&mut self) -> Result<(), DebugError>
	{
		self.sio_write(Self::SIO_RESET, Self::SIO_RESET_SIO, "resetting the chip")?;
		self.sio_write(Self::SIO_SET_BITMODE, (Self::BITMODE_RESET as u16) << 8, "resetting the bit mode")?;
		// The low byte is the pin direction mask for the bit mode, TCK, TDI and TMS are outputs
		self.sio_write(
			Self::SIO_SET_BITMODE,
			(Self::BITMODE_MPSSE as u16) << 8 | 0x0b,
			"entering MPSSE mode",
		)?;
		self.sio_write(Self::SIO_SET_LATENCY_TIMER, 1, "setting the latency timer")?;
		self.sio_write(Self::SIO_RESET, Self::SIO_PURGE_RX, "purging the receive buffer")?;
		self.sio_write(Self::SIO_RESET, Self::SIO_PURGE_TX, "purging the transmit buffer")?;
		self.pending.clear();
		Ok(())
	}

	fn read_packet(&self) -> io::Result<Vec<u8>>
	{
		let mut queue = self.interface.bulk_in_queue(self.read_ep);
		queue.submit(RequestBuffer::new(self.packet_size));
		let completion = block_on(async { Some(queue.next_complete().await) }.or(async {
			Timer::after(self.timeout).await;
			None
		}));
		let Some(completion) = completion else {
			queue.cancel_all();
			let _ = block_on(queue.next_complete());
			return Err(io::ErrorKind::TimedOut.into());
		};
		completion.status.map_err(io::Error::other)?;
		Ok(completion.data)
	}
}

impl Read for FtdiDevice
{
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
	{
		let deadline = Instant::now() + self.timeout;
		while self.pending.is_empty() {
			let packet = self.read_packet()?;
			if packet.len() > 2 {
				trace!("FTDI read: {:02x?}", &packet[2..]);
				self.pending.extend(&packet[2..]);
			} else if Instant::now() > deadline {
				return Err(io::ErrorKind::TimedOut.into());
			}
		}
		let count = buf.len().min(self.pending.len());
		for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..count)) {
			*slot = byte;
		}
		Ok(count)
	}
}

impl Write for FtdiDevice
{
	fn write(&mut self, buf: &[u8]) -> io::Result<usize>
	{
		trace!("FTDI write: {:02x?}", buf);
		let transfer = async {
			let completion = self.interface.bulk_out(self.write_ep, buf.to_vec()).await;
			completion.status.map_err(io::Error::other)?;
			Ok::<_, io::Error>(completion.data.actual_length())
		};
		block_on(transfer.or(async {
			Timer::after(self.timeout).await;
			Err(io::ErrorKind::TimedOut.into())
		}))
	}

	fn flush(&mut self) -> io::Result<()>
	{
		Ok(())
	}
}

/// An MPSSE engine used as a JTAG cable. Every operation is one batch of commands and, when
/// TDO is captured, one read of the reply.
pub struct FtdiCable<D: Read + Write = FtdiDevice>
{
	device: D,
	chip: ChipType,
	commands: Vec<u8>,
	/// Valid bits in each reply byte still to come
	replies: Vec<usize>,
	captured: ScanBits,
}

impl FtdiCable<FtdiDevice>
{
	/// Find, open and set up the cable described by `kind` and `params`
	pub fn open(kind: &FtdiCableKind, params: Option<&str>) -> Result<Self, DebugError>
	{
		let params = FtdiParams::parse(params)?;
		let info = nusb::list_devices()
			.map_err(usb_error("listing devices"))?
			.filter(|device| kind.matches(device))
			.find(|device| {
				params
					.serial
					.as_deref()
					.is_none_or(|serial| device.serial_number() == Some(serial))
			})
			.ok_or_else(|| DebugError::CableNotFound(kind.name.into()))?;

		let chip = ChipType::from_device_version(info.device_version()).unwrap_or_else(|| {
			warn!(
				"Unknown FTDI device version 0x{:04x}, assuming {:?}",
				info.device_version(),
				kind.fallback_chip
			);
			kind.fallback_chip
		});
		info!(
			"Found {} ({:?}) serial {}",
			info.product_string().unwrap_or(kind.name),
			chip,
			info.serial_number().unwrap_or("unknown")
		);

		let mut device = FtdiDevice::open(&info, params.interface)?;
		device.enter_mpsse()?;
		let mut cable = Self::new(device, chip);
		cable.synchronise()?;
		cable.configure(kind.layout, params.khz.unwrap_or(DEFAULT_KHZ))?;
		Ok(cable)
	}
}

impl<D: Read + Write> FtdiCable<D>
{
	/// Wrap a device that is already in MPSSE mode
	pub fn new(device: D, chip: ChipType) -> Self
	{
		Self {
			device,
			chip,
			commands: Vec::new(),
			replies: Vec::new(),
			captured: ScanBits::new(),
		}
	}

	/// Check the engine is in step with us by sending it a bad opcode and waiting for the echo
	pub fn synchronise(&mut self) -> Result<(), DebugError>
	{
		self.device.write_all(&[mpsse::BOGUS])?;
		let mut echo = [0u8; 2];
		self.device.read_exact(&mut echo)?;
		if echo != [mpsse::BAD_COMMAND, mpsse::BOGUS] {
			return Err(DebugError::JtagSetup(format!("MPSSE engine not in sync, answered {:02x?}", echo)));
		}
		Ok(())
	}

	/// Drive the initial pin state and set TCK. Returns the TCK frequency actually used.
	pub fn configure(&mut self, layout: PinLayout, khz: u32) -> Result<u32, DebugError>
	{
		let [low_out, high_out] = layout.output.to_le_bytes();
		let [low_dir, high_dir] = layout.direction.to_le_bytes();
		self.commands.extend_from_slice(&[mpsse::SET_LOW_PINS, low_out, low_dir]);
		self.commands.extend_from_slice(&[mpsse::SET_HIGH_PINS, high_out, high_dir]);
		self.commands.push(if self.chip.has_divide_by_5() {
			mpsse::DIVIDE_BY_5_OFF
		} else {
			mpsse::DIVIDE_BY_5_ON
		});
		let (divisor, actual) = clock_divisor(self.chip.max_clock_khz(), khz);
		let [divisor_low, divisor_high] = divisor.to_le_bytes();
		self.commands.extend_from_slice(&[mpsse::CLOCK_DIVISOR, divisor_low, divisor_high]);
		self.commands.push(mpsse::LOOPBACK_OFF);
		self.flush()?;
		info!("JTAG clock {} kHz (asked for {} kHz)", actual, khz);
		Ok(actual)
	}

	/// Queue a command, sending what is already queued first if the chip couldn't hold both
	fn queue(&mut self, command: &[u8], replies: &[usize]) -> Result<(), DebugError>
	{
		// One byte stays free for Send Immediate
		if self.commands.len() + command.len() + 1 > self.chip.buffer_size() {
			self.flush()?;
		}
		self.commands.extend_from_slice(command);
		self.replies.extend_from_slice(replies);
		Ok(())
	}

	/// Clock out up to seven TMS values, first one in bit 0
	fn tms(&mut self, sequence: u8, count: usize) -> Result<(), DebugError>
	{
		self.queue(&[mpsse::TMS_BITS, (count - 1) as u8, sequence], &[])
	}

	/// Send everything queued and collect the TDO bits it captured
	fn flush(&mut self) -> Result<(), DebugError>
	{
		if self.commands.is_empty() {
			return Ok(());
		}
		self.commands.push(mpsse::SEND_IMMEDIATE);
		trace!("MPSSE commands: {:02x?}", self.commands);
		self.device.write_all(&self.commands)?;
		self.device.flush()?;
		self.commands.clear();

		if self.replies.is_empty() {
			return Ok(());
		}
		let mut reply = vec![0u8; self.replies.len()];
		self.device.read_exact(&mut reply)?;
		// Bits arrive at the top of each byte and move down as more are clocked in
		for (byte, count) in reply.into_iter().zip(self.replies.drain(..)) {
			let bits = byte >> (8 - count);
			self.captured.extend_from_bitslice(&bits.view_bits::<Lsb0>()[..count]);
		}
		Ok(())
	}

	/// Shift a register from one of the Shift-xR states, leaving on the last bit and parking
	/// back in Run-Test/Idle
	fn shift(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		let Some((last, body)) = bits.split_last() else {
			return Err(DebugError::JtagSetup("empty JTAG scan".into()));
		};
		let last = *last;
		self.captured.clear();

		// Whole bytes, split so each piece fits the command buffer
		let body_bytes = body.len() / 8;
		let max_chunk = (self.chip.buffer_size() - 8).max(1);
		for chunk in body[..body_bytes * 8].chunks(max_chunk * 8) {
			let data: Vec<u8> = chunk.chunks(8).map(|byte| byte.load_le::<u8>()).collect();
			let [length_low, length_high] = ((data.len() - 1) as u16).to_le_bytes();
			let mut command = vec![mpsse::SHIFT_BYTES, length_low, length_high];
			command.extend_from_slice(&data);
			self.queue(&command, &vec![8; data.len()])?;
		}
		let tail = &body[body_bytes * 8..];
		if !tail.is_empty() {
			let byte = tail.load_le::<u8>();
			self.queue(&[mpsse::SHIFT_BITS, (tail.len() - 1) as u8, byte], &[tail.len()])?;
		}
		// The last bit goes out with TMS high, moving to Exit1
		self.queue(&[mpsse::TMS_BITS_READ, 0, (last as u8) << 7 | 1], &[1])?;
		// Exit1 -> Update -> Run-Test/Idle
		self.tms(0b01, 2)?;
		self.flush()?;
		Ok(std::mem::take(&mut self.captured))
	}
}

impl<D: Read + Write> JtagTap for FtdiCable<D>
{
	fn tap_reset(&mut self) -> Result<(), DebugError>
	{
		// Five clocks with TMS high reach Test-Logic-Reset from anywhere, then one low to idle
		self.tms(0b01_1111, 6)?;
		self.flush()
	}

	fn shift_ir(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		self.tms(0b0011, 4)?;
		self.shift(bits)
	}

	fn shift_dr(&mut self, bits: &BitSlice<u8, Lsb0>) -> Result<ScanBits, DebugError>
	{
		self.tms(0b001, 3)?;
		self.shift(bits)
	}
}
