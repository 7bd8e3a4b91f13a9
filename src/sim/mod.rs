// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Simulator side of the debug link: a software debug module reachable through the debug
//! socket and, optionally, a remote-bitbang JTAG port.

pub mod dtm;
pub mod model;
pub mod socket;
pub mod tap;

use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use self::dtm::{DebugModule, Dtm};
use self::model::{SimConfig, SimDebugModule};
use self::socket::{DebugSocket, Message};
use self::tap::BitbangServer;

/// How long to sleep when there was nothing to do
const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOptions
{
	/// Debug socket port, 0 for any free port
	pub port: u16,
	/// Remote-bitbang port, if one should be opened
	pub bitbang_port: Option<u16>,
	/// Busy replies given before each DMI operation completes
	pub latency: u32,
	pub model: SimConfig,
}

impl Default for SimOptions
{
	fn default() -> Self
	{
		Self {
			port: crate::backend::socket::DEFAULT_SIM_PORT,
			bitbang_port: None,
			latency: 0,
			model: SimConfig::default(),
		}
	}
}

pub struct SimServer
{
	dtm: Dtm<SimDebugModule>,
	socket: DebugSocket,
	bitbang: Option<BitbangServer>,
}

impl SimServer
{
	pub fn bind(options: SimOptions) -> io::Result<Self>
	{
		let socket = DebugSocket::bind(options.port)?;
		let bitbang = options.bitbang_port.map(BitbangServer::bind).transpose()?;
		Ok(Self {
			dtm: Dtm::with_latency(SimDebugModule::new(options.model), options.latency),
			socket,
			bitbang,
		})
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr>
	{
		self.socket.local_addr()
	}

	pub fn bitbang_addr(&self) -> Option<io::Result<SocketAddr>>
	{
		self.bitbang.as_ref().map(BitbangServer::local_addr)
	}

	pub fn module(&self) -> &SimDebugModule
	{
		self.dtm.module()
	}

	pub fn module_mut(&mut self) -> &mut SimDebugModule
	{
		self.dtm.module_mut()
	}

	/// Service both ports once. Returns whether there was anything to do.
	pub fn poll(&mut self) -> bool
	{
		let mut busy = false;
		if let Some(message) = self.socket.read_message() {
			busy = true;
			match message {
				// Nothing to translate this into, the DTM has no link state to reset
				Message::JtagReset => debug!("JTAG reset requested"),
				Message::Scan(bits) => {
					let out = self.dtm.scan(&bits);
					self.socket.write_response(&out);
				},
			}
		}
		if let Some(bitbang) = self.bitbang.as_mut() {
			busy |= bitbang.poll(&mut self.dtm);
		}
		busy
	}

	/// A client asked us to quit, has seen that request complete and has hung up. Clients
	/// still connected after the quit may go on reading status before they leave.
	pub fn finished(&self) -> bool
	{
		self.dtm.module().terminate_requested() && !self.dtm.outstanding() && !self.connected()
	}

	/// Whether a client holds either port
	pub fn connected(&self) -> bool
	{
		self.socket.connected() || self.bitbang.as_ref().is_some_and(BitbangServer::connected)
	}

	/// Serve clients until one of them asks for the simulation to end
	pub fn run(&mut self)
	{
		while !self.finished() {
			if !self.poll() {
				thread::sleep(IDLE_SLEEP);
			}
		}
		info!("Simulation terminated");
	}
}
