// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Simulator plumbing shared by the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::thread::{self, JoinHandle};

use color_eyre::eyre::Result;
use mw_debug::backend::socket::SocketBackend;
use mw_debug::core::DebugSession;
use mw_debug::dmi::Backend;
use mw_debug::sim::model::SimConfig;
use mw_debug::sim::{SimOptions, SimServer};

pub struct RunningSim
{
	pub addr: SocketAddr,
	pub bitbang: Option<SocketAddr>,
	pub handle: JoinHandle<SimServer>,
}

impl RunningSim
{
	pub fn target(&self) -> String
	{
		format!("127.0.0.1:{}", self.addr.port())
	}

	pub fn bitbang_target(&self) -> String
	{
		let addr = self.bitbang.expect("no bitbang port");
		format!("127.0.0.1:{}", addr.port())
	}

	/// Wait for a client's quit request to take the server down
	pub fn join(self) -> SimServer
	{
		self.handle.join().expect("simulator thread panicked")
	}
}

pub fn spawn_sim(options: SimOptions, setup: impl FnOnce(&mut SimServer)) -> RunningSim
{
	let mut server = SimServer::bind(options).expect("failed to bind simulator");
	setup(&mut server);
	let addr = server.local_addr().unwrap();
	let bitbang = server.bitbang_addr().map(|addr| addr.unwrap());
	let handle = thread::spawn(move || {
		server.run();
		server
	});
	RunningSim {
		addr,
		bitbang,
		handle,
	}
}

/// Ask the simulator to quit, hang up and wait for it to wind down
pub fn finish<B: Backend>(mut session: DebugSession<B>, sim: RunningSim) -> SimServer
{
	session.quit();
	drop(session);
	sim.join()
}

pub fn small_sim() -> SimOptions
{
	SimOptions {
		port: 0,
		bitbang_port: None,
		latency: 0,
		model: SimConfig {
			log_entries: 16,
			mem_size: 64 * 1024,
			reset_vector: 0,
		},
	}
}

pub fn connect(sim: &RunningSim) -> Result<DebugSession<SocketBackend>>
{
	Ok(DebugSession::new(SocketBackend::connect(Some(&sim.target()))?))
}
