// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

mod common;

use std::fs;

use color_eyre::eyre::Result;
use mw_debug::backend::bitbang::RemoteBitbang;
use mw_debug::backend::jtag::JtagBackend;
use mw_debug::backend::socket::SocketBackend;
use mw_debug::core::{CoreState, DebugSession, StepOutcome};
use mw_debug::dmi::{Backend, CoreStat, regs};
use mw_debug::error::DebugError;
use mw_debug::retry::RetryPolicy;
use mw_debug::sim::SimOptions;
use mw_debug::sim::model::MSR_RESET;
use mw_debug::sim::tap::IDCODE;
use mw_debug::trace::{LOG_ENTRY_BYTES, LogEntry};

use crate::common::{connect, finish, small_sim, spawn_sim};

#[test]
fn stop_and_start() -> Result<()>
{
	let sim = spawn_sim(small_sim(), |_| ());
	let mut session = connect(&sim)?;

	let status = session.status()?;
	assert_eq!(status.state, CoreState::Running);
	assert_eq!(status.msr, MSR_RESET);

	session.stop()?;
	let status = session.status()?;
	assert_eq!(status.state, CoreState::Stopped);
	assert_eq!(status.to_string(), "Core: stopped\n NIA: 0000000000000000\n MSR: 8000000000000001");

	session.start()?;
	assert_eq!(session.status()?.state, CoreState::Running);

	// The reset sentinel gets no reply, the link carries on as before
	session.dmi().backend_mut().reset()?;
	assert_eq!(session.status()?.state, CoreState::Running);

	// The simulator keeps answering until the client that asked it to quit hangs up
	session.quit();
	assert_eq!(session.status()?.state, CoreState::Running);
	assert!(!sim.handle.is_finished());
	drop(session);
	assert!(sim.join().module().stat().is_none());
	Ok(())
}

#[test]
fn memory_words()
{
	let sim = spawn_sim(small_sim(), |_| ());
	let mut session = connect(&sim).unwrap();

	session.mem_write(0x1000, 0xdead_beef).unwrap();
	let words = session.mem_read_words(0x1000, 1).unwrap();
	assert_eq!(words.len(), 1);
	assert_eq!(words[0].to_string(), "0000000000001000: 00000000deadbeef");

	// WB_ADDR is only set once, consecutive reads rely on the auto-increment
	for (index, data) in [0x1111u64, 0x2222, 0x3333].into_iter().enumerate() {
		session.mem_write(0x2000 + index as u64 * 8, data).unwrap();
	}
	let words = session.mem_read_words(0x2000, 3).unwrap();
	let data: Vec<u64> = words.iter().map(|word| word.data).collect();
	assert_eq!(data, vec![0x1111, 0x2222, 0x3333]);
	assert_eq!(words[2].addr, 0x2010);

	let server = finish(session, sim);
	assert_eq!(server.module().read_word(0x1000), Some(0xdead_beef));
}

#[test]
fn gpr_names()
{
	let sim = spawn_sim(small_sim(), |server| {
		server.module_mut().set_gspr(3, 0x33);
		server.module_mut().set_gspr(32, 0x1234);
		server.module_mut().set_gspr(45, 0x45);
	});
	let mut session = connect(&sim).unwrap();

	let values = session.gpr_read(3, 1).unwrap();
	assert_eq!(values[0].to_string(), "r3:\t0000000000000033");
	let values = session.gpr_read(32, 1).unwrap();
	assert_eq!(values[0].to_string(), "lr:\t0000000000001234");
	let values = session.gpr_read(45, 1).unwrap();
	assert_eq!(values[0].to_string(), "gspr45:\t0000000000000045");

	// Clipped at the end of the register file
	assert_eq!(session.gpr_read(60, 10).unwrap().len(), 4);

	finish(session, sim);
}

#[test]
fn load_and_save_round_trip()
{
	let sim = spawn_sim(small_sim(), |_| ());
	let mut session = connect(&sim).unwrap();
	let dir = tempfile::tempdir().unwrap();

	let image: Vec<u8> = (1..=13).collect();
	let input = dir.path().join("image.bin");
	fs::write(&input, &image).unwrap();
	assert_eq!(session.load(&input, 0x3000).unwrap(), 16);

	let output = dir.path().join("saved.bin");
	// Leftovers from an earlier, larger save must not survive
	fs::write(&output, [0xaau8; 64]).unwrap();
	assert_eq!(session.save(&output, 0x3000, 13).unwrap(), 16);

	let mut expected = image.clone();
	expected.resize(16, 0);
	assert_eq!(fs::read(&output).unwrap(), expected);

	finish(session, sim);
}

#[test]
fn step_needs_a_stopped_core()
{
	let sim = spawn_sim(small_sim(), |_| ());
	let mut session = connect(&sim).unwrap();

	assert_eq!(session.step().unwrap(), StepOutcome::NotStopped);
	assert_eq!(session.status().unwrap().nia, 0);

	session.stop().unwrap();
	assert_eq!(session.step().unwrap(), StepOutcome::Stepped);
	assert_eq!(session.step().unwrap(), StepOutcome::Stepped);
	assert_eq!(session.status().unwrap().nia, 8);

	session.reset().unwrap();
	assert_eq!(session.status().unwrap().nia, 0);

	finish(session, sim);
}

#[test]
fn attn_terminates_the_core()
{
	let sim = spawn_sim(small_sim(), |server| {
		server.module_mut().load(0, &0x0000_0200u32.to_le_bytes());
	});
	let mut session = connect(&sim).unwrap();

	session.stop().unwrap();
	session.step().unwrap();
	let status = session.status().unwrap();
	assert_eq!(status.state, CoreState::Terminated);
	assert!(status.stat.contains(CoreStat::Term));

	finish(session, sim);
}

#[test]
fn log_dump_leaves_the_log_alone()
{
	let sim = spawn_sim(small_sim(), |_| ());
	let mut session = connect(&sim).unwrap();
	let dir = tempfile::tempdir().unwrap();

	session.log_start().unwrap();
	session.stop().unwrap();
	for _ in 0..3 {
		session.step().unwrap();
	}

	let first = dir.path().join("first.log");
	let second = dir.path().join("second.log");
	let info = session.log_dump(&first).unwrap();
	assert_eq!(info.geometry.entries, 16);
	assert_eq!(info.geometry.write_ptr, 3);
	assert_eq!(info.to_string(), "Log size = 16 entries\n512 done");
	// Still capturing, and pointing where it was
	assert_eq!(session.dmi_read(regs::LOG_ADDR).unwrap().data, info.log_addr);

	session.log_dump(&second).unwrap();
	let dump = fs::read(&first).unwrap();
	assert_eq!(dump, fs::read(&second).unwrap());
	assert_eq!(dump.len(), 16 * LOG_ENTRY_BYTES);

	// Oldest first, so the three steps are the last three entries
	let nias: Vec<u64> = dump
		.chunks_exact(LOG_ENTRY_BYTES)
		.skip(13)
		.map(|chunk| {
			let mut bytes = [0u8; LOG_ENTRY_BYTES];
			bytes.copy_from_slice(chunk);
			LogEntry::from_bytes(&bytes).nia()
		})
		.collect();
	assert_eq!(nias, vec![0, 4, 8]);

	let stopped = session.log_stop().unwrap();
	assert_eq!(stopped.to_string(), "Log size = 16 entries, write ptr = 3");

	let server = finish(session, sim);
	assert!(!server.module().log_capturing());
}

#[test]
fn busy_module_is_polled()
{
	let options = SimOptions {
		latency: 3,
		..small_sim()
	};
	let sim = spawn_sim(options, |_| ());

	let mut session = connect(&sim).unwrap();
	session.mem_write(0x100, 0x1234_5678).unwrap();
	assert_eq!(session.mem_read_words(0x100, 1).unwrap()[0].data, 0x1234_5678);
	drop(session);

	// A single poll can't outlast three busy replies
	let backend = SocketBackend::connect(Some(&sim.target())).unwrap();
	let mut session = DebugSession::with_policy(backend, RetryPolicy::default().with_max_polls(1));
	let error = session.dmi().read(regs::CORE_STAT).unwrap_err();
	assert!(matches!(error, DebugError::RetryLimit { polls: 1 }));
	drop(session);

	let mut session = connect(&sim).unwrap();
	// Soak up the leftover busy cycles before asking to quit
	session.status().unwrap();
	session.status().unwrap();
	finish(session, sim);
}

#[test]
fn jtag_over_remote_bitbang()
{
	let options = SimOptions {
		bitbang_port: Some(0),
		..small_sim()
	};
	let sim = spawn_sim(options, |_| ());

	let cable = RemoteBitbang::connect(Some(&sim.bitbang_target())).unwrap();
	let backend = JtagBackend::new(cable).unwrap();
	assert_eq!(backend.idcode(), IDCODE);

	let mut session = DebugSession::new(backend);
	session.stop().unwrap();
	assert_eq!(session.status().unwrap().state, CoreState::Stopped);
	session.mem_write(0x40, 0x0bad_cafe).unwrap();
	assert_eq!(session.mem_read_words(0x40, 1).unwrap()[0].data, 0x0bad_cafe);

	let server = finish(session, sim);
	assert_eq!(server.module().read_word(0x40), Some(0x0bad_cafe));
}
