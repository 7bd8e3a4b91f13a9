// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

mod common;

use std::net::TcpListener;
use std::process::{Command, Output};

use crate::common::{RunningSim, connect, finish, small_sim, spawn_sim};

const RUNNING_STATUS: &str = "Core: running\n NIA: 0000000000000000\n MSR: 8000000000000001\n";
const STOPPED_STATUS: &str = "Core: stopped\n NIA: 0000000000000000\n MSR: 8000000000000001\n";

fn mw_debug(target: &str, args: &[&str]) -> Output
{
	Command::new(env!("CARGO_BIN_EXE_mw_debug"))
		.args(["-b", "sim", "-t", target])
		.args(args)
		.env_remove("MW_DEBUG_BACKEND")
		.env_remove("MW_DEBUG_TARGET")
		.env_remove("RUST_LOG")
		.output()
		.expect("failed to run mw_debug")
}

fn run_against(sim: &RunningSim, args: &[&str]) -> (Output, String, String)
{
	let output = mw_debug(&sim.target(), args);
	let stdout = String::from_utf8(output.stdout.clone()).unwrap();
	let stderr = String::from_utf8(output.stderr.clone()).unwrap();
	(output, stdout, stderr)
}

/// A local port with nothing listening on it
fn closed_port() -> u16
{
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	listener.local_addr().unwrap().port()
}

#[test]
fn status_is_printed_once_at_the_end()
{
	let sim = spawn_sim(small_sim(), |_| ());

	let (output, stdout, _) = run_against(&sim, &["status", "stop", "status"]);
	assert!(output.status.success());
	assert_eq!(stdout, STOPPED_STATUS);

	finish(connect(&sim).unwrap(), sim);
}

#[test]
fn memory_write_then_read()
{
	let sim = spawn_sim(small_sim(), |_| ());

	let (output, stdout, _) = run_against(&sim, &["mw", "1000", "deadbeef", "mr", "1000", "1"]);
	assert!(output.status.success());
	assert_eq!(stdout, format!("0000000000001000: 00000000deadbeef\n{}", RUNNING_STATUS));

	let server = finish(connect(&sim).unwrap(), sim);
	assert_eq!(server.module().read_word(0x1000), Some(0xdead_beef));
}

#[test]
fn step_on_a_running_core()
{
	let sim = spawn_sim(small_sim(), |_| ());

	let (output, stdout, _) = run_against(&sim, &["step"]);
	assert!(output.status.success());
	assert_eq!(stdout, format!("Core not stopped !\n{}", RUNNING_STATUS));

	finish(connect(&sim).unwrap(), sim);
}

#[test]
fn quit_still_reports_status()
{
	let sim = spawn_sim(small_sim(), |_| ());

	let (output, stdout, stderr) = run_against(&sim, &["quit"]);
	assert!(output.status.success(), "stderr: {}", stderr);
	assert_eq!(stdout, RUNNING_STATUS);
	assert!(!stderr.contains("cut here"));

	// Hanging up after the quit is what lets the simulator go
	sim.join();
}

#[test]
fn options_after_commands_are_options()
{
	let sim = spawn_sim(small_sim(), |_| ());

	let (output, stdout, stderr) = run_against(&sim, &["stop", "-d", "status"]);
	assert!(output.status.success(), "stderr: {}", stderr);
	assert!(!stderr.contains("Unknown command"));
	assert_eq!(stdout, STOPPED_STATUS);

	finish(connect(&sim).unwrap(), sim);
}

#[test]
fn unknown_command_exits_without_usage()
{
	// Commands are all checked before the backend is opened
	let target = format!("127.0.0.1:{}", closed_port());
	let output = mw_debug(&target, &["stop", "bogus"]);
	let stderr = String::from_utf8(output.stderr).unwrap();
	assert_eq!(output.status.code(), Some(1));
	assert!(output.stdout.is_empty());
	assert!(stderr.contains("Unknown command bogus"));
	assert!(!stderr.contains("Commands:"));
}

#[test]
fn malformed_commands_show_usage()
{
	let target = format!("127.0.0.1:{}", closed_port());
	for (args, message) in [
		(&["mr"][..], "Missing address for mr"),
		(&["mw", "1000"][..], "Missing value for mw"),
		(&["mw", "1000", "xyz"][..], "Invalid value 'xyz' for mw"),
	] {
		let output = mw_debug(&target, args);
		let stderr = String::from_utf8(output.stderr).unwrap();
		assert_eq!(output.status.code(), Some(1), "{:?}", args);
		assert!(stderr.contains(message), "{:?}: {}", args, stderr);
		assert!(stderr.contains("Commands:"), "{:?}: {}", args, stderr);
	}
}

#[test]
fn transport_errors_are_one_line()
{
	let port = closed_port();
	let output = mw_debug(&format!("127.0.0.1:{}", port), &["status"]);
	let stderr = String::from_utf8(output.stderr).unwrap();
	assert_eq!(output.status.code(), Some(1));
	assert!(output.stdout.is_empty());
	let expected = format!("Error opening the sim backend: Connection to '127.0.0.1:{}' failed: ", port);
	assert!(stderr.lines().any(|line| line.starts_with(&expected)), "{}", stderr);
	assert!(!stderr.contains("cut here"));
	assert!(!stderr.contains("Backtrace"));
}
