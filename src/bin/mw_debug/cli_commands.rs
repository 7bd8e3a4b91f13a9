// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use std::path::PathBuf;

use color_eyre::eyre::Result;
use mw_debug::core::{DebugSession, StepOutcome};
use mw_debug::dmi::Backend;
use thiserror::Error;

pub const USAGE: &str = "\
Commands:

 CPU core:
  start
  stop
  step
  creset                   core reset
  icreset                  icache reset

 Memory:
  mr <hex addr> [count]
  mw <hex addr> <hex value>
  load <file> [addr]       If omitted address is 0
  save <file> <addr> <size>

 Registers:
  gpr <reg> [count]
  status

 Core logging:
  lstart                   start logging
  lstop                    stop logging
  ldump <file>             dump log to file

 JTAG:
  dmiread <hex addr>
  dmiwrite <hex addr> <hex value>
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugCommand
{
	DmiRead
	{
		addr: u8,
	},
	DmiWrite
	{
		addr: u8,
		data: u64,
	},
	CoreReset,
	IcacheReset,
	Stop,
	Start,
	Step,
	Quit,
	Status,
	MemRead
	{
		addr: u64,
		count: u64,
	},
	MemWrite
	{
		addr: u64,
		data: u64,
	},
	Load
	{
		file: PathBuf,
		addr: u64,
	},
	Save
	{
		file: PathBuf,
		addr: u64,
		size: u64,
	},
	Gpr
	{
		reg: u64,
		count: u64,
	},
	LogStart,
	LogStop,
	LogDump
	{
		file: PathBuf,
	},
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError
{
	#[error("Unknown command {0}")]
	Unknown(String),
	#[error("Missing {what} for {command}")]
	MissingArgument
	{
		command: &'static str,
		what: &'static str,
	},
	#[error("Invalid {what} '{value}' for {command}")]
	BadNumber
	{
		command: &'static str,
		what: &'static str,
		value: String,
	},
}

impl CommandError
{
	/// Malformed arguments get the usage text, an unknown command just the error
	pub fn wants_usage(&self) -> bool
	{
		!matches!(self, Self::Unknown(_))
	}
}

/// Walks the command list handing out arguments
struct Arguments<'a>
{
	args: &'a [String],
	position: usize,
	command: &'static str,
}

impl<'a> Arguments<'a>
{
	fn next_word(&mut self) -> Option<&'a str>
	{
		let word = self.args.get(self.position)?;
		self.position += 1;
		Some(word)
	}

	fn required(&mut self, what: &'static str) -> Result<&'a str, CommandError>
	{
		self.next_word().ok_or(CommandError::MissingArgument {
			command: self.command,
			what,
		})
	}

	/// An optional number is only taken if the next word looks like one
	fn optional(&mut self) -> Option<&'a str>
	{
		let word = self.args.get(self.position)?;
		if word.starts_with(|c: char| c.is_ascii_digit()) {
			self.position += 1;
			Some(word)
		} else {
			None
		}
	}

	fn bad_number(&self, what: &'static str, value: &str) -> CommandError
	{
		CommandError::BadNumber {
			command: self.command,
			what,
			value: value.into(),
		}
	}

	fn hex(&self, what: &'static str, value: &str) -> Result<u64, CommandError>
	{
		let digits = value
			.strip_prefix("0x")
			.or_else(|| value.strip_prefix("0X"))
			.unwrap_or(value);
		u64::from_str_radix(digits, 16).map_err(|_| self.bad_number(what, value))
	}

	fn hex_u8(&self, what: &'static str, value: &str) -> Result<u8, CommandError>
	{
		u8::try_from(self.hex(what, value)?).map_err(|_| self.bad_number(what, value))
	}

	fn decimal(&self, what: &'static str, value: &str) -> Result<u64, CommandError>
	{
		value.parse::<u64>().map_err(|_| self.bad_number(what, value))
	}
}

/// Parse the whole command list up front, so nothing runs if any of it is malformed
pub fn parse_commands(args: &[String]) -> Result<Vec<DebugCommand>, CommandError>
{
	let mut arguments = Arguments {
		args,
		position: 0,
		command: "",
	};
	let mut commands = Vec::new();
	while let Some(word) = arguments.next_word() {
		let command = match word {
			"dmiread" => {
				arguments.command = "dmiread";
				let addr = arguments.required("address")?;
				DebugCommand::DmiRead {
					addr: arguments.hex_u8("address", addr)?,
				}
			},
			"dmiwrite" => {
				arguments.command = "dmiwrite";
				let addr = arguments.required("address")?;
				let data = arguments.required("value")?;
				DebugCommand::DmiWrite {
					addr: arguments.hex_u8("address", addr)?,
					data: arguments.hex("value", data)?,
				}
			},
			"creset" => DebugCommand::CoreReset,
			"icreset" => DebugCommand::IcacheReset,
			"stop" => DebugCommand::Stop,
			"start" => DebugCommand::Start,
			"step" => DebugCommand::Step,
			"quit" => DebugCommand::Quit,
			"status" => DebugCommand::Status,
			"mr" => {
				arguments.command = "mr";
				let addr = arguments.required("address")?;
				let addr = arguments.hex("address", addr)?;
				let count = match arguments.optional() {
					Some(count) => arguments.hex("count", count)?,
					None => 1,
				};
				DebugCommand::MemRead {
					addr,
					count,
				}
			},
			"mw" => {
				arguments.command = "mw";
				let addr = arguments.required("address")?;
				let data = arguments.required("value")?;
				DebugCommand::MemWrite {
					addr: arguments.hex("address", addr)?,
					data: arguments.hex("value", data)?,
				}
			},
			"load" => {
				arguments.command = "load";
				let file = arguments.required("file")?;
				let addr = match arguments.optional() {
					Some(addr) => arguments.hex("address", addr)?,
					None => 0,
				};
				DebugCommand::Load {
					file: file.into(),
					addr,
				}
			},
			"save" => {
				arguments.command = "save";
				let file = arguments.required("file")?;
				let addr = arguments.required("address")?;
				let size = arguments.required("size")?;
				DebugCommand::Save {
					file: file.into(),
					addr: arguments.hex("address", addr)?,
					size: arguments.hex("size", size)?,
				}
			},
			"gpr" => {
				arguments.command = "gpr";
				let reg = arguments.required("register")?;
				let reg = arguments.decimal("register", reg)?;
				let count = match arguments.optional() {
					Some(count) => arguments.decimal("count", count)?,
					None => 1,
				};
				DebugCommand::Gpr {
					reg,
					count,
				}
			},
			"lstart" => DebugCommand::LogStart,
			"lstop" => DebugCommand::LogStop,
			"ldump" => {
				arguments.command = "ldump";
				let file = arguments.required("file")?;
				DebugCommand::LogDump {
					file: file.into(),
				}
			},
			other => return Err(CommandError::Unknown(other.into())),
		};
		commands.push(command);
	}
	Ok(commands)
}

/// Run one command, printing its results
pub fn run_command<B: Backend>(session: &mut DebugSession<B>, command: &DebugCommand) -> Result<()>
{
	match command {
		DebugCommand::DmiRead {
			addr,
		} => println!("{}", session.dmi_read(*addr)?),
		DebugCommand::DmiWrite {
			addr,
			data,
		} => session.dmi_write(*addr, *data)?,
		DebugCommand::CoreReset => session.reset()?,
		DebugCommand::IcacheReset => session.icache_reset()?,
		DebugCommand::Stop => session.stop()?,
		DebugCommand::Start => session.start()?,
		DebugCommand::Step => {
			if session.step()? == StepOutcome::NotStopped {
				println!("Core not stopped !");
			}
		},
		DebugCommand::Quit => session.quit(),
		// The status is always shown once everything else is done
		DebugCommand::Status => (),
		DebugCommand::MemRead {
			addr,
			count,
		} => session.mem_read(*addr, *count, |word| println!("{}", word))?,
		DebugCommand::MemWrite {
			addr,
			data,
		} => session.mem_write(*addr, *data)?,
		DebugCommand::Load {
			file,
			addr,
		} => println!("{:x} done.", session.load(file, *addr)?),
		DebugCommand::Save {
			file,
			addr,
			size,
		} => println!("{:x} done.", session.save(file, *addr, *size)?),
		DebugCommand::Gpr {
			reg,
			count,
		} => {
			for value in session.gpr_read(*reg, *count)? {
				println!("{}", value);
			}
		},
		DebugCommand::LogStart => session.log_start()?,
		DebugCommand::LogStop => println!("{}", session.log_stop()?),
		DebugCommand::LogDump {
			file,
		} => println!("{}", session.log_dump(file)?),
	}
	Ok(())
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn parse(line: &str) -> Result<Vec<DebugCommand>, CommandError>
	{
		let args: Vec<String> = line.split_whitespace().map(String::from).collect();
		parse_commands(&args)
	}

	#[test]
	fn simple_commands()
	{
		assert_eq!(
			parse("stop step start creset icreset status lstart lstop quit").unwrap(),
			vec![
				DebugCommand::Stop,
				DebugCommand::Step,
				DebugCommand::Start,
				DebugCommand::CoreReset,
				DebugCommand::IcacheReset,
				DebugCommand::Status,
				DebugCommand::LogStart,
				DebugCommand::LogStop,
				DebugCommand::Quit,
			]
		);
		assert_eq!(parse("").unwrap(), vec![]);
	}

	#[test]
	fn optional_arguments_need_a_leading_digit()
	{
		assert_eq!(
			parse("mr 1000 stop").unwrap(),
			vec![
				DebugCommand::MemRead {
					addr: 0x1000,
					count: 1,
				},
				DebugCommand::Stop,
			]
		);
		assert_eq!(
			parse("mr 0x1000 10").unwrap(),
			vec![DebugCommand::MemRead {
				addr: 0x1000,
				count: 0x10,
			}]
		);
		assert_eq!(
			parse("load image.bin status").unwrap(),
			vec![
				DebugCommand::Load {
					file: "image.bin".into(),
					addr: 0,
				},
				DebugCommand::Status,
			]
		);
	}

	#[test]
	fn gpr_numbers_are_decimal()
	{
		assert_eq!(
			parse("gpr 32 10").unwrap(),
			vec![DebugCommand::Gpr {
				reg: 32,
				count: 10,
			}]
		);
		assert!(matches!(parse("gpr 1f"), Err(CommandError::BadNumber { .. })));
	}

	#[test]
	fn values_are_hex()
	{
		assert_eq!(
			parse("mw 1000 deadbeef dmiwrite 10 1 dmiread 0x11").unwrap(),
			vec![
				DebugCommand::MemWrite {
					addr: 0x1000,
					data: 0xdead_beef,
				},
				DebugCommand::DmiWrite {
					addr: 0x10,
					data: 1,
				},
				DebugCommand::DmiRead {
					addr: 0x11,
				},
			]
		);
		assert_eq!(
			parse("save out.bin 0 100").unwrap(),
			vec![DebugCommand::Save {
				file: "out.bin".into(),
				addr: 0,
				size: 0x100,
			}]
		);
	}

	#[test]
	fn malformed_lists()
	{
		let error = parse("stop frobnicate").unwrap_err();
		assert_eq!(error, CommandError::Unknown("frobnicate".into()));
		assert!(!error.wants_usage());
		assert_eq!(error.to_string(), "Unknown command frobnicate");

		let error = parse("mw 1000").unwrap_err();
		assert!(matches!(error, CommandError::MissingArgument { command: "mw", .. }));
		assert!(error.wants_usage());
		assert!(matches!(parse("save out.bin 0"), Err(CommandError::MissingArgument { .. })));
		assert!(matches!(parse("mr xyz"), Err(CommandError::BadNumber { .. })));
		assert!(matches!(parse("dmiread 100"), Err(CommandError::BadNumber { .. })));
	}
}
