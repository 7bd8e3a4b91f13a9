// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

mod cli_commands;

use std::io::{IsTerminal, stdout};
use std::process::ExitCode;
use std::time::Duration;

use clap::builder::styling::Styles;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, crate_description, crate_version};
use clap_complete::{Shell, generate};
use color_eyre::config::HookBuilder;
use color_eyre::eyre::{Context, Report, Result};
use log::debug;
use mw_debug::backend::{self, BackendKind};
use mw_debug::core::DebugSession;
use mw_debug::retry::RetryPolicy;
use owo_colors::OwoColorize;

use crate::cli_commands::{DebugCommand, USAGE, parse_commands, run_command};

#[derive(Parser)]
#[command(
	version,
	about = format!("{} v{}", crate_description!(), crate_version!()),
	styles(style()),
	disable_colored_help(false),
	after_help = USAGE
)]
struct CliArguments
{
	#[arg(
		short = 'b',
		long = "backend",
		env = "MW_DEBUG_BACKEND",
		required_unless_present = "completions"
	)]
	/// How to reach the debug module
	backend: Option<BackendKind>,
	#[arg(short = 't', long = "target", env = "MW_DEBUG_TARGET")]
	/// host[:port] of the simulator, or the JTAG cable parameters
	target: Option<String>,
	#[arg(short = 'd', long = "debug")]
	/// Enable debug output
	debug: bool,
	#[arg(long = "poll-limit", value_name = "POLLS")]
	/// Give up on a DMI operation after this many busy polls
	poll_limit: Option<u64>,
	#[arg(long = "poll-timeout-ms", value_name = "MILLISECONDS")]
	/// Give up on a DMI operation after this long
	poll_timeout_ms: Option<u64>,
	#[arg(long = "completions", value_name = "SHELL")]
	/// Print shell completions and exit
	completions: Option<Shell>,

	#[arg(value_name = "COMMANDS")]
	/// Commands to run, in order. Options may be given anywhere on the line, use `--` before a
	/// command argument that starts with a dash.
	commands: Vec<String>,
}

impl CliArguments
{
	fn retry_policy(&self) -> RetryPolicy
	{
		let mut policy = RetryPolicy::default();
		if let Some(polls) = self.poll_limit {
			policy = policy.with_max_polls(polls);
		}
		if let Some(timeout) = self.poll_timeout_ms {
			policy = policy.with_timeout(Duration::from_millis(timeout));
		}
		policy
	}
}

type PanicHookFunc = Box<dyn Fn(&std::panic::PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Wraps color-eyre's panic report in a banner asking for it to be passed on. Errors don't get
/// this, they are reported as a plain one-line diagnostic.
struct MwDebugPanic
{
	inner_hook: PanicHookFunc,
}

impl MwDebugPanic
{
	pub fn install(self)
	{
		std::panic::set_hook(Box::new(move |panic_info| {
			eprintln!("------------[ ✂ cut here ✂ ]------------");
			eprintln!("Unhandled crash in mw_debug v{}", crate_version!());
			eprintln!();
			(*self.inner_hook)(panic_info);
			eprintln!();
			eprintln!("{}", "Please include all lines down to this one from the cut here".yellow());
			eprintln!("{}", "marker when reporting this issue".yellow());
		}));
	}
}

fn install_error_handler() -> Result<()>
{
	let (panic_hook, eyre_hook) = HookBuilder::default().try_into_hooks()?;
	MwDebugPanic {
		inner_hook: panic_hook.into_panic_hook(),
	}
	.install();
	eyre_hook.install()?;
	Ok(())
}

/// `Error <what we were doing>: <why it failed>`, one line, cause chain included
fn error_message(error: &Report) -> String
{
	let mut message = format!("Error {}", error);
	for cause in error.chain().skip(1) {
		message.push_str(": ");
		message.push_str(&cause.to_string());
	}
	message
}

/// Clap v3 style (approximate)
/// See https://stackoverflow.com/a/75343828
fn style() -> clap::builder::Styles
{
	Styles::styled()
		.usage(
			anstyle::Style::new()
				.fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow)))
				.bold(),
		)
		.header(
			anstyle::Style::new()
				.bold()
				.fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
		)
		.literal(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))))
}

fn usage()
{
	eprintln!("{}", CliArguments::command().render_usage());
	eprintln!();
	eprintln!("{}", USAGE);
}

fn main() -> Result<ExitCode>
{
	install_error_handler()?;

	// Malformed invocations exit with 1 rather than clap's usual 2
	let cli_args = match CliArguments::try_parse() {
		Ok(cli_args) => cli_args,
		Err(error) => {
			let _ = error.print();
			return Ok(match error.kind() {
				ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
				_ => ExitCode::FAILURE,
			});
		},
	};

	env_logger::Builder::new()
		.filter_level(if cli_args.debug {
			log::LevelFilter::Debug
		} else {
			log::LevelFilter::Info
		})
		.parse_default_env()
		.init();

	if let Some(shell) = cli_args.completions {
		generate(shell, &mut CliArguments::command(), "mw_debug", &mut stdout());
		return Ok(ExitCode::SUCCESS);
	}

	let commands = match parse_commands(&cli_args.commands) {
		Ok(commands) => commands,
		Err(error) => {
			eprintln!("{}", error);
			if error.wants_usage() {
				usage();
			}
			return Ok(ExitCode::FAILURE);
		},
	};

	// Guaranteed by clap unless completions were asked for
	let Some(kind) = cli_args.backend else {
		usage();
		return Ok(ExitCode::FAILURE);
	};

	match run(&cli_args, kind, &commands) {
		Ok(()) => Ok(ExitCode::SUCCESS),
		Err(error) => {
			debug!("{:?}", error);
			eprintln!("{}", error_message(&error));
			Ok(ExitCode::FAILURE)
		},
	}
}

/// Open the backend, run every command in order and finish with the core status
fn run(cli_args: &CliArguments, kind: BackendKind, commands: &[DebugCommand]) -> Result<()>
{
	let backend =
		backend::open(kind, cli_args.target.as_deref()).wrap_err_with(|| format!("opening the {} backend", kind))?;

	let policy = cli_args.retry_policy();
	debug!("Retry policy: {:?}", policy);
	let mut session = DebugSession::with_policy(backend, policy).with_progress(stdout().is_terminal());

	for command in commands {
		run_command(&mut session, command)?;
	}

	println!("{}", session.status()?);
	Ok(())
}

#[cfg(test)]
mod tests
{
	use color_eyre::eyre::eyre;
	use mw_debug::error::DebugError;

	use super::*;

	#[test]
	fn options_after_commands()
	{
		let args = CliArguments::try_parse_from(["mw_debug", "-b", "sim", "stop", "-d", "mr", "1000", "--poll-limit", "5", "2"])
			.unwrap();
		assert!(args.debug);
		assert_eq!(args.poll_limit, Some(5));
		assert_eq!(args.commands, vec!["stop", "mr", "1000", "2"]);

		// Everything after `--` is a command word
		let args = CliArguments::try_parse_from(["mw_debug", "-b", "sim", "--", "load", "-image.bin"]).unwrap();
		assert!(!args.debug);
		assert_eq!(args.commands, vec!["load", "-image.bin"]);
	}

	#[test]
	fn error_message_is_one_line()
	{
		let error = Report::new(DebugError::Disconnected).wrap_err("stopping core");
		assert_eq!(error_message(&error), format!("Error stopping core: {}", DebugError::Disconnected));
		assert_eq!(error_message(&eyre!("reading WB_DATA")), "Error reading WB_DATA");
	}
}
