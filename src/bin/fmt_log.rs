// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write, stdin, stdout};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, crate_version};
use color_eyre::eyre::{Context, Result};
use log::warn;
use mw_debug::trace::{LOG_ENTRY_BYTES, LogEntry, LogFormatter};

#[derive(Parser)]
#[command(
	version,
	about = format!("Microwatt execution log formatter v{}", crate_version!()),
	disable_colored_help(false)
)]
struct FmtLogArguments
{
	/// Log dump to read, standard input if omitted
	file: Option<PathBuf>,
}

/// Fill `entry` from the reader. Returns false at the end of the input.
fn read_entry(reader: &mut impl Read, entry: &mut [u8; LOG_ENTRY_BYTES]) -> Result<bool>
{
	let mut filled = 0;
	while filled < entry.len() {
		match reader.read(&mut entry[filled..]) {
			Ok(0) => break,
			Ok(count) => filled += count,
			Err(error) if error.kind() == ErrorKind::Interrupted => (),
			Err(error) => return Err(error).wrap_err("reading log"),
		}
	}
	if filled != 0 && filled != entry.len() {
		warn!("Ignoring {} trailing bytes of a partial log entry", filled);
	}
	Ok(filled == entry.len())
}

fn format_log(reader: impl Read, writer: &mut impl Write) -> Result<()>
{
	let mut reader = BufReader::new(reader);
	let mut formatter = LogFormatter::new();
	let mut entry = [0u8; LOG_ENTRY_BYTES];
	while read_entry(&mut reader, &mut entry)? {
		write!(writer, "{}", formatter.format_entry(&LogEntry::from_bytes(&entry)))?;
	}
	writeln!(writer, "{}", formatter.summary())?;
	Ok(())
}

fn main() -> Result<ExitCode>
{
	color_eyre::install()?;
	env_logger::Builder::new()
		.filter_level(log::LevelFilter::Info)
		.parse_default_env()
		.init();

	let args = match FmtLogArguments::try_parse() {
		Ok(args) => args,
		Err(error) => {
			let _ = error.print();
			return Ok(match error.kind() {
				ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => ExitCode::SUCCESS,
				_ => ExitCode::FAILURE,
			});
		},
	};

	let mut out = BufWriter::new(stdout().lock());
	match &args.file {
		Some(path) => {
			let file = File::open(path).wrap_err_with(|| format!("Failed to open {}", path.display()))?;
			format_log(file, &mut out)?;
		},
		None => format_log(stdin().lock(), &mut out)?,
	}
	out.flush()?;
	Ok(ExitCode::SUCCESS)
}
