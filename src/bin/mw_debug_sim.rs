// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use std::path::PathBuf;

use clap::builder::styling::Styles;
use clap::{Parser, crate_version};
use color_eyre::eyre::{Context, Result, eyre};
use log::info;
use mw_debug::backend::socket::DEFAULT_SIM_PORT;
use mw_debug::sim::model::SimConfig;
use mw_debug::sim::{SimOptions, SimServer};

#[derive(Parser)]
#[command(
	version,
	about = format!("Microwatt debug module simulator v{}", crate_version!()),
	styles(style()),
	disable_colored_help(false)
)]
struct SimArguments
{
	#[arg(short = 'p', long = "port", default_value_t = DEFAULT_SIM_PORT)]
	/// TCP port for the debug socket
	port: u16,
	#[arg(long = "bitbang-port")]
	/// Also serve JTAG over the remote-bitbang protocol on this port
	bitbang_port: Option<u16>,
	#[arg(long = "latency", default_value_t = 0)]
	/// Number of busy replies before each DMI operation completes
	latency: u32,
	#[arg(long = "log-entries", default_value_t = 256)]
	/// Size of the execution log ring, must be a power of two
	log_entries: u64,
	#[arg(long = "mem-size", default_value_t = 1024 * 1024)]
	/// Bytes of simulated memory
	mem_size: usize,
	#[arg(long = "reset-vector", default_value_t = 0, value_parser = parse_hex)]
	/// NIA after a core reset, in hex
	reset_vector: u64,
	#[arg(long = "image")]
	/// Binary to preload at address 0
	image: Option<PathBuf>,
	#[arg(short = 'd', long = "debug")]
	/// Enable debug output
	debug: bool,
}

fn parse_hex(value: &str) -> Result<u64, std::num::ParseIntError>
{
	u64::from_str_radix(value.trim_start_matches("0x"), 16)
}

/// Clap v3 style (approximate)
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

fn main() -> Result<()>
{
	color_eyre::install()?;
	let args = SimArguments::parse();
	env_logger::Builder::new()
		.filter_level(if args.debug {
			log::LevelFilter::Debug
		} else {
			log::LevelFilter::Info
		})
		.parse_default_env()
		.init();

	if !args.log_entries.is_power_of_two() {
		return Err(eyre!("Log size must be a power of two, not {}", args.log_entries));
	}

	let options = SimOptions {
		port: args.port,
		bitbang_port: args.bitbang_port,
		latency: args.latency,
		model: SimConfig {
			log_entries: args.log_entries,
			mem_size: args.mem_size,
			reset_vector: args.reset_vector,
		},
	};
	let mut server = SimServer::bind(options).wrap_err("Failed to open the debug sockets")?;

	if let Some(image) = &args.image {
		let data = std::fs::read(image).wrap_err_with(|| format!("Failed to read {}", image.display()))?;
		info!("Loading {} bytes from {}", data.len(), image.display());
		server.module_mut().load(0, &data);
	}

	server.run();
	Ok(())
}
