use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use config::{Config, Environment};
use serde::Deserialize;
use thiserror::Error;

use crate::{log::LogSettings, rocketchat::RocketChatSettings};

/// errors in an otherwise well-formed config file, checked before startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("rocket.chat name not provided")]
	MissingName,
	#[error("rocket.chat email not provided")]
	MissingEmail,
	#[error("rocket.chat password not provided")]
	MissingPassword,
	#[error("rocket.chat host not provided")]
	MissingHost,
	#[error("rocket.chat scheme not provided")]
	MissingScheme,
	#[error("default Rocket.Chat channel name is not defined in configuration")]
	DefaultChannelNotDefined,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub log: LogSettings,
	/// address of the webhook and metrics endpoint
	#[serde(default = "default_listen_address")]
	pub listen_address: SocketAddr,
	pub rocketchat: RocketChatSettings,
}

fn default_listen_address() -> SocketAddr {
	SocketAddr::from(([0, 0, 0, 0], 9876))
}

fn environment() -> Environment {
	Environment::with_prefix("HOWLER").prefix_separator("_").separator("__")
}

impl Settings {
	/// parse command line arguments and load the config file they point to
	pub fn load() -> Result<Self> {
		let opts = Command::new(clap::crate_name!())
			.version(clap::crate_version!())
			.about(clap::crate_description!())
			.author(clap::crate_authors!())
			.args([
				Arg::new("config")
					.help("path of config file")
					.short('c')
					.long("config.file")
					.default_value("config/rocketchat.yml"),
				Arg::new("listen")
					.help("the address to listen on for HTTP requests")
					.long("listen.address")
					.value_parser(value_parser!(SocketAddr)),
				Arg::new("level")
					.help("log level")
					.value_parser(["error", "warn", "info", "debug", "trace"])
					.ignore_case(true)
					.long("log"),
			])
			.get_matches();

		let config_path =
			opts.get_one::<String>("config").context("config path has a default value")?;

		let mut settings = Self::from_file(config_path)?;

		if let Some(listen) = opts.get_one::<SocketAddr>("listen") {
			settings.listen_address = *listen;
		}

		if let Some(level) = opts.get_one::<String>("level") {
			settings.log.level = level.clone();
		}

		Ok(settings)
	}

	/// Loads and validates settings from `path`. Environment variables
	/// prefixed with `HOWLER_` override values from the file, nested keys are
	/// separated by `__`, e.g. `HOWLER_ROCKETCHAT__CREDENTIALS__PASSWORD`.
	pub fn from_file(path: &str) -> Result<Self> {
		Self::from_sources(path, environment())
	}

	fn from_sources(path: &str, environment: Environment) -> Result<Self> {
		let settings: Self = Config::builder()
			.add_source(config::File::with_name(path))
			.add_source(environment)
			.build()
			.context(format!("can't load config {path}"))?
			.try_deserialize()
			.context(format!("can't load config {path}"))?;

		settings.rocketchat.validate().context("missing Rocket.Chat config parameters")?;

		Ok(settings)
	}
}
