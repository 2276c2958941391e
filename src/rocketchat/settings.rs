use std::{collections::HashMap, fmt, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use url::Url;

use crate::{alert_renderer::TemplateSettings, dispatcher::RetrySettings, settings::ConfigError};

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
/// Rocket.Chat specific settings
pub struct RocketChatSettings {
	pub endpoint: Url,
	pub credentials: Credentials,
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	#[serde(default = "default_request_timeout")]
	pub request_timeout: Duration,
	/// a list instead of a map, config keys lose their case while loading
	#[serde(default)]
	pub severity_colors: Vec<SeverityColor>,
	/// lower-case severities before looking up their color
	#[serde(default)]
	pub severity_case_insensitive: bool,
	#[serde(default)]
	pub channel: ChannelSettings,
	#[serde(default)]
	pub retry: RetrySettings,
	#[serde(default)]
	pub templates: TemplateSettings,
}

fn default_request_timeout() -> Duration {
	Duration::from_secs(10)
}

impl RocketChatSettings {
	/// severity to color code mapping as given in the config file
	pub fn color_map(&self) -> HashMap<String, String> {
		self.severity_colors
			.iter()
			.map(|SeverityColor { severity, color }| (severity.clone(), color.clone()))
			.collect()
	}

	/// check that everything needed to log in and to pick a channel is there
	pub fn validate(&self) -> Result<(), ConfigError> {
		let Credentials { name, email, password } = &self.credentials;

		if name.is_empty() {
			return Err(ConfigError::MissingName);
		}
		if email.is_empty() {
			return Err(ConfigError::MissingEmail);
		}
		if password.is_empty() {
			return Err(ConfigError::MissingPassword);
		}
		if self.endpoint.host_str().map_or(true, str::is_empty) {
			return Err(ConfigError::MissingHost);
		}
		if self.endpoint.scheme().is_empty() {
			return Err(ConfigError::MissingScheme);
		}
		if self.channel.default_channel_name.is_empty() {
			return Err(ConfigError::DefaultChannelNotDefined);
		}

		Ok(())
	}
}

#[derive(Deserialize, Clone)]
pub struct Credentials {
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub email: String,
	#[serde(default)]
	pub password: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("name", &self.name)
			.field("email", &self.email)
			.field("password", &"<redacted>")
			.finish()
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SeverityColor {
	pub severity: String,
	pub color: String,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ChannelSettings {
	#[serde(default)]
	pub default_channel_name: String,
}
