//! data structures for deserializing incoming alerts
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// status of a resolved alert, every other value counts as firing
pub const RESOLVED_STATUS: &str = "resolved";

/// common label overriding the configured default channel
pub const CHANNEL_NAME_LABEL: &str = "channel_name";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// data from prometheus received by the alertmanager webhook receiver
#[allow(clippy::missing_docs_in_private_items)]
pub struct AlertBatch {
	pub version: String,
	pub group_key: String,
	pub truncated_alerts: u64,

	pub receiver: String,
	pub status: String,
	pub alerts: Vec<Alert>,
	pub group_labels: BTreeMap<String, String>,
	pub common_labels: BTreeMap<String, String>,
	pub common_annotations: BTreeMap<String, String>,
	#[serde(rename = "externalURL")]
	pub external_url: String,
}

impl AlertBatch {
	/// channel requested by the `channel_name` common label, empty values are
	/// ignored
	pub fn channel_name(&self) -> Option<&str> {
		self.common_labels
			.get(CHANNEL_NAME_LABEL)
			.map(String::as_str)
			.filter(|name| !name.is_empty())
	}
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::missing_docs_in_private_items)]
pub struct Alert {
	pub status: String,
	pub labels: BTreeMap<String, String>,
	pub annotations: BTreeMap<String, String>,
	pub starts_at: Option<DateTime<Utc>>,
	pub ends_at: Option<DateTime<Utc>>,
	#[serde(rename = "generatorURL")]
	pub generator_url: String,
	pub fingerprint: String,
}

impl Alert {
	pub fn is_resolved(&self) -> bool {
		self.status == RESOLVED_STATUS
	}

	/// label value, absent labels read as empty
	pub fn label(&self, name: &str) -> &str {
		self.labels.get(name).map_or("", String::as_str)
	}
}
