//! Renders alerts into Rocket.Chat messages via tera templates.
//!
//! Alerts are received from the [Dispatcher](crate::dispatcher::Dispatcher),
//! one at a time. Rendering never fails: a template error is rendered into the
//! message instead.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::Deserialize;
use tera::Tera;

use crate::{
	alert::Alert,
	rocketchat::{Attachment, AttachmentField, Channel},
};

/// attachment color of resolved alerts, regardless of severity
pub const RESOLVED_COLOR: &str = "#00994c";

/// attachment color of alerts with an unknown severity
pub const DEFAULT_COLOR: &str = "#ffffff";

pub const SEVERITY_LABEL: &str = "severity";

/// labels consumed by the message body
const HIDDEN_LABELS: [&str; 2] = ["alertname", SEVERITY_LABEL];

/// annotations consumed by the message body and attachment text
const HIDDEN_ANNOTATIONS: [&str; 3] = ["description", "message", "summary"];

pub const DEFAULT_BODY_TEMPLATE: &str = "**{{ labels.alertname }}**: [**{{ labels.severity }}**] {{ annotations.summary }} {% if annotations.message %}| {{ annotations.message }}{% endif %}";

pub const DEFAULT_ATTACHMENT_TEMPLATE: &str = "{{ annotations.description }}";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// templates for the message body and the attachment text
pub struct TemplateSettings {
	pub body: String,
	pub attachment: String,
}

impl Default for TemplateSettings {
	fn default() -> Self {
		Self {
			body: DEFAULT_BODY_TEMPLATE.to_owned(),
			attachment: DEFAULT_ATTACHMENT_TEMPLATE.to_owned(),
		}
	}
}

/// configured severity to color code mapping
#[derive(Debug, Clone, Default)]
pub struct SeverityColors {
	colors: HashMap<String, String>,
	case_insensitive: bool,
}

impl SeverityColors {
	pub fn new(colors: HashMap<String, String>, case_insensitive: bool) -> Self {
		let colors = if case_insensitive {
			colors.into_iter().map(|(severity, color)| (severity.to_lowercase(), color)).collect()
		} else {
			colors
		};

		Self { colors, case_insensitive }
	}

	pub fn get(&self, severity: &str) -> Option<&str> {
		if self.case_insensitive {
			self.colors.get(&severity.to_lowercase())
		} else {
			self.colors.get(severity)
		}
		.map(String::as_str)
	}
}

/// a rendered alert bound to its target channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedMessage {
	pub channel: Channel,
	pub body: String,
	pub attachment: Attachment,
}

/// Alert renderer
pub struct AlertRenderer {
	tera: Tera,
	colors: SeverityColors,
}

impl AlertRenderer {
	/// compile templates, fails if one of them doesn't parse
	pub fn new(templates: &TemplateSettings, colors: SeverityColors) -> Result<Self> {
		let mut tera = Tera::default();

		tera.add_raw_template("body", &templates.body)
			.context("cannot parse alert body template")?;
		tera.add_raw_template("attachment", &templates.attachment)
			.context("cannot parse alert attachment template")?;

		Ok(Self { tera, colors })
	}

	/// Renders `alert` into a message for `channel`.
	///
	/// # Arguments
	///
	/// * `alert` - the alert to render
	///
	/// * `receiver` - name of the alertmanager receiver, available to templates
	///
	/// * `channel` - resolved target channel
	pub fn render(&self, alert: &Alert, receiver: &str, channel: &Channel) -> FormattedMessage {
		let context = template_context(alert, receiver);

		let body = self.render_template("body", &context);
		let text = self.render_template("attachment", &context);

		let fields =
			format_fields(&alert.labels).chain(format_fields(&alert.annotations)).collect();

		FormattedMessage {
			channel: channel.clone(),
			body,
			attachment: Attachment { color: self.color(alert).to_owned(), text, fields },
		}
	}

	fn color(&self, alert: &Alert) -> &str {
		if alert.is_resolved() {
			return RESOLVED_COLOR;
		}

		self.colors.get(alert.label(SEVERITY_LABEL)).unwrap_or(DEFAULT_COLOR)
	}

	fn render_template(&self, name: &str, context: &tera::Context) -> String {
		self.tera.render(name, context).unwrap_or_else(|err| {
			tracing::warn!("failed to render alert {name}: {err:?}");
			format!("failed to render alert {name}: {err:?}")
		})
	}
}

/// copy of `pairs` where every key in `consumed` is present
fn with_consumed(pairs: &BTreeMap<String, String>, consumed: &[&str]) -> BTreeMap<String, String> {
	let mut pairs = pairs.clone();
	for name in consumed {
		pairs.entry((*name).to_owned()).or_default();
	}
	pairs
}

/// template context with every consumed key present
fn template_context(alert: &Alert, receiver: &str) -> tera::Context {
	let mut context = tera::Context::new();
	context.insert("labels", &with_consumed(&alert.labels, &HIDDEN_LABELS));
	context.insert("annotations", &with_consumed(&alert.annotations, &HIDDEN_ANNOTATIONS));
	context.insert("status", &alert.status);
	context.insert("receiver", receiver);
	context.insert("starts_at", &alert.starts_at);
	context.insert("ends_at", &alert.ends_at);
	context.insert("generator_url", &alert.generator_url);
	context.insert("fingerprint", &alert.fingerprint);
	context
}

/// keys consumed by the body or attachment text are never shown as fields,
/// whether they come from labels or annotations
fn is_hidden(name: &str) -> bool {
	HIDDEN_LABELS.contains(&name) || HIDDEN_ANNOTATIONS.contains(&name)
}

/// attachment fields in key order, skipping hidden keys
fn format_fields(pairs: &BTreeMap<String, String>) -> impl Iterator<Item = AttachmentField> + '_ {
	pairs.iter().filter(|(name, _)| !is_hidden(name)).map(|(name, value)| AttachmentField {
		short: true,
		title: format!("**{name}**"),
		value: value.clone(),
	})
}
