//! Sends a batch of alerts to Rocket.Chat.
//!
//! The target channel is resolved once per batch, then every alert is rendered
//! and sent in order. A failed send is answered with a login (the session may
//! have expired) and retried after a delay until the retry budget of that
//! message is used up, which aborts the rest of the batch.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use prometheus::{IntCounterVec, Registry};
use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
	alert::AlertBatch,
	alert_renderer::{AlertRenderer, FormattedMessage},
	rocketchat::{Channel, ChatTransport, Message, TransportError},
	settings::ConfigError,
};

#[serde_as]
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
/// retry policy for a single message
pub struct RetrySettings {
	/// attempts after the first one
	pub max_retries: usize,
	/// delay before the first retry
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	pub interval: Duration,
	/// upper bound of a single delay
	#[serde_as(as = "DurationSecondsWithFrac<f64>")]
	pub max_interval: Duration,
	/// the factor by which each next delay grows, `1.0` keeps it fixed
	pub multiplier: f64,
}

impl Default for RetrySettings {
	fn default() -> Self {
		Self {
			max_retries: 3,
			interval: Duration::from_secs(3),
			max_interval: Duration::from_secs(60),
			multiplier: 1.0,
		}
	}
}

impl RetrySettings {
	/// construct an `ExponentialBackoff` by the configured settings
	pub fn build(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::default()
			.with_max_elapsed_time(None)
			.with_initial_interval(self.interval)
			.with_max_interval(self.max_interval.max(self.interval))
			.with_multiplier(self.multiplier)
			.with_randomization_factor(0_f64)
			.build()
	}
}

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("cannot get room ID of {channel}: {source}")]
	ChannelResolution {
		channel: String,
		#[source]
		source: TransportError,
	},
	#[error("cannot send message: after {attempts} attempts, last error: {source}")]
	RetriesExhausted {
		attempts: usize,
		#[source]
		source: TransportError,
	},
	#[error("cancelled while retrying, last error: {0}")]
	Cancelled(#[source] TransportError),
	#[error("cancelled while waiting for an earlier notification")]
	CancelledWaiting,
}

impl DispatchError {
	fn outcome(&self) -> &'static str {
		match self {
			Self::ChannelResolution { .. } => "channel_resolution_failed",
			Self::RetriesExhausted { .. } => "retries_exhausted",
			Self::Cancelled(_) | Self::CancelledWaiting => "cancelled",
		}
	}
}

#[derive(Debug)]
/// prometheus meters for the dispatcher
struct DispatchMetrics {
	/// messages delivered per channel
	messages_sent: IntCounterVec,
	/// failed send attempts per channel
	send_failures: IntCounterVec,
	/// re-authentications by result
	logins: IntCounterVec,
	/// batches by outcome
	batches: IntCounterVec,
}

impl DispatchMetrics {
	fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
		use prometheus::opts;

		let counter = |name: &str, help: &str, labels: &[&str]| {
			let counter = IntCounterVec::new(
				opts!(name, help).namespace("howler").subsystem("dispatcher"),
				labels,
			)?;
			registry.register(Box::new(counter.clone()))?;
			Ok::<_, prometheus::Error>(counter)
		};

		Ok(Self {
			messages_sent: counter("messages_sent_total", "delivered messages", &["channel"])?,
			send_failures: counter("send_failures_total", "failed send attempts", &["channel"])?,
			logins: counter("reauthentications_total", "logins after failed sends", &["result"])?,
			batches: counter("batches_total", "dispatched alert batches", &["outcome"])?,
		})
	}
}

/// Formats alert batches and delivers them through a [ChatTransport]
pub struct Dispatcher {
	transport: Arc<dyn ChatTransport>,
	renderer: AlertRenderer,
	default_channel_name: String,
	retry: RetrySettings,

	/// at most one login/send sequence runs against the transport
	lock: Mutex<()>,

	metrics: DispatchMetrics,
}

impl Dispatcher {
	pub fn new(
		transport: Arc<dyn ChatTransport>,
		renderer: AlertRenderer,
		default_channel_name: String,
		retry: RetrySettings,
		registry: &Registry,
	) -> Result<Self> {
		if default_channel_name.is_empty() {
			return Err(ConfigError::DefaultChannelNotDefined.into());
		}

		Ok(Self {
			transport,
			renderer,
			default_channel_name,
			retry,
			lock: Mutex::new(()),
			metrics: DispatchMetrics::new(registry).context("failed to register prometheus meters")?,
		})
	}

	/// Sends every alert of `batch`, in order. Alerts sent before a failing one
	/// stay sent.
	///
	/// # Arguments
	///
	/// * `batch` - alerts received by the webhook receiver
	///
	/// * `cancel` - aborts waiting for an earlier batch, or retrying between two
	///   attempts
	pub async fn send_notification(
		&self,
		batch: &AlertBatch,
		cancel: &CancellationToken,
	) -> Result<(), DispatchError> {
		let result = tokio::select! {
			biased;
			_guard = self.lock.lock() => self.dispatch(batch, cancel).await,
			_ = cancel.cancelled() => Err(DispatchError::CancelledWaiting),
		};

		let outcome = result.as_ref().map_or_else(DispatchError::outcome, |_| "sent");
		self.metrics.batches.with_label_values(&[outcome]).inc();

		result
	}

	async fn dispatch(
		&self,
		batch: &AlertBatch,
		cancel: &CancellationToken,
	) -> Result<(), DispatchError> {
		let channel_name = batch.channel_name().unwrap_or(&self.default_channel_name);

		let channel = self.transport.channel_id(channel_name).await.map_err(|source| {
			DispatchError::ChannelResolution { channel: channel_name.to_owned(), source }
		})?;
		let channel = Channel::new(channel);

		tracing::info!(
			version = %batch.version,
			group_key = %batch.group_key,
			truncated_alerts = batch.truncated_alerts,
			external_url = %batch.external_url,
			status = %batch.status,
			group_labels = ?batch.group_labels,
			common_labels = ?batch.common_labels,
			common_annotations = ?batch.common_annotations,
			"sending {} alerts to {channel_name}",
			batch.alerts.len()
		);

		for alert in &batch.alerts {
			let FormattedMessage { channel, body, attachment } =
				self.renderer.render(alert, &batch.receiver, &channel);

			let mut message = self.transport.new_message(&channel, body);
			message.attachments = vec![attachment];

			self.send_with_retries(&message, channel_name, cancel).await?;
		}

		Ok(())
	}

	async fn send_with_retries(
		&self,
		message: &Message,
		channel_name: &str,
		cancel: &CancellationToken,
	) -> Result<(), DispatchError> {
		let mut backoff = self.retry.build();
		let mut attempts = 0;

		loop {
			attempts += 1;

			let err = match self.transport.send_message(message).await {
				Ok(_) => {
					self.metrics.messages_sent.with_label_values(&[channel_name]).inc();
					return Ok(());
				}
				Err(err) => err,
			};

			self.metrics.send_failures.with_label_values(&[channel_name]).inc();

			self.reauthenticate().await;

			if attempts > self.retry.max_retries {
				return Err(DispatchError::RetriesExhausted { attempts, source: err });
			}

			let delay = backoff.next_backoff().unwrap_or(self.retry.interval);

			tracing::warn!("retrying after error in {delay:?}: {err}");

			tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(DispatchError::Cancelled(err)),
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}

	/// log in again, failures are only logged
	async fn reauthenticate(&self) {
		match self.transport.login().await {
			Ok(_) => {
				self.metrics.logins.with_label_values(&["success"]).inc();
			}
			Err(err) => {
				self.metrics.logins.with_label_values(&["error"]).inc();
				tracing::error!("cannot reauthenticate in rocketchat: {err}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::{
		alert::{Alert, CHANNEL_NAME_LABEL, RESOLVED_STATUS},
		alert_renderer::{SeverityColors, TemplateSettings, DEFAULT_COLOR, RESOLVED_COLOR},
		rocketchat::testing::FakeTransport,
	};

	const MAX_RETRIES: usize = 3;

	fn retry(interval: Duration) -> RetrySettings {
		RetrySettings { max_retries: MAX_RETRIES, interval, ..RetrySettings::default() }
	}

	fn dispatcher_with(transport: &Arc<FakeTransport>, retry: RetrySettings) -> Dispatcher {
		let colors = HashMap::from([("warning".to_owned(), "#f2e826".to_owned())]);
		let renderer =
			AlertRenderer::new(&TemplateSettings::default(), SeverityColors::new(colors, false))
				.unwrap();

		Dispatcher::new(transport.clone(), renderer, "alerts".to_owned(), retry, &Registry::new())
			.unwrap()
	}

	fn dispatcher(transport: &Arc<FakeTransport>) -> Dispatcher {
		dispatcher_with(transport, retry(Duration::from_millis(1)))
	}

	fn cpu_alert(status: &str, severity: &str) -> Alert {
		Alert {
			status: status.to_owned(),
			labels: [("alertname", "CPUHigh"), ("severity", severity)]
				.into_iter()
				.map(|(k, v)| (k.to_owned(), v.to_owned()))
				.collect(),
			annotations: [("summary".to_owned(), "CPU high".to_owned())].into_iter().collect(),
			..Alert::default()
		}
	}

	fn batch(alerts: Vec<Alert>, channel_name: Option<&str>) -> AlertBatch {
		let mut batch =
			AlertBatch { receiver: "rocketchat".to_owned(), alerts, ..AlertBatch::default() };
		if let Some(name) = channel_name {
			batch.common_labels.insert(CHANNEL_NAME_LABEL.to_owned(), name.to_owned());
		}
		batch
	}

	async fn send(dispatcher: &Dispatcher, batch: &AlertBatch) -> Result<(), DispatchError> {
		dispatcher.send_notification(batch, &CancellationToken::new()).await
	}

	#[tokio::test]
	async fn sends_firing_alert_to_labelled_channel() {
		let transport = Arc::new(FakeTransport::failing(0));
		let batch = batch(vec![cpu_alert("firing", "warning")], Some("ops-room"));

		send(&dispatcher(&transport), &batch).await.unwrap();

		assert_eq!(transport.resolved(), ["ops-room"]);

		let sent = transport.sent();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].rid, "id-ops-room");
		assert!(sent[0].msg.contains("CPUHigh"));
		assert!(sent[0].msg.contains("warning"));
		assert!(sent[0].msg.contains("CPU high"));
		assert_eq!(sent[0].attachments.len(), 1);
		assert_eq!(sent[0].attachments[0].color, "#f2e826");
		assert!(sent[0].attachments[0].fields.is_empty());
		assert_eq!(transport.logins(), 0);
	}

	#[tokio::test]
	async fn falls_back_to_default_channel() {
		let transport = Arc::new(FakeTransport::failing(0));

		send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], None))
			.await
			.unwrap();
		send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], Some("")))
			.await
			.unwrap();

		assert_eq!(transport.resolved(), ["alerts", "alerts"]);
		assert!(transport.sent().iter().all(|message| message.rid == "id-alerts"));
	}

	#[tokio::test]
	async fn resolves_channel_once_per_batch() {
		let transport = Arc::new(FakeTransport::failing(0));
		let alerts = vec![cpu_alert("firing", "warning"), cpu_alert(RESOLVED_STATUS, "warning")];

		send(&dispatcher(&transport), &batch(alerts, Some("ops-room"))).await.unwrap();

		assert_eq!(transport.resolved().len(), 1);
		assert_eq!(transport.sent().len(), 2);
	}

	#[tokio::test]
	async fn colors_follow_status_and_severity() {
		let transport = Arc::new(FakeTransport::failing(0));
		let alerts = vec![
			cpu_alert("firing", "unknown_sev"),
			cpu_alert(RESOLVED_STATUS, "warning"),
			cpu_alert("firing", "warning"),
		];

		send(&dispatcher(&transport), &batch(alerts, None)).await.unwrap();

		let colors: Vec<_> =
			transport.sent().into_iter().map(|message| message.attachments[0].color.clone()).collect();
		assert_eq!(colors, [DEFAULT_COLOR, RESOLVED_COLOR, "#f2e826"]);
	}

	#[tokio::test]
	async fn keeps_alert_order() {
		let transport = Arc::new(FakeTransport::failing(0));
		let alerts = ["A", "B", "C"]
			.into_iter()
			.map(|name| {
				let mut alert = cpu_alert("firing", "warning");
				alert.labels.insert("alertname".to_owned(), name.to_owned());
				alert
			})
			.collect();

		send(&dispatcher(&transport), &batch(alerts, None)).await.unwrap();

		let bodies: Vec<_> = transport.sent().into_iter().map(|message| message.msg).collect();
		assert!(bodies[0].starts_with("**A**"));
		assert!(bodies[1].starts_with("**B**"));
		assert!(bodies[2].starts_with("**C**"));
	}

	#[tokio::test]
	async fn retries_until_send_succeeds() {
		for failures in 0..=MAX_RETRIES {
			let transport = Arc::new(FakeTransport::failing(failures));

			send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], None))
				.await
				.unwrap();

			assert_eq!(transport.send_attempts(), failures + 1);
			assert_eq!(transport.logins(), failures);
			assert_eq!(transport.sent().len(), 1);
		}
	}

	#[tokio::test]
	async fn gives_up_after_max_attempts() {
		let transport = Arc::new(FakeTransport::always_failing());

		let err = send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], None))
			.await
			.unwrap_err();

		assert_eq!(transport.send_attempts(), MAX_RETRIES + 1);
		match err {
			DispatchError::RetriesExhausted { attempts, source } => {
				assert_eq!(attempts, MAX_RETRIES + 1);
				assert!(source.to_string().contains("send attempt 4 failed"));
			}
			other => panic!("unexpected error {other:?}"),
		}
	}

	#[tokio::test]
	async fn exhaustion_aborts_remaining_alerts() {
		let transport = Arc::new(FakeTransport::always_failing());
		let alerts = vec![cpu_alert("firing", "warning"); 3];

		assert!(send(&dispatcher(&transport), &batch(alerts, None)).await.is_err());

		assert_eq!(transport.send_attempts(), MAX_RETRIES + 1);
		assert!(transport.sent().is_empty());
	}

	#[tokio::test]
	async fn every_message_has_its_own_budget() {
		// the first message needs its whole budget, the second goes through directly
		let transport = Arc::new(FakeTransport::failing(MAX_RETRIES));
		let alerts = vec![cpu_alert("firing", "warning"); 2];

		send(&dispatcher(&transport), &batch(alerts, None)).await.unwrap();

		assert_eq!(transport.send_attempts(), MAX_RETRIES + 2);
		assert_eq!(transport.sent().len(), 2);
	}

	#[tokio::test]
	async fn login_failures_dont_stop_retrying() {
		let transport = Arc::new(FakeTransport { fail_login: true, ..FakeTransport::failing(2) });

		send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], None))
			.await
			.unwrap();

		assert_eq!(transport.logins(), 2);
		assert_eq!(transport.send_attempts(), 3);
	}

	#[tokio::test]
	async fn exhausted_error_wraps_send_error_not_login_error() {
		let transport = Arc::new(FakeTransport { fail_login: true, ..FakeTransport::always_failing() });

		let err = send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], None))
			.await
			.unwrap_err();

		assert!(err.to_string().contains("send attempt"));
		assert!(!err.to_string().contains("login"));
	}

	#[tokio::test]
	async fn channel_resolution_failure_is_not_retried() {
		let transport = Arc::new(FakeTransport { fail_resolve: true, ..FakeTransport::failing(0) });

		let err = send(&dispatcher(&transport), &batch(vec![cpu_alert("firing", "warning")], None))
			.await
			.unwrap_err();

		assert!(matches!(err, DispatchError::ChannelResolution { ref channel, .. } if channel == "alerts"));
		assert_eq!(transport.resolved().len(), 1);
		assert_eq!(transport.send_attempts(), 0);
		assert_eq!(transport.logins(), 0);
	}

	#[tokio::test]
	async fn cancellation_stops_retrying() {
		let transport = Arc::new(FakeTransport::always_failing());
		let dispatcher = dispatcher_with(&transport, retry(Duration::from_secs(3600)));

		let cancel = CancellationToken::new();
		cancel.cancel();

		let err = dispatcher
			.send_notification(&batch(vec![cpu_alert("firing", "warning")], None), &cancel)
			.await
			.unwrap_err();

		assert!(matches!(err, DispatchError::Cancelled(_)));
		assert_eq!(transport.send_attempts(), 1);
	}

	#[tokio::test]
	async fn cancellation_stops_batches_waiting_for_the_lock() {
		let transport = Arc::new(FakeTransport::always_failing());
		let dispatcher = Arc::new(dispatcher_with(&transport, retry(Duration::from_secs(3600))));

		let running = CancellationToken::new();
		let first = tokio::spawn({
			let dispatcher = dispatcher.clone();
			let running = running.clone();
			async move {
				dispatcher
					.send_notification(&batch(vec![cpu_alert("firing", "warning")], None), &running)
					.await
			}
		});

		while transport.logins() == 0 {
			tokio::task::yield_now().await;
		}

		let waiting = CancellationToken::new();
		waiting.cancel();
		let err = dispatcher
			.send_notification(&batch(vec![cpu_alert("firing", "warning")], None), &waiting)
			.await
			.unwrap_err();

		assert!(matches!(err, DispatchError::CancelledWaiting));
		assert_eq!(transport.send_attempts(), 1);
		assert_eq!(transport.resolved(), ["alerts"]);

		running.cancel();
		assert!(matches!(first.await.unwrap(), Err(DispatchError::Cancelled(_))));
	}

	#[tokio::test]
	async fn empty_batch_only_resolves_channel() {
		let transport = Arc::new(FakeTransport::failing(0));

		send(&dispatcher(&transport), &batch(Vec::new(), None)).await.unwrap();

		assert_eq!(transport.resolved(), ["alerts"]);
		assert_eq!(transport.send_attempts(), 0);
	}

	#[test]
	fn rejects_empty_default_channel() {
		let renderer = AlertRenderer::new(&TemplateSettings::default(), SeverityColors::default())
			.unwrap();

		let result = Dispatcher::new(
			Arc::new(FakeTransport::failing(0)),
			renderer,
			String::new(),
			RetrySettings::default(),
			&Registry::new(),
		);

		assert!(result.is_err());
	}

	#[test]
	fn default_retry_delay_is_fixed() {
		let mut backoff = RetrySettings::default().build();

		for _ in 0..5 {
			assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(3)));
		}
	}
}
