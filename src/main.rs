//! prometheus alertmanager receiver that forwards alerts into Rocket.Chat
//! channels
//!
//! Features:
//! - forwards every alert of a webhook call as one message, in order
//! - per batch channel override via the `channel_name` common label
//! - attachment colors by severity, configurable templates
//! - logs in again and retries when a message fails to send

use std::sync::Arc;

use anyhow::{Context, Result};
use rocketchat::{ChatTransport, RocketChatClient};
use settings::Settings;
use tokio_util::sync::CancellationToken;

use crate::{
	alert_renderer::{AlertRenderer, SeverityColors},
	alertmanager_webhook_receiver::ReceiverState,
	dispatcher::Dispatcher,
};

mod alert;
mod alert_renderer;
mod alertmanager_webhook_receiver;
mod dispatcher;
mod log;
mod rocketchat;
mod settings;
mod telemetry_endpoint;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
	let default_panic = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_panic(info);
		std::process::exit(1);
	}));
}

/// cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			tracing::error!("cannot listen for ctrl-c: {err}");
		}
	};

	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{signal, SignalKind};

		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(err) => {
				tracing::error!("cannot listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}

	tracing::debug!("http server shutdown initiated");
	shutdown.cancel();
}

/// the entry point of the program
#[tokio::main]
pub async fn main() -> Result<()> {
	setup_panic_handler();

	let settings = Settings::load().context("cannot read config")?;

	log::setup_logging(&settings.log).context("could not setup logging")?;

	tracing::info!("starting {} {}", clap::crate_name!(), clap::crate_version!());

	let registry = prometheus::default_registry().clone();
	let rocketchat = &settings.rocketchat;

	let client = RocketChatClient::new(rocketchat, &registry)
		.context("cannot initialize rocketchat client")?;
	let user = client.login().await.context("cannot authorize in rocketchat")?;
	tracing::debug!(user_id = %user.id, "authorized as {}", user.username);

	let renderer = AlertRenderer::new(
		&rocketchat.templates,
		SeverityColors::new(rocketchat.color_map(), rocketchat.severity_case_insensitive),
	)
	.context("cannot parse message templates")?;

	let dispatcher = Dispatcher::new(
		Arc::new(client),
		renderer,
		rocketchat.channel.default_channel_name.clone(),
		rocketchat.retry,
		&registry,
	)
	.context("cannot initialize alert dispatcher")?;

	let shutdown = CancellationToken::new();
	tokio::spawn(wait_for_signal(shutdown.clone()));

	let state = ReceiverState::new(Arc::new(dispatcher), shutdown.clone(), &registry)?;
	let app =
		alertmanager_webhook_receiver::router(state).merge(telemetry_endpoint::router(registry));

	alertmanager_webhook_receiver::serve(settings.listen_address, app, shutdown)
		.await
		.context("cannot start http server")?;

	tracing::info!("shutdown completed");

	Ok(())
}
