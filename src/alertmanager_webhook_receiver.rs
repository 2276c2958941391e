use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{body::Bytes, extract::State, http::StatusCode, routing::post, Json, Router};
use prometheus::{IntCounterVec, Registry};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{alert::AlertBatch, dispatcher::Dispatcher};

/// body of every webhook response
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct JsonResponse {
	status: u16,
	message: String,
}

fn respond(status: StatusCode, message: String) -> (StatusCode, Json<JsonResponse>) {
	(status, Json(JsonResponse { status: status.as_u16(), message }))
}

pub struct ReceiverState {
	dispatcher: Arc<Dispatcher>,
	/// parent of every request's cancellation token
	shutdown: CancellationToken,
	metric: IntCounterVec,
}

impl ReceiverState {
	pub fn new(
		dispatcher: Arc<Dispatcher>,
		shutdown: CancellationToken,
		registry: &Registry,
	) -> Result<Self> {
		use prometheus::opts;

		let metric = IntCounterVec::new(
			opts!("received_alerts", "total number of deserialized alerts")
				.namespace("howler")
				.subsystem("alertmanager_webhook"),
			&["receiver"],
		)?;
		registry.register(Box::new(metric.clone())).context("failed to register prometheus meter")?;

		Ok(Self { dispatcher, shutdown, metric })
	}
}

async fn webhook(
	State(state): State<Arc<ReceiverState>>,
	body: Bytes,
) -> (StatusCode, Json<JsonResponse>) {
	let batch: AlertBatch = match serde_json::from_slice(&body) {
		Ok(batch) => batch,
		Err(err) => {
			tracing::debug!("failed to deserialize alert: {err:?}");
			return respond(StatusCode::BAD_REQUEST, err.to_string());
		}
	};

	state.metric.with_label_values(&[batch.receiver.as_str()]).inc_by(batch.alerts.len() as u64);

	let cancel = state.shutdown.child_token();
	if let Err(err) = state.dispatcher.send_notification(&batch, &cancel).await {
		tracing::error!("cannot send notification: {err}");
		return respond(StatusCode::INTERNAL_SERVER_ERROR, format!("cannot send notification: {err}"));
	}

	respond(StatusCode::OK, String::from("Success"))
}

/// `POST /webhook` for alertmanager
pub fn router(state: ReceiverState) -> Router {
	Router::new().route("/webhook", post(webhook)).with_state(Arc::new(state))
}

/// serve `app` on `addr` until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, app: Router, shutdown: CancellationToken) -> Result<()> {
	let listener = TcpListener::bind(addr).await.context(format!("cannot listen on {addr}"))?;

	tracing::info!("listening on: {addr}");

	axum::serve(listener, app)
		.with_graceful_shutdown(async move { shutdown.cancelled().await })
		.await
		.context("alertmanager webhook endpoint crashed")?;

	tracing::info!("http server shutdown completed");

	Ok(())
}
