//! Here we expose prometheus metrics about howler
use axum::{
	extract::State,
	http::{header::CONTENT_TYPE, StatusCode},
	response::{IntoResponse, Response},
	routing::get,
	Router,
};
use prometheus::{Encoder, Registry, TextEncoder};

async fn metrics_handler(State(registry): State<Registry>) -> Response {
	let mut buffer = vec![];
	let encoder = TextEncoder::new();

	if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
		tracing::error!("failed to encode metrics: {err}");
		return StatusCode::INTERNAL_SERVER_ERROR.into_response();
	}

	([(CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response()
}

/// `GET /metrics` for everything registered in `registry`
pub fn router(registry: Registry) -> Router {
	Router::new().route("/metrics", get(metrics_handler)).with_state(registry)
}
