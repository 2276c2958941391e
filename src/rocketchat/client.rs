//! [ChatTransport] over the Rocket.Chat REST API, recording prometheus
//! metrics for every request
use anyhow::{Context, Result};
use async_trait::async_trait;
use prometheus::{HistogramVec, IntCounterVec, Registry};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tokio::sync::RwLock;
use url::Url;

use super::{ChatTransport, Credentials, Message, RocketChatSettings, TransportError, User};

#[derive(Debug, Clone)]
/// prometheus meters for the rocket.chat http client
struct Metrics {
	/// total number of http requests
	requests: IntCounterVec,
	/// total number of failed http requests
	requests_failed: IntCounterVec,
	/// time spent by http requests
	request_duration: HistogramVec,
}

impl Metrics {
	/// construct and register prometheus meters
	fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
		use prometheus::{exponential_buckets, histogram_opts, opts};

		let requests = IntCounterVec::new(
			opts!("requests_total", "total number of http requests")
				.namespace("howler")
				.subsystem("rocketchat_client"),
			&["endpoint"],
		)?;

		let requests_failed = IntCounterVec::new(
			opts!("requests_failed", "number of failed http requests")
				.namespace("howler")
				.subsystem("rocketchat_client"),
			&["endpoint", "status_code"],
		)?;

		let request_duration = HistogramVec::new(
			histogram_opts!(
				"request_duration_seconds",
				"total time of a http request in seconds",
				exponential_buckets(0.01, 2., 12)?
			)
			.namespace("howler")
			.subsystem("rocketchat_client"),
			&["endpoint"],
		)?;

		registry.register(Box::new(requests.clone()))?;
		registry.register(Box::new(requests_failed.clone()))?;
		registry.register(Box::new(request_duration.clone()))?;

		Ok(Self { requests, requests_failed, request_duration })
	}
}

/// auth headers of a logged in user
#[derive(Debug, Clone)]
struct Session {
	auth_token: String,
	user_id: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
	data: LoginData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
	auth_token: String,
	user_id: String,
	#[serde(default)]
	me: Option<Me>,
}

#[derive(Debug, Deserialize)]
struct Me {
	username: String,
}

#[derive(Debug, Deserialize)]
struct RoomInfoResponse {
	room: Option<Room>,
}

#[derive(Debug, Deserialize)]
struct Room {
	#[serde(rename = "_id")]
	id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
	message: Message,
}

/// Rocket.Chat REST client. Keeps the session of the last successful login.
#[derive(Debug)]
pub struct RocketChatClient {
	client: reqwest::Client,
	credentials: Credentials,
	session: RwLock<Option<Session>>,

	login_url: Url,
	room_info_url: Url,
	send_message_url: Url,

	metrics: Metrics,
}

impl RocketChatClient {
	/// construct client, doesn't log in yet
	pub fn new(settings: &RocketChatSettings, registry: &Registry) -> Result<Self> {
		let mut base = settings.endpoint.clone();
		// Url::join replaces the last path segment unless the path ends with a slash
		if !base.path().ends_with('/') {
			let path = format!("{}/", base.path());
			base.set_path(&path);
		}

		let api = |path: &str| base.join(path).context(format!("invalid api url {path}"));

		Ok(Self {
			client: reqwest::Client::builder()
				.timeout(settings.request_timeout)
				.build()
				.context("failed to build reqwest client")?,
			credentials: settings.credentials.clone(),
			session: RwLock::new(None),

			login_url: api("api/v1/login")?,
			room_info_url: api("api/v1/rooms.info")?,
			send_message_url: api("api/v1/chat.sendMessage")?,

			metrics: Metrics::new(registry).context("failed to register prometheus meters")?,
		})
	}

	async fn session(&self) -> Result<Session, TransportError> {
		self.session.read().await.clone().ok_or(TransportError::NotAuthenticated)
	}

	/// send request, turning non 2xx responses into [TransportError::Api]
	async fn execute<T: DeserializeOwned>(
		&self,
		endpoint: &'static str,
		request: reqwest::RequestBuilder,
	) -> Result<T, TransportError> {
		let _timer = self.metrics.request_duration.with_label_values(&[endpoint]).start_timer();
		self.metrics.requests.with_label_values(&[endpoint]).inc();

		let response = match request.send().await {
			Ok(response) => response,
			Err(err) => {
				self.metrics.requests_failed.with_label_values(&[endpoint, ""]).inc();
				return Err(err.into());
			}
		};

		let status = response.status();
		if !status.is_success() {
			self.metrics.requests_failed.with_label_values(&[endpoint, status.as_str()]).inc();
			let body = response.text().await.unwrap_or_default();
			return Err(TransportError::Api { status, body });
		}

		Ok(response.json().await?)
	}

	async fn authenticated(
		&self,
		request: reqwest::RequestBuilder,
	) -> Result<reqwest::RequestBuilder, TransportError> {
		let Session { auth_token, user_id } = self.session().await?;

		Ok(request.header("X-Auth-Token", auth_token).header("X-User-Id", user_id))
	}
}

#[async_trait]
impl ChatTransport for RocketChatClient {
	async fn login(&self) -> Result<User, TransportError> {
		let request = self.client.post(self.login_url.clone()).json(&json!({
			"user": self.credentials.email,
			"password": self.credentials.password,
		}));

		let LoginResponse { data } = self.execute("login", request).await?;

		let username = data.me.map_or_else(|| self.credentials.name.clone(), |me| me.username);

		tracing::info!("logged in to rocket.chat as {username}");

		*self.session.write().await =
			Some(Session { auth_token: data.auth_token, user_id: data.user_id.clone() });

		Ok(User { id: data.user_id, username })
	}

	async fn channel_id(&self, name: &str) -> Result<String, TransportError> {
		let request = self
			.authenticated(self.client.get(self.room_info_url.clone()).query(&[("roomName", name)]))
			.await?;

		let RoomInfoResponse { room } = self.execute("rooms.info", request).await?;

		room.map(|room| room.id)
			.ok_or_else(|| TransportError::UnexpectedResponse(format!("no room named {name}")))
	}

	async fn send_message(&self, message: &Message) -> Result<Message, TransportError> {
		let request = self
			.authenticated(
				self.client.post(self.send_message_url.clone()).json(&json!({ "message": message })),
			)
			.await?;

		let SendMessageResponse { message } = self.execute("chat.sendMessage", request).await?;

		Ok(message)
	}
}
