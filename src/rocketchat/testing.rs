//! recording [ChatTransport] for tests
use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Mutex,
};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{ChatTransport, Message, TransportError, User};

/// Fails the first `failing_sends` sends (or every send if `None`), records
/// everything else.
#[derive(Debug, Default)]
pub struct FakeTransport {
	pub failing_sends: Option<usize>,
	pub fail_login: bool,
	pub fail_resolve: bool,

	pub logins: AtomicUsize,
	pub send_attempts: AtomicUsize,
	pub resolved: Mutex<Vec<String>>,
	pub sent: Mutex<Vec<Message>>,
}

impl FakeTransport {
	pub fn failing(failing_sends: usize) -> Self {
		Self { failing_sends: Some(failing_sends), ..Self::default() }
	}

	pub fn always_failing() -> Self {
		Self::default()
	}

	pub fn logins(&self) -> usize {
		self.logins.load(Ordering::SeqCst)
	}

	pub fn send_attempts(&self) -> usize {
		self.send_attempts.load(Ordering::SeqCst)
	}

	pub fn resolved(&self) -> Vec<String> {
		self.resolved.lock().unwrap().clone()
	}

	pub fn sent(&self) -> Vec<Message> {
		self.sent.lock().unwrap().clone()
	}
}

fn unavailable(body: &str) -> TransportError {
	TransportError::Api { status: StatusCode::SERVICE_UNAVAILABLE, body: body.to_owned() }
}

#[async_trait]
impl ChatTransport for FakeTransport {
	async fn login(&self) -> Result<User, TransportError> {
		self.logins.fetch_add(1, Ordering::SeqCst);

		if self.fail_login {
			return Err(unavailable("login unavailable"));
		}

		Ok(User { id: "user-1".to_owned(), username: "howler".to_owned() })
	}

	async fn channel_id(&self, name: &str) -> Result<String, TransportError> {
		self.resolved.lock().unwrap().push(name.to_owned());

		if self.fail_resolve {
			return Err(unavailable("no such room"));
		}

		Ok(format!("id-{name}"))
	}

	async fn send_message(&self, message: &Message) -> Result<Message, TransportError> {
		let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;

		match self.failing_sends {
			Some(failing) if attempt > failing => {
				self.sent.lock().unwrap().push(message.clone());
				Ok(message.clone())
			}
			_ => Err(unavailable(&format!("send attempt {attempt} failed"))),
		}
	}
}
