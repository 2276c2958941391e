//! Rocket.Chat transport
//!
//! [ChatTransport] is the capability set the
//! [Dispatcher](crate::dispatcher::Dispatcher) needs from a chat service.
//! [RocketChatClient] implements it over the Rocket.Chat REST API.

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub use self::{
	client::RocketChatClient,
	models::{Attachment, AttachmentField, Channel, Message, User},
	settings::{ChannelSettings, Credentials, RocketChatSettings, SeverityColor},
};

pub mod client;
pub mod models;
pub mod settings;

#[cfg(test)]
pub mod testing;

/// errors returned by a [ChatTransport]
#[derive(Error, Debug)]
pub enum TransportError {
	#[error("request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("rocket.chat responded with {status}: {body}")]
	Api { status: StatusCode, body: String },
	#[error("not logged in")]
	NotAuthenticated,
	#[error("unexpected response: {0}")]
	UnexpectedResponse(String),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
	/// (re)authenticate, replacing the current session
	async fn login(&self) -> Result<User, TransportError>;

	/// map a channel name to its room id
	async fn channel_id(&self, name: &str) -> Result<String, TransportError>;

	async fn send_message(&self, message: &Message) -> Result<Message, TransportError>;

	/// build a message draft for `channel`, attachments are added by the
	/// caller
	fn new_message(&self, channel: &Channel, text: String) -> Message {
		Message::new(channel, text)
	}
}
