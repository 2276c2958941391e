//! wire representation of Rocket.Chat messages
use serde::{Deserialize, Serialize};

/// a resolved Rocket.Chat room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
	pub id: String,
}

impl Channel {
	pub fn new(id: impl Into<String>) -> Self {
		Self { id: id.into() }
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentField {
	#[serde(default)]
	pub short: bool,
	pub title: String,
	pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	#[serde(default)]
	pub color: String,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub fields: Vec<AttachmentField>,
}

/// message as accepted by `chat.sendMessage`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub id: String,
	/// room id
	pub rid: String,
	pub msg: String,
	#[serde(default)]
	pub attachments: Vec<Attachment>,
}

impl Message {
	/// message draft without attachments
	pub fn new(channel: &Channel, text: String) -> Self {
		Self { id: String::new(), rid: channel.id.clone(), msg: text, attachments: Vec::new() }
	}
}

/// the account we're logged in as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
	pub id: String,
	pub username: String,
}
