#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between the two participant names in a [`ConversationId`].
///
/// [`Username::new`] rejects names containing it, so distinct name pairs
/// can never derive the same room id.
pub const ROOM_SEPARATOR: char = '-';

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("reserved character: {0:?}")]
	ReservedChar(char),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Case-sensitive user identity as claimed by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a `Username`: non-blank, free of [`ROOM_SEPARATOR`].
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.contains(ROOM_SEPARATOR) {
			return Err(ParseIdError::ReservedChar(ROOM_SEPARATOR));
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

/// Canonical identity of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	/// Derive the room shared by `a` and `b`.
	///
	/// Commutative: the pair is ordered byte-lexicographically before
	/// joining, so `between(a, b) == between(b, a)`.
	pub fn between(a: &Username, b: &Username) -> Self {
		let (first, second) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
		Self(format!("{}{}{}", first.as_str(), ROOM_SEPARATOR, second.as_str()))
	}

	/// Accept an already-derived room id of the form `a-b`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !id.contains(ROOM_SEPARATOR) {
			return Err(ParseIdError::InvalidFormat(id));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationId::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A persisted chat message. Immutable once the log has assigned
/// `id` and `created_at_unix_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub room: ConversationId,
	pub author: Username,
	pub text: String,
	pub created_at_unix_ms: i64,
}
