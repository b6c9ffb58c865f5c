#![forbid(unsafe_code)]

use confab_domain::Message;
use serde::{Deserialize, Serialize};

/// v1 protocol version carried in every [`Envelope`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Stable error codes carried in [`ErrorReply::code`].
pub mod code {
	pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
	pub const INVALID_IDENTITY: &str = "INVALID_IDENTITY";
	pub const NOT_IDENTIFIED: &str = "NOT_IDENTIFIED";
	pub const NOT_IN_CONVERSATION: &str = "NOT_IN_CONVERSATION";
	pub const EMPTY_MESSAGE: &str = "EMPTY_MESSAGE";
	pub const HISTORY_FAILED: &str = "HISTORY_FAILED";
	pub const PERSISTENCE_FAILED: &str = "PERSISTENCE_FAILED";
	pub const DELIVERY_LAGGED: &str = "DELIVERY_LAGGED";
}

/// One wire frame: a versioned envelope around a single message.
///
/// `request_id` correlates a reply or error with the request that caused
/// it; unsolicited server pushes leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub version: u32,
	#[serde(default)]
	pub request_id: String,
	pub msg: Msg,
}

/// All v1 messages, discriminated by the `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Msg {
	Hello(Hello),
	Welcome(Welcome),
	ClaimIdentity(ClaimIdentity),
	PresenceUpdate(PresenceUpdate),
	SelectConversation(SelectConversation),
	ConversationReady(ConversationReady),
	SendMessage(SendMessage),
	MessageDelivered(Message),
	Ping(Ping),
	Pong(Pong),
	Error(ErrorReply),
}

/// First client frame on a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
	pub client_name: String,
	pub client_instance_id: String,
	pub protocol_version: u32,
}

/// Server reply to [`Hello`]; the session is anonymous afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
	pub server_name: String,
	pub server_instance_id: String,
	pub server_time_unix_ms: i64,
	pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimIdentity {
	pub identity: String,
}

/// Pushed to every connection whenever the presence registry changes.
/// `online` is sorted and excludes the receiving connection's own identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
	pub online: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectConversation {
	pub from: String,
	pub to: String,
}

/// Reply to [`SelectConversation`]: the derived room and its history,
/// oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationReady {
	pub room: String,
	pub with_user: String,
	pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
	pub text: String,
	pub user: String,
	pub room: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
	pub client_time_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
	pub client_time_unix_ms: i64,
	pub server_time_unix_ms: i64,
}

/// Sent only to the connection whose request failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
	pub code: String,
	pub message: String,
}

#[cfg(test)]
mod tests {
	use confab_domain::{ConversationId, MessageId, Username};

	use super::*;

	#[test]
	fn envelope_json_shape() {
		let env = Envelope {
			version: PROTOCOL_VERSION,
			request_id: "r-1".to_string(),
			msg: Msg::ClaimIdentity(ClaimIdentity {
				identity: "alice".to_string(),
			}),
		};

		let json = serde_json::to_value(&env).expect("serialize");
		assert_eq!(json["version"], 1);
		assert_eq!(json["request_id"], "r-1");
		assert_eq!(json["msg"]["type"], "claim-identity");
		assert_eq!(json["msg"]["data"]["identity"], "alice");
	}

	#[test]
	fn request_id_defaults_to_empty() {
		let env: Envelope =
			serde_json::from_str(r#"{"version":1,"msg":{"type":"ping","data":{"client_time_unix_ms":5}}}"#).expect("parse");

		assert_eq!(env.request_id, "");
		match env.msg {
			Msg::Ping(p) => assert_eq!(p.client_time_unix_ms, 5),
			other => panic!("unexpected msg: {other:?}"),
		}
	}

	#[test]
	fn message_delivered_carries_domain_message() {
		let msg = Message {
			id: MessageId::new_v4(),
			room: ConversationId::new("alice-bob").unwrap(),
			author: Username::new("alice").unwrap(),
			text: "hi".to_string(),
			created_at_unix_ms: 1_700_000_000_000,
		};

		let env = Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::MessageDelivered(msg.clone()),
		};

		let bytes = serde_json::to_vec(&env).expect("serialize");
		let back: Envelope = serde_json::from_slice(&bytes).expect("parse");
		match back.msg {
			Msg::MessageDelivered(got) => assert_eq!(got, msg),
			other => panic!("unexpected msg: {other:?}"),
		}
	}

	#[test]
	fn unknown_type_tag_is_a_decode_error() {
		let res = serde_json::from_str::<Envelope>(r#"{"version":1,"msg":{"type":"shout","data":{}}}"#);
		assert!(res.is_err());
	}
}
