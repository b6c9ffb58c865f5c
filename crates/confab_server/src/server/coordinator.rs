#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use confab_domain::{ConversationId, Message, ParseIdError, Username};
use confab_protocol::wire::{Envelope, Msg, PROTOCOL_VERSION, PresenceUpdate};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::server::presence::PresenceRegistry;
use crate::server::room_hub::RoomHub;
use crate::server::store::MessageStore;

/// Idle send guards are pruned once the map outgrows this.
const MAX_IDLE_SEND_GUARDS: usize = 1024;

/// Orchestrates identity claims, room membership and message flow across
/// the presence registry, the room hub and the message store.
///
/// Registry and hub locks stay internal to those components and are never
/// held across a store call. Sends to one room are serialized by a
/// per-room guard, so persist order equals broadcast order.
pub struct Coordinator {
	presence: PresenceRegistry,
	hub: RoomHub,
	store: Arc<dyn MessageStore>,
	send_guards: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
	presence_fanout: Mutex<()>,
}

impl Coordinator {
	pub fn new(presence: PresenceRegistry, hub: RoomHub, store: Arc<dyn MessageStore>) -> Self {
		Self {
			presence,
			hub,
			store,
			send_guards: Mutex::new(HashMap::new()),
			presence_fanout: Mutex::new(()),
		}
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	pub fn presence(&self) -> &PresenceRegistry {
		&self.presence
	}

	/// Claim `raw_identity` for `conn_id` and push the updated presence
	/// view to every connection, the claimer included.
	pub async fn claim(&self, conn_id: u64, raw_identity: &str) -> Result<Username, ParseIdError> {
		let identity = Username::new(raw_identity)?;
		let outcome = self.presence.register(conn_id, identity.clone()).await;
		if let Some(displaced) = outcome.displaced_conn {
			info!(conn_id, displaced, identity = %identity, "identity re-claimed; earlier connection orphaned");
			metrics::counter!("confab_server_presence_displaced_total").increment(1);
		}
		metrics::counter!("confab_server_claims_total").increment(1);
		self.broadcast_presence().await;
		Ok(identity)
	}

	/// Push each connection its own view of who is online.
	///
	/// Fanouts are serialized and re-read the roster under the fanout
	/// lock, so the last update published always reflects the newest
	/// registry state.
	pub async fn broadcast_presence(&self) {
		let _ordered = self.presence_fanout.lock().await;
		let roster = self.presence.roster().await;
		self.hub
			.publish_to_all_with(|conn_id| Envelope {
				version: PROTOCOL_VERSION,
				request_id: String::new(),
				msg: Msg::PresenceUpdate(PresenceUpdate {
					online: roster.visible_to(conn_id),
				}),
			})
			.await;
	}

	/// Join the room shared by `me` and `peer` and load its history.
	///
	/// Membership moves before the history read. If the read fails the
	/// connection is put back in the room it occupied before the call, so
	/// its membership keeps matching the session's active conversation.
	pub async fn select(&self, conn_id: u64, me: &Username, peer: &Username) -> anyhow::Result<(ConversationId, Vec<Message>)> {
		let room = ConversationId::between(me, peer);
		let previous = self.hub.current_room(conn_id).await;
		self.hub.join_room(conn_id, room.clone()).await;
		match self.store.read_ordered(&room).await {
			Ok(messages) => {
				metrics::counter!("confab_server_conversations_selected_total").increment(1);
				debug!(conn_id, room = %room, history_len = messages.len(), "conversation selected");
				Ok((room, messages))
			}
			Err(e) => {
				match previous {
					Some(prev) => self.hub.join_room(conn_id, prev).await,
					None => self.hub.leave_room(conn_id).await,
				}
				Err(e.context("load conversation history"))
			}
		}
	}

	/// Persist one message, then fan it out to the room's live members.
	///
	/// On a store failure nothing is broadcast. Once persisted, delivery
	/// is best effort and is not rolled back.
	pub async fn send(&self, author: &Username, room: &ConversationId, text: &str) -> anyhow::Result<Message> {
		let guard = self.send_guard(room).await;
		let _serialized = guard.lock().await;

		let message = self.store.append(room, author, text).await.context("persist message")?;
		metrics::counter!("confab_server_messages_persisted_total").increment(1);

		self.hub
			.publish_to_room(
				room,
				Envelope {
					version: PROTOCOL_VERSION,
					request_id: String::new(),
					msg: Msg::MessageDelivered(message.clone()),
				},
			)
			.await;

		Ok(message)
	}

	/// Tear down a closed connection's mailbox and identity, republishing
	/// presence only if the roster actually shrank.
	pub async fn disconnect(&self, conn_id: u64) {
		self.hub.detach(conn_id).await;
		if let Some(identity) = self.presence.deregister(conn_id).await {
			debug!(conn_id, identity = %identity, "identity released on disconnect");
			self.broadcast_presence().await;
		}
	}

	async fn send_guard(&self, room: &ConversationId) -> Arc<Mutex<()>> {
		let mut guards = self.send_guards.lock().await;
		if guards.len() > MAX_IDLE_SEND_GUARDS {
			// Guards held by an in-flight send have clones out; only idle
			// ones may be dropped.
			guards.retain(|_, guard| Arc::strong_count(guard) > 1);
		}
		let guard = guards.entry(room.clone()).or_default();
		Arc::clone(guard)
	}
}
