#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use confab_domain::ConversationId;
use confab_protocol::wire::{Envelope, ErrorReply, Msg, PROTOCOL_VERSION, code};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Routes envelopes to connection mailboxes, scoped by room membership.
///
/// Each connection owns one bounded mailbox and belongs to at most one room
/// at a time. Delivery is `try_send`: a full mailbox drops the envelope and
/// the drop is reported to that connection with a `delivery-lagged` error
/// once its queue drains.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Per-connection mailbox capacity (envelopes).
	pub mailbox_capacity: usize,
	/// Emit debug logs for membership changes and drops.
	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: 1024,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<u64, Mailbox>,
	members_by_room: HashMap<ConversationId, HashSet<u64>>,
	room_by_conn: HashMap<u64, ConversationId>,
}

#[derive(Debug)]
struct Mailbox {
	tx: mpsc::Sender<Envelope>,
	dropped_since_delivery: u64,
}

enum Delivery {
	Queued,
	Dropped,
	Closed,
}

impl Inner {
	fn leave_current_room(&mut self, conn_id: u64) -> Option<ConversationId> {
		let room = self.room_by_conn.remove(&conn_id)?;
		if let Some(members) = self.members_by_room.get_mut(&room) {
			members.remove(&conn_id);
			if members.is_empty() {
				self.members_by_room.remove(&room);
			}
		}
		Some(room)
	}
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Create a mailbox for `conn_id` and return its receiving half.
	pub async fn attach(&self, conn_id: u64) -> mpsc::Receiver<Envelope> {
		let (tx, rx) = mpsc::channel(self.cfg.mailbox_capacity);
		let mut inner = self.inner.lock().await;
		inner.conns.insert(
			conn_id,
			Mailbox {
				tx,
				dropped_since_delivery: 0,
			},
		);
		if self.cfg.debug_logs {
			debug!(conn_id, total = inner.conns.len(), "attached connection mailbox");
		}
		rx
	}

	/// Remove the mailbox and any room membership for `conn_id`.
	pub async fn detach(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.conns.remove(&conn_id);
		inner.leave_current_room(conn_id);
		if self.cfg.debug_logs {
			debug!(conn_id, total = inner.conns.len(), "detached connection mailbox");
		}
	}

	/// Move `conn_id` into `room`, leaving its previous room first.
	pub async fn join_room(&self, conn_id: u64, room: ConversationId) {
		let mut inner = self.inner.lock().await;
		let left = inner.leave_current_room(conn_id);
		inner.members_by_room.entry(room.clone()).or_default().insert(conn_id);
		inner.room_by_conn.insert(conn_id, room.clone());
		if self.cfg.debug_logs {
			debug!(conn_id, room = %room, left = ?left, "joined room");
		}
	}

	pub async fn leave_room(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(room) = inner.leave_current_room(conn_id)
			&& self.cfg.debug_logs
		{
			debug!(conn_id, room = %room, "left room");
		}
	}

	/// Queue one envelope for a single connection.
	///
	/// Returns false when the connection has no mailbox or its queue
	/// rejected the envelope.
	pub async fn send_to_conn(&self, conn_id: u64, env: Envelope) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(mailbox) = inner.conns.get_mut(&conn_id) else {
			return false;
		};
		match deliver(mailbox, env) {
			Delivery::Queued => true,
			Delivery::Dropped => {
				metrics::counter!("confab_server_hub_dropped_events_total").increment(1);
				false
			}
			Delivery::Closed => {
				inner.conns.remove(&conn_id);
				inner.leave_current_room(conn_id);
				false
			}
		}
	}

	/// Fan one envelope out to every member of `room`.
	///
	/// A room with no live members is a silent no-op. All members are
	/// served under one lock acquisition, so two publishes to the same
	/// room can never interleave per recipient.
	pub async fn publish_to_room(&self, room: &ConversationId, env: Envelope) {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.members_by_room.get(room) else {
			return;
		};
		let member_ids: Vec<u64> = members.iter().copied().collect();

		let mut dropped_total = 0u64;
		let mut closed: Vec<u64> = Vec::new();
		for conn_id in member_ids {
			let Some(mailbox) = inner.conns.get_mut(&conn_id) else {
				closed.push(conn_id);
				continue;
			};
			match deliver(mailbox, env.clone()) {
				Delivery::Queued => {}
				Delivery::Dropped => dropped_total += 1,
				Delivery::Closed => closed.push(conn_id),
			}
		}

		for conn_id in closed {
			inner.conns.remove(&conn_id);
			inner.leave_current_room(conn_id);
		}

		if dropped_total > 0 {
			metrics::counter!("confab_server_hub_dropped_events_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(room = %room, dropped = dropped_total, "dropped room events for slow members");
			}
		}
	}

	/// Fan one envelope out to every attached connection.
	pub async fn publish_to_all(&self, env: Envelope) {
		self.publish_to_all_with(|_conn_id| env.clone()).await;
	}

	/// Fan out to every attached connection, building each recipient's
	/// envelope from its connection id. All recipients see the fan-out
	/// under the same lock acquisition.
	pub async fn publish_to_all_with<F>(&self, mut make: F)
	where
		F: FnMut(u64) -> Envelope,
	{
		let mut inner = self.inner.lock().await;
		let conn_ids: Vec<u64> = inner.conns.keys().copied().collect();

		let mut dropped_total = 0u64;
		let mut closed: Vec<u64> = Vec::new();
		for conn_id in conn_ids {
			let Some(mailbox) = inner.conns.get_mut(&conn_id) else {
				continue;
			};
			match deliver(mailbox, make(conn_id)) {
				Delivery::Queued => {}
				Delivery::Dropped => dropped_total += 1,
				Delivery::Closed => closed.push(conn_id),
			}
		}

		for conn_id in closed {
			inner.conns.remove(&conn_id);
			inner.leave_current_room(conn_id);
		}

		if dropped_total > 0 {
			metrics::counter!("confab_server_hub_dropped_events_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(dropped = dropped_total, "dropped broadcast events for slow connections");
			}
		}
	}

	pub async fn current_room(&self, conn_id: u64) -> Option<ConversationId> {
		let inner = self.inner.lock().await;
		inner.room_by_conn.get(&conn_id).cloned()
	}

	pub async fn attached_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.conns.len()
	}

	pub async fn room_member_counts(&self) -> HashMap<ConversationId, usize> {
		let inner = self.inner.lock().await;
		inner
			.members_by_room
			.iter()
			.map(|(room, members)| (room.clone(), members.len()))
			.collect()
	}
}

fn deliver(mailbox: &mut Mailbox, env: Envelope) -> Delivery {
	match mailbox.tx.try_send(env) {
		Ok(()) => {
			if mailbox.dropped_since_delivery > 0 {
				let notice = lag_notice(mailbox.dropped_since_delivery);
				if mailbox.tx.try_send(notice).is_ok() {
					mailbox.dropped_since_delivery = 0;
				}
			}
			Delivery::Queued
		}
		Err(TrySendError::Full(_)) => {
			mailbox.dropped_since_delivery = mailbox.dropped_since_delivery.saturating_add(1);
			Delivery::Dropped
		}
		Err(TrySendError::Closed(_)) => Delivery::Closed,
	}
}

fn lag_notice(dropped: u64) -> Envelope {
	Envelope {
		version: PROTOCOL_VERSION,
		request_id: String::new(),
		msg: Msg::Error(ErrorReply {
			code: code::DELIVERY_LAGGED.to_string(),
			message: format!("dropped {dropped} events while the delivery queue was full"),
		}),
	}
}
