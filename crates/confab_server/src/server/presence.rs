#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use confab_domain::Username;
use tokio::sync::Mutex;
use tracing::debug;

/// Shared registry of which identity each live connection has claimed.
///
/// An identity maps to at most one connection. A later claim for the same
/// identity displaces the earlier connection, which keeps its session open
/// but no longer owns any identity.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	conn_by_identity: HashMap<Username, u64>,
	identity_by_conn: HashMap<u64, Username>,
}

/// What changed when a connection claimed an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
	/// Connection that previously owned the identity, if a different one.
	pub displaced_conn: Option<u64>,
	/// Identity this connection owned before the claim, if any.
	pub replaced_identity: Option<Username>,
}

/// Sorted view of the registry used to fan presence out to connections.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
	online: Vec<String>,
	identity_by_conn: HashMap<u64, String>,
}

impl PresenceRoster {
	/// All online identities, sorted.
	pub fn online(&self) -> &[String] {
		&self.online
	}

	/// Online identities as seen by one connection: everyone but itself.
	pub fn visible_to(&self, conn_id: u64) -> Vec<String> {
		match self.identity_by_conn.get(&conn_id) {
			Some(own) => self.online.iter().filter(|name| *name != own).cloned().collect(),
			None => self.online.clone(),
		}
	}
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bind `identity` to `conn_id`, displacing any previous owner.
	///
	/// The displaced connection loses its registry entry entirely, so its
	/// later deregister is a no-op.
	pub async fn register(&self, conn_id: u64, identity: Username) -> RegisterOutcome {
		let mut inner = self.inner.lock().await;

		let replaced_identity = inner.identity_by_conn.remove(&conn_id);
		if let Some(prev) = &replaced_identity {
			inner.conn_by_identity.remove(prev);
		}

		let displaced_conn = inner.conn_by_identity.insert(identity.clone(), conn_id).filter(|owner| *owner != conn_id);
		if let Some(orphaned) = displaced_conn {
			inner.identity_by_conn.remove(&orphaned);
			debug!(conn_id, orphaned, identity = %identity, "identity claim displaced an earlier connection");
		}

		inner.identity_by_conn.insert(conn_id, identity);

		RegisterOutcome { displaced_conn, replaced_identity }
	}

	/// Drop the identity owned by `conn_id`, if it still owns one.
	///
	/// Returns the released identity, or `None` when the connection never
	/// registered or was already displaced by a later claim.
	pub async fn deregister(&self, conn_id: u64) -> Option<Username> {
		let mut inner = self.inner.lock().await;

		let identity = inner.identity_by_conn.remove(&conn_id)?;
		if inner.conn_by_identity.get(&identity) == Some(&conn_id) {
			inner.conn_by_identity.remove(&identity);
		}
		Some(identity)
	}

	pub async fn identity_of(&self, conn_id: u64) -> Option<Username> {
		let inner = self.inner.lock().await;
		inner.identity_by_conn.get(&conn_id).cloned()
	}

	/// Sorted online identities, optionally excluding one.
	pub async fn snapshot_excluding(&self, exclude: Option<&Username>) -> Vec<String> {
		let inner = self.inner.lock().await;
		let mut online: Vec<String> = inner
			.conn_by_identity
			.keys()
			.filter(|identity| Some(*identity) != exclude)
			.map(|identity| identity.as_str().to_string())
			.collect();
		online.sort_unstable();
		online
	}

	/// Consistent snapshot for a full presence fan-out.
	pub async fn roster(&self) -> PresenceRoster {
		let inner = self.inner.lock().await;
		let mut online: Vec<String> = inner.conn_by_identity.keys().map(|identity| identity.as_str().to_string()).collect();
		online.sort_unstable();

		let identity_by_conn = inner
			.identity_by_conn
			.iter()
			.map(|(conn_id, identity)| (*conn_id, identity.as_str().to_string()))
			.collect();

		PresenceRoster { online, identity_by_conn }
	}
}
