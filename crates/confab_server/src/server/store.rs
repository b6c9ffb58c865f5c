#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use confab_domain::{ConversationId, Message, MessageId, Username};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Ordered, room-scoped log of persisted messages.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persist one message, assigning its id and timestamp. The returned
	/// message is the authoritative record.
	async fn append(&self, room: &ConversationId, author: &Username, text: &str) -> anyhow::Result<Message>;

	/// All messages of `room`, oldest first.
	async fn read_ordered(&self, room: &ConversationId) -> anyhow::Result<Vec<Message>>;
}

/// Process-local store used when persistence is disabled.
#[derive(Default)]
pub struct InMemoryMessageStore {
	inner: Mutex<HashMap<ConversationId, Vec<Message>>>,
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn append(&self, room: &ConversationId, author: &Username, text: &str) -> anyhow::Result<Message> {
		let message = Message {
			id: MessageId::new_v4(),
			room: room.clone(),
			author: author.clone(),
			text: text.to_string(),
			created_at_unix_ms: unix_ms_now(),
		};
		let mut inner = self.inner.lock().await;
		inner.entry(room.clone()).or_default().push(message.clone());
		Ok(message)
	}

	async fn read_ordered(&self, room: &ConversationId) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.lock().await;
		Ok(inner.get(room).cloned().unwrap_or_default())
	}
}

/// SQL-backed store selected by the `database_url` scheme.
#[derive(Clone)]
pub struct PersistentMessageStore {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: PersistentBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for PersistentMessageStore {
	async fn append(&self, room: &ConversationId, author: &Username, text: &str) -> anyhow::Result<Message> {
		let message = Message {
			id: MessageId::new_v4(),
			room: room.clone(),
			author: author.clone(),
			text: text.to_string(),
			created_at_unix_ms: unix_ms_now(),
		};

		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO messages (id, room, author, body, created_at_unix_ms) VALUES (?, ?, ?, ?, ?)")
					.bind(message.id.to_string())
					.bind(message.room.as_str())
					.bind(message.author.as_str())
					.bind(&message.text)
					.bind(message.created_at_unix_ms)
					.execute(pool)
					.await
					.context("insert message (sqlite)")?;
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO messages (id, room, author, body, created_at_unix_ms) VALUES ($1, $2, $3, $4, $5)")
					.bind(message.id.to_string())
					.bind(message.room.as_str())
					.bind(message.author.as_str())
					.bind(&message.text)
					.bind(message.created_at_unix_ms)
					.execute(pool)
					.await
					.context("insert message (postgres)")?;
			}
		}

		Ok(message)
	}

	async fn read_ordered(&self, room: &ConversationId) -> anyhow::Result<Vec<Message>> {
		let rows: Vec<(String, String, String, i64)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, author, body, created_at_unix_ms FROM messages WHERE room = ? ORDER BY seq ASC")
					.bind(room.as_str())
					.fetch_all(pool)
					.await
					.context("select messages (sqlite)")?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, author, body, created_at_unix_ms FROM messages WHERE room = $1 ORDER BY seq ASC")
					.bind(room.as_str())
					.fetch_all(pool)
					.await
					.context("select messages (postgres)")?
			}
		};

		rows.into_iter()
			.map(|(id, author, body, created_at_unix_ms)| -> anyhow::Result<Message> {
				Ok(Message {
					id: MessageId(uuid::Uuid::parse_str(&id).context("parse message id column")?),
					room: room.clone(),
					author: Username::new(author).context("parse author column")?,
					text: body,
					created_at_unix_ms,
				})
			})
			.collect()
	}
}
