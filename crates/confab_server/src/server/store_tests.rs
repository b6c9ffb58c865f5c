#![forbid(unsafe_code)]

use confab_domain::{ConversationId, Username};

use crate::server::store::{InMemoryMessageStore, MessageStore};

fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

fn room(a: &str, b: &str) -> ConversationId {
	ConversationId::between(&user(a), &user(b))
}

#[tokio::test]
async fn append_assigns_identity_and_keeps_insertion_order() {
	let store = InMemoryMessageStore::default();
	let room_ab = room("alice", "bob");

	let first = store.append(&room_ab, &user("alice"), "hi bob").await.expect("append");
	let second = store.append(&room_ab, &user("bob"), "hi alice").await.expect("append");
	let third = store.append(&room_ab, &user("alice"), "how are you").await.expect("append");

	assert_ne!(first.id, second.id);
	assert_ne!(second.id, third.id);
	assert!(first.created_at_unix_ms > 0);
	assert!(second.created_at_unix_ms >= first.created_at_unix_ms);
	assert!(third.created_at_unix_ms >= second.created_at_unix_ms);

	let history = store.read_ordered(&room_ab).await.expect("read");
	assert_eq!(history, vec![first, second, third]);
}

#[tokio::test]
async fn rooms_are_isolated() {
	let store = InMemoryMessageStore::default();
	let room_ab = room("alice", "bob");
	let room_ac = room("alice", "carol");

	store.append(&room_ab, &user("alice"), "for bob").await.expect("append");
	store.append(&room_ac, &user("alice"), "for carol").await.expect("append");

	let ab = store.read_ordered(&room_ab).await.expect("read");
	assert_eq!(ab.len(), 1);
	assert_eq!(ab[0].text, "for bob");
	assert_eq!(ab[0].room, room_ab);

	let ac = store.read_ordered(&room_ac).await.expect("read");
	assert_eq!(ac.len(), 1);
	assert_eq!(ac[0].text, "for carol");
}

#[tokio::test]
async fn reading_an_unwritten_room_yields_an_empty_history() {
	let store = InMemoryMessageStore::default();

	let history = store.read_ordered(&room("alice", "bob")).await.expect("read");
	assert!(history.is_empty());
}

#[tokio::test]
async fn append_stores_the_exact_text_and_author() {
	let store = InMemoryMessageStore::default();
	let room_ab = room("Alice", "Bob");

	let message = store.append(&room_ab, &user("Alice"), "  padded text  ").await.expect("append");
	assert_eq!(message.author, user("Alice"));
	assert_eq!(message.text, "  padded text  ");

	let history = store.read_ordered(&room_ab).await.expect("read");
	assert_eq!(history, vec![message]);
}
