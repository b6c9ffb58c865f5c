#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use confab_client_core::{ClientConfigV1, Session, SessionEvents};
use confab_protocol::wire::Msg;
use confab_server::quic::config::QuicServerConfig;
use confab_server::server::connection::ConnectionSettings;
use confab_server::server::coordinator::Coordinator;
use confab_server::server::presence::PresenceRegistry;
use confab_server::server::room_hub::{RoomHub, RoomHubConfig};
use confab_server::server::store::InMemoryMessageStore;
use tokio::sync::mpsc;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("CONFAB_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn client_cfg(server_addr: SocketAddr, instance: &str) -> ClientConfigV1 {
	ClientConfigV1 {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		client_name: "confab-test-client".to_string(),
		client_instance_id: instance.to_string(),
		..ClientConfigV1::default()
	}
}

type EventsTask = tokio::task::JoinHandle<Result<(), confab_client_core::ClientCoreError>>;

fn pump_events(mut events: SessionEvents) -> (mpsc::UnboundedReceiver<Msg>, EventsTask) {
	let (tx, rx) = mpsc::unbounded_channel();
	let task = tokio::spawn(async move {
		events
			.run_events_loop(move |msg| {
				let _ = tx.send(msg);
			})
			.await
	});
	(rx, task)
}

async fn next_msg(rx: &mut mpsc::UnboundedReceiver<Msg>) -> anyhow::Result<Msg> {
	tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.context("timeout waiting for server message")?
		.ok_or_else(|| anyhow!("events channel closed"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_smoke_two_clients_exchange_messages() -> anyhow::Result<()> {
	init_test_logging();

	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let (endpoint, _cert_der) = QuicServerConfig::dev(bind_addr).bind_dev_endpoint()?;
	let server_addr = endpoint.local_addr().context("server local_addr")?;
	tracing::info!(?server_addr, "test: server endpoint bound");

	let coordinator = Arc::new(Coordinator::new(
		PresenceRegistry::new(),
		RoomHub::new(RoomHubConfig::default()),
		Arc::new(InMemoryMessageStore::default()),
	));

	let accept_endpoint = endpoint.clone();
	let server_coordinator = Arc::clone(&coordinator);
	let server_task =
		tokio::spawn(
			async move { confab_server::serve(accept_endpoint, server_coordinator, ConnectionSettings::default()).await },
		);

	// First client: handshake fields come from the real server.
	let (alice_session, welcome) = Session::connect(client_cfg(server_addr, "alice-instance"))
		.await
		.context("alice connect")?;
	assert!(welcome.server_name.starts_with("confab-server/"), "got: {}", welcome.server_name);
	assert_eq!(welcome.max_frame_bytes, confab_protocol::DEFAULT_MAX_FRAME_SIZE as u32);

	let (mut alice, alice_events) = alice_session.split();
	let (mut alice_rx, alice_task) = pump_events(alice_events);

	alice.claim_identity("alice").await.context("alice claim")?;
	match next_msg(&mut alice_rx).await? {
		Msg::PresenceUpdate(p) => assert_eq!(p.online, Vec::<String>::new()),
		other => panic!("expected empty presence for alice, got: {other:?}"),
	}

	// Ping round-trips through the session stream.
	alice.ping(1234).await.context("alice ping")?;
	match next_msg(&mut alice_rx).await? {
		Msg::Pong(p) => {
			assert_eq!(p.client_time_unix_ms, 1234);
			assert!(p.server_time_unix_ms > 0);
		}
		other => panic!("expected Pong, got: {other:?}"),
	}

	// Second client: both sides see the updated roster.
	let (bob_session, _welcome) = Session::connect(client_cfg(server_addr, "bob-instance"))
		.await
		.context("bob connect")?;
	let (mut bob, bob_events) = bob_session.split();
	let (mut bob_rx, bob_task) = pump_events(bob_events);

	bob.claim_identity("bob").await.context("bob claim")?;
	match next_msg(&mut bob_rx).await? {
		Msg::PresenceUpdate(p) => assert_eq!(p.online, vec!["alice".to_string()]),
		other => panic!("expected alice in bob's presence, got: {other:?}"),
	}
	match next_msg(&mut alice_rx).await? {
		Msg::PresenceUpdate(p) => assert_eq!(p.online, vec!["bob".to_string()]),
		other => panic!("expected bob in alice's presence, got: {other:?}"),
	}

	// Both select the conversation; the derived room is order-independent.
	alice.select_conversation("alice", "bob").await.context("alice select")?;
	match next_msg(&mut alice_rx).await? {
		Msg::ConversationReady(ready) => {
			assert_eq!(ready.room, "alice-bob");
			assert_eq!(ready.with_user, "bob");
			assert!(ready.messages.is_empty());
		}
		other => panic!("expected ConversationReady for alice, got: {other:?}"),
	}

	bob.select_conversation("bob", "alice").await.context("bob select")?;
	match next_msg(&mut bob_rx).await? {
		Msg::ConversationReady(ready) => {
			assert_eq!(ready.room, "alice-bob");
			assert_eq!(ready.with_user, "alice");
			assert!(ready.messages.is_empty());
		}
		other => panic!("expected ConversationReady for bob, got: {other:?}"),
	}

	// A message reaches both members, the sender included.
	alice
		.send_message("alice", "alice-bob", "hello from alice")
		.await
		.context("alice send")?;
	let alice_copy = match next_msg(&mut alice_rx).await? {
		Msg::MessageDelivered(m) => m,
		other => panic!("expected MessageDelivered echo for alice, got: {other:?}"),
	};
	let bob_copy = match next_msg(&mut bob_rx).await? {
		Msg::MessageDelivered(m) => m,
		other => panic!("expected MessageDelivered for bob, got: {other:?}"),
	};
	assert_eq!(alice_copy, bob_copy);
	assert_eq!(alice_copy.author.as_str(), "alice");
	assert_eq!(alice_copy.room.as_str(), "alice-bob");
	assert_eq!(alice_copy.text, "hello from alice");

	bob.send_message("bob", "alice-bob", "hi alice").await.context("bob send")?;
	match next_msg(&mut bob_rx).await? {
		Msg::MessageDelivered(m) => assert_eq!(m.text, "hi alice"),
		other => panic!("expected MessageDelivered echo for bob, got: {other:?}"),
	}
	match next_msg(&mut alice_rx).await? {
		Msg::MessageDelivered(m) => assert_eq!(m.author.as_str(), "bob"),
		other => panic!("expected MessageDelivered for alice, got: {other:?}"),
	}

	// Re-selecting replays the persisted history, oldest first.
	alice.select_conversation("alice", "bob").await.context("alice reselect")?;
	match next_msg(&mut alice_rx).await? {
		Msg::ConversationReady(ready) => {
			assert_eq!(ready.messages.len(), 2);
			assert_eq!(ready.messages[0].text, "hello from alice");
			assert_eq!(ready.messages[1].text, "hi alice");
			assert_eq!(ready.messages[1].author.as_str(), "bob");
		}
		other => panic!("expected replayed history for alice, got: {other:?}"),
	}

	alice.close(0, "test over");
	bob.close(0, "test over");
	alice_task.abort();
	bob_task.abort();
	let _ = alice_task.await;
	let _ = bob_task.await;

	endpoint.close(0u32.into(), b"test over");
	let server_res = server_task.await.context("server join")?;
	server_res.context("server run")?;

	Ok(())
}
