#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use confab_domain::{ConversationId, Username};
use confab_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use confab_protocol::wire::{ConversationReady, Envelope, ErrorReply, Hello, Msg, PROTOCOL_VERSION, Pong, Welcome, code};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::coordinator::Coordinator;
use crate::util::time::unix_ms_now;

/// Tunables for a single accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Maximum encoded frame size, advertised in Welcome and enforced on
	/// both stream directions.
	pub max_frame_bytes: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
		}
	}
}

/// Drive one client session over its single bidirectional stream.
///
/// A reader task decodes inbound envelopes into a channel; the session
/// loop consumes them. All outbound traffic, replies and broadcasts
/// alike, funnels through the hub mailbox so one writer task owns the
/// send half and preserves order.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	coordinator: Arc<Coordinator>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("confab_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("confab_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut session_send, mut session_recv) = connection.accept_bi().await.context("accept session bidirectional stream")?;

	let max_frame = settings.max_frame_bytes as usize;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match session_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("session stream read failed")),
			};

			metrics::counter!("confab_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match confab_protocol::decode_frame::<Envelope>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("confab_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(confab_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("confab_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode session frame"));
					}
				}
			}
		}
	});

	let hello = wait_for_hello(&mut ctrl_rx).await?;
	if hello.protocol_version != PROTOCOL_VERSION {
		warn!(conn_id, client_version = hello.protocol_version, "unsupported protocol version");
		let _ = send_envelope(
			&mut session_send,
			error_envelope(
				String::new(),
				code::UNSUPPORTED_VERSION,
				format!("server speaks protocol version {PROTOCOL_VERSION}"),
			),
		)
		.await;
		return Ok(());
	}

	let client_instance_id = if hello.client_instance_id.trim().is_empty() {
		format!("conn-{conn_id}")
	} else {
		hello.client_instance_id.clone()
	};

	info!(
		conn_id,
		client_name = %hello.client_name,
		client_instance_id = %client_instance_id,
		"received Hello"
	);
	metrics::counter!("confab_server_hello_total").increment(1);

	send_envelope(
		&mut session_send,
		Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::Welcome(Welcome {
				server_name: format!("confab-server/{}", env!("CARGO_PKG_VERSION")),
				server_instance_id: format!("conn-{conn_id}"),
				server_time_unix_ms: unix_ms_now(),
				max_frame_bytes: settings.max_frame_bytes,
			}),
		},
	)
	.await
	.context("send Welcome")?;

	let mut outbox = coordinator.hub().attach(conn_id).await;
	let writer_task = tokio::spawn(async move {
		while let Some(env) = outbox.recv().await {
			let frame = match encode_frame(&env, max_frame) {
				Ok(frame) => frame,
				Err(e) => {
					warn!(conn_id, error = %e, "failed to encode outbound frame");
					continue;
				}
			};

			metrics::counter!("confab_server_envelopes_out_total").increment(1);
			metrics::counter!("confab_server_bytes_out_total").increment(frame.len() as u64);

			if let Err(e) = session_send.write_all(&frame).await {
				debug!(conn_id, error = %e, "outbound write failed; peer likely gone");
				return;
			}
		}
	});

	let mut identity: Option<Username> = None;
	let mut active_room: Option<ConversationId> = None;

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let Envelope { request_id, msg, .. } = env;

			match msg {
				Msg::Ping(ping) => {
					let pong = Pong {
						client_time_unix_ms: ping.client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					};

					coordinator
						.hub()
						.send_to_conn(
							conn_id,
							Envelope {
								version: PROTOCOL_VERSION,
								request_id,
								msg: Msg::Pong(pong),
							},
						)
						.await;
				}

				Msg::ClaimIdentity(claim) => {
					debug!(conn_id, identity = %claim.identity, "received ClaimIdentity");
					match coordinator.claim(conn_id, &claim.identity).await {
						Ok(claimed) => {
							identity = Some(claimed);
						}
						Err(e) => {
							coordinator
								.hub()
								.send_to_conn(conn_id, error_envelope(request_id, code::INVALID_IDENTITY, e.to_string()))
								.await;
						}
					}
				}

				Msg::SelectConversation(select) => {
					let Some(me) = identity.clone() else {
						coordinator
							.hub()
							.send_to_conn(
								conn_id,
								error_envelope(
									request_id,
									code::NOT_IDENTIFIED,
									"claim an identity before selecting a conversation",
								),
							)
							.await;
						continue;
					};

					// The session identity is authoritative; the payload's
					// `from` is advisory only.
					if select.from != me.as_str() {
						debug!(conn_id, from = %select.from, identity = %me, "select 'from' differs from session identity");
					}

					let peer = match Username::new(select.to) {
						Ok(peer) => peer,
						Err(e) => {
							coordinator
								.hub()
								.send_to_conn(conn_id, error_envelope(request_id, code::INVALID_IDENTITY, e.to_string()))
								.await;
							continue;
						}
					};

					match coordinator.select(conn_id, &me, &peer).await {
						Ok((room, messages)) => {
							active_room = Some(room.clone());
							coordinator
								.hub()
								.send_to_conn(
									conn_id,
									Envelope {
										version: PROTOCOL_VERSION,
										request_id,
										msg: Msg::ConversationReady(ConversationReady {
											room: room.into_string(),
											with_user: peer.into_string(),
											messages,
										}),
									},
								)
								.await;
						}
						Err(e) => {
							warn!(conn_id, error = %e, "conversation history unavailable");
							coordinator
								.hub()
								.send_to_conn(
									conn_id,
									error_envelope(request_id, code::HISTORY_FAILED, "failed to load conversation history"),
								)
								.await;
						}
					}
				}

				Msg::SendMessage(send_msg) => {
					let Some(me) = identity.clone() else {
						coordinator
							.hub()
							.send_to_conn(
								conn_id,
								error_envelope(request_id, code::NOT_IDENTIFIED, "claim an identity before sending"),
							)
							.await;
						continue;
					};

					let Some(room) = active_room.clone() else {
						coordinator
							.hub()
							.send_to_conn(
								conn_id,
								error_envelope(
									request_id,
									code::NOT_IN_CONVERSATION,
									"select a conversation before sending",
								),
							)
							.await;
						continue;
					};

					if send_msg.text.trim().is_empty() {
						coordinator
							.hub()
							.send_to_conn(
								conn_id,
								error_envelope(request_id, code::EMPTY_MESSAGE, "message text must not be blank"),
							)
							.await;
						continue;
					}

					if send_msg.user != me.as_str() {
						debug!(conn_id, user = %send_msg.user, identity = %me, "send 'user' differs from session identity");
					}
					if send_msg.room != room.as_str() {
						debug!(conn_id, room = %send_msg.room, active = %room, "send 'room' differs from active conversation");
					}

					if let Err(e) = coordinator.send(&me, &room, &send_msg.text).await {
						warn!(conn_id, room = %room, error = %e, "message not persisted");
						metrics::counter!("confab_server_send_failures_total").increment(1);
						coordinator
							.hub()
							.send_to_conn(
								conn_id,
								error_envelope(request_id, code::PERSISTENCE_FAILED, "failed to persist message"),
							)
							.await;
					}
				}

				Msg::Hello(_) => {
					debug!(conn_id, "ignoring duplicate Hello");
				}

				other => {
					warn!(conn_id, "unhandled control message: {:?}", other);
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	coordinator.disconnect(conn_id).await;

	let _ = reader_task.await;
	let _ = writer_task.await;

	loop_result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<Envelope>) -> anyhow::Result<Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		if let Msg::Hello(h) = env.msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

async fn send_envelope(send: &mut quinn::SendStream, env: Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("confab_server_envelopes_out_total").increment(1);
	metrics::counter!("confab_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

fn error_envelope(request_id: String, code: &str, message: impl Into<String>) -> Envelope {
	Envelope {
		version: PROTOCOL_VERSION,
		request_id,
		msg: Msg::Error(ErrorReply {
			code: code.to_string(),
			message: message.into(),
		}),
	}
}
