#![forbid(unsafe_code)]

//! Client-side session library: connect to a confab server over QUIC,
//! complete the Hello/Welcome handshake and run the v1 session protocol
//! on a single bidirectional stream.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use confab_protocol::wire::{
	ClaimIdentity, Envelope, Hello, Msg, PROTOCOL_VERSION, Ping, SelectConversation, SendMessage, Welcome,
};
use confab_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use confab_util::endpoint::QuicEndpoint;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};

/// Default dev server endpoint, matching the server's default bind.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18310";

/// Connection parameters for a v1 session.
#[derive(Debug, Clone)]
pub struct ClientConfigV1 {
	/// Host used for DNS resolution (when `server_addr` is `None`) and as
	/// the TLS server name.
	pub server_host: String,
	pub server_port: u16,
	/// Explicit server address; skips DNS resolution when set.
	pub server_addr: Option<SocketAddr>,
	pub client_name: String,
	pub client_instance_id: String,
	pub max_frame_bytes: usize,
	pub connect_timeout: Duration,
}

impl Default for ClientConfigV1 {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18310,
			server_addr: Some("127.0.0.1:18310".parse().expect("valid default addr")),
			client_name: format!("confab-client-core/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: "dev-instance".to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

impl ClientConfigV1 {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), String> {
		let ep = QuicEndpoint::parse(endpoint).map_err(|e| e.to_string())?;
		Ok((ep.host, ep.port))
	}

	/// Build a config for `quic://host:port`, defaulting everything else.
	/// DNS hosts leave `server_addr` unset; resolution happens on connect.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, String> {
		let ep = QuicEndpoint::parse(endpoint).map_err(|e| e.to_string())?;
		let server_addr = ep.to_socket_addr_if_ip_literal().ok();
		Ok(Self {
			server_host: ep.host,
			server_port: ep.port,
			server_addr,
			..Self::default()
		})
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),
	#[error("failed to connect: {0}")]
	Connect(String),
	#[error(transparent)]
	Framing(#[from] FramingError),
	#[error("protocol error: {0}")]
	Protocol(String),
	#[error("io error: {0}")]
	Io(String),
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		Self::Other(format!("{e:#}"))
	}
}

/// An established session on its single bidirectional stream.
///
/// Produced by [`Session::connect`] after the Hello/Welcome handshake.
/// [`Session::split`] separates the command half from the events half so
/// that sending and receiving can run on independent tasks.
pub struct Session {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl Session {
	/// Connect to the server, open the session stream and complete the
	/// Hello/Welcome handshake.
	pub async fn connect(cfg: ClientConfigV1) -> Result<(Self, Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let server_name = cfg.server_host.clone();
		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("resolve {hostport}: {e}")))?
					.collect()
			}
		};
		if candidates.is_empty() {
			return Err(ClientCoreError::Connect(format!(
				"no addresses resolved for {}:{}",
				cfg.server_host, cfg.server_port
			)));
		}

		let mut last_err: Option<ClientCoreError> = None;
		let mut conn: Option<quinn::Connection> = None;
		for server_addr in candidates {
			let connecting = match endpoint.connect_with(quinn_cfg.clone(), server_addr, &server_name) {
				Ok(c) => c,
				Err(e) => {
					last_err = Some(ClientCoreError::Connect(format!("connect {server_addr}: {e}")));
					continue;
				}
			};
			match tokio::time::timeout(cfg.connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(ClientCoreError::Connect(format!("connect {server_addr}: {e}")));
				}
				Err(_) => {
					last_err = Some(ClientCoreError::Connect(format!(
						"connect {server_addr}: timeout after {:?}",
						cfg.connect_timeout
					)));
				}
			}
		}
		let conn = match conn {
			Some(c) => c,
			None => return Err(last_err.unwrap_or_else(|| ClientCoreError::Connect("no addresses attempted".to_string()))),
		};
		info!(remote = %conn.remote_address(), "connected");

		let (mut send, mut recv) = tokio::time::timeout(cfg.connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Connect("open session stream: timeout".to_string()))?
			.map_err(|e| ClientCoreError::Connect(format!("open session stream: {e}")))?;

		let hello = Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::Hello(Hello {
				client_name: cfg.client_name.clone(),
				client_instance_id: cfg.client_instance_id.clone(),
				protocol_version: PROTOCOL_VERSION,
			}),
		};
		write_envelope(&mut send, &hello, cfg.max_frame_bytes).await?;

		// Frames coalesce on the stream; bytes past the Welcome must stay
		// buffered for the events half.
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let reply = tokio::time::timeout(cfg.connect_timeout, read_one_envelope(&mut recv, &mut buf, cfg.max_frame_bytes))
			.await
			.map_err(|_| ClientCoreError::Connect("await Welcome: timeout".to_string()))??;
		let welcome = match reply.msg {
			Msg::Welcome(w) => w,
			Msg::Error(err) => {
				return Err(ClientCoreError::Protocol(format!(
					"server rejected session: {}: {}",
					err.code, err.message
				)));
			}
			other => return Err(ClientCoreError::Protocol(format!("expected Welcome, got {other:?}"))),
		};
		debug!(
			server_name = %welcome.server_name,
			server_instance_id = %welcome.server_instance_id,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		// Honor the smaller of the two frame limits.
		let max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);

		Ok((
			Self {
				conn,
				send,
				recv,
				buf,
				max_frame_bytes,
			},
			welcome,
		))
	}

	/// Split into the command half and the events half.
	pub fn split(self) -> (SessionSender, SessionEvents) {
		(
			SessionSender {
				conn: self.conn,
				send: self.send,
				max_frame_bytes: self.max_frame_bytes,
			},
			SessionEvents {
				recv: self.recv,
				buf: self.buf,
				max_frame_bytes: self.max_frame_bytes,
			},
		)
	}

	/// Close the connection immediately.
	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}
}

/// Write half of a [`Session`]: sends commands, never reads.
///
/// Replies and errors for these commands arrive on the paired
/// [`SessionEvents`] half.
pub struct SessionSender {
	conn: quinn::Connection,
	send: quinn::SendStream,
	max_frame_bytes: usize,
}

impl SessionSender {
	/// Send a raw envelope on the session stream.
	pub async fn send_envelope(&mut self, env: &Envelope) -> Result<(), ClientCoreError> {
		write_envelope(&mut self.send, env, self.max_frame_bytes).await
	}

	/// Claim `identity` for this connection. A fresh presence update
	/// (or an `INVALID_IDENTITY` error) comes back on the events half.
	pub async fn claim_identity(&mut self, identity: &str) -> Result<(), ClientCoreError> {
		debug!(identity = %identity, "sending claim-identity");
		self.send_envelope(&Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::ClaimIdentity(ClaimIdentity {
				identity: identity.to_string(),
			}),
		})
		.await
	}

	/// Open the conversation between `from` and `to`. The server replies
	/// with `ConversationReady` carrying the room and its history.
	pub async fn select_conversation(&mut self, from: &str, to: &str) -> Result<(), ClientCoreError> {
		debug!(from = %from, to = %to, "sending select-conversation");
		self.send_envelope(&Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::SelectConversation(SelectConversation {
				from: from.to_string(),
				to: to.to_string(),
			}),
		})
		.await
	}

	/// Send `text` into `room`. Delivery comes back as `MessageDelivered`,
	/// echoed to the sender as well.
	pub async fn send_message(&mut self, user: &str, room: &str, text: &str) -> Result<(), ClientCoreError> {
		self.send_envelope(&Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::SendMessage(SendMessage {
				text: text.to_string(),
				user: user.to_string(),
				room: room.to_string(),
			}),
		})
		.await
	}

	/// Fire a ping; the pong arrives on the events half.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<(), ClientCoreError> {
		self.send_envelope(&Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Msg::Ping(Ping { client_time_unix_ms }),
		})
		.await
	}

	/// Close the connection immediately.
	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}
}

/// Read half of a [`Session`]: every server frame arrives here, both
/// replies to commands and unsolicited pushes.
pub struct SessionEvents {
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl SessionEvents {
	/// Next envelope from the session stream, or `None` once the server
	/// has closed it.
	pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, ClientCoreError> {
		let mut tmp = [0u8; 8192];
		loop {
			// Try decoding first in case the buffer already holds a full frame.
			match try_decode_frame_from_buffer::<Envelope>(&mut self.buf, self.max_frame_bytes) {
				Ok(Some(env)) => return Ok(Some(env)),
				Ok(None) => {}
				Err(e) => return Err(ClientCoreError::Framing(e)),
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok(None),
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};
			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	/// Run until the stream closes, passing each server message to
	/// `on_msg`.
	pub async fn run_events_loop<F>(&mut self, mut on_msg: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(Msg),
	{
		while let Some(env) = self.next_envelope().await? {
			debug!(kind = %msg_kind(&env.msg), "session stream decoded");
			match env.msg {
				msg @ (Msg::PresenceUpdate(_)
				| Msg::ConversationReady(_)
				| Msg::MessageDelivered(_)
				| Msg::Pong(_)
				| Msg::Error(_)) => on_msg(msg),
				other => warn!("unexpected message on session stream: {:?}", other),
			}
		}
		info!("session stream closed");
		Ok(())
	}
}

async fn write_envelope(send: &mut quinn::SendStream, env: &Envelope, max_frame_bytes: usize) -> Result<(), ClientCoreError> {
	let bytes = encode_frame(env, max_frame_bytes).map_err(ClientCoreError::Framing)?;
	send.write_all(&bytes).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

async fn read_one_envelope(
	recv: &mut quinn::RecvStream,
	buf: &mut BytesMut,
	max_frame_bytes: usize,
) -> Result<Envelope, ClientCoreError> {
	let mut tmp = [0u8; 8192];
	loop {
		// Try decoding first in case the buffer already holds a full frame.
		match try_decode_frame_from_buffer::<Envelope>(buf, max_frame_bytes) {
			Ok(Some(env)) => return Ok(env),
			Ok(None) => {}
			Err(e) => return Err(ClientCoreError::Framing(e)),
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		};
		buf.extend_from_slice(&tmp[..n]);
	}
}

fn msg_kind(msg: &Msg) -> &'static str {
	match msg {
		Msg::Hello(_) => "hello",
		Msg::Welcome(_) => "welcome",
		Msg::ClaimIdentity(_) => "claim-identity",
		Msg::PresenceUpdate(_) => "presence-update",
		Msg::SelectConversation(_) => "select-conversation",
		Msg::ConversationReady(_) => "conversation-ready",
		Msg::SendMessage(_) => "send-message",
		Msg::MessageDelivered(_) => "message-delivered",
		Msg::Ping(_) => "ping",
		Msg::Pong(_) => "pong",
		Msg::Error(_) => "error",
	}
}

fn make_client_endpoint() -> anyhow::Result<quinn::Endpoint> {
	let endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap()).context("create client endpoint")?;
	Ok(endpoint)
}

fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	// Dev/demo TLS: accept any server certificate. Pairs with the
	// server's self-signed dev certs.
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			let _ = _intermediates;
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();
	tls.dangerous().set_certificate_verifier(std::sync::Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"confab-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).context("build QUIC client TLS config")?;
	let mut cfg = quinn::ClientConfig::new(std::sync::Arc::new(quic_tls));

	// One bidirectional stream is all the session protocol uses; the
	// server never opens streams toward the client.
	let mut transport = quinn::TransportConfig::default();
	transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(8));
	transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
	cfg.transport_config(std::sync::Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfigV1::default();
		assert_eq!(cfg.server_port, 18310);
		assert!(cfg.server_addr.is_some());
		assert_eq!(cfg.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert!(cfg.client_name.starts_with("confab-client-core/"));
	}

	#[test]
	fn from_quic_endpoint_resolves_ip_literals_eagerly() {
		let cfg = ClientConfigV1::from_quic_endpoint("quic://127.0.0.1:4433").expect("parse");
		assert_eq!(cfg.server_host, "127.0.0.1");
		assert_eq!(cfg.server_port, 4433);
		assert_eq!(cfg.server_addr, Some("127.0.0.1:4433".parse().expect("addr")));

		let cfg = ClientConfigV1::from_quic_endpoint("quic://chat.example.com:4433").expect("parse");
		assert_eq!(cfg.server_host, "chat.example.com");
		assert_eq!(cfg.server_addr, None);
	}

	#[test]
	fn bad_endpoints_are_rejected() {
		assert!(ClientConfigV1::from_quic_endpoint("").is_err());
		assert!(ClientConfigV1::from_quic_endpoint("quic://host").is_err());
		assert!(ClientConfigV1::from_quic_endpoint("https://host:443").is_err());
	}
}
