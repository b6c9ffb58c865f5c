#![forbid(unsafe_code)]

use std::net::SocketAddr;

use confab_client_core::{ClientConfigV1, DEFAULT_SERVER_ENDPOINT_QUIC, Session, SessionSender};
use confab_protocol::wire::Msg;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: confab_client --identity name [--peer name] [--connect quic://host:port] [--addr ip:port] [--sni name]\n\
\n\
Options:\n\
	--identity  Username to claim on the server (required)\n\
	--peer      Peer username to open a conversation with at startup\n\
	--connect   Server endpoint (alias: --endpoint) (default: quic://127.0.0.1:18310)\n\
	            Format: quic://host:port\n\
	--endpoint  Alias for --connect\n\
	--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
	            Default: derived from --connect\n\
	--sni       TLS server name/SNI (overrides the host from --connect)\n\
	            Default: derived from --connect host\n\
	--help      Show this help\n\
\n\
Notes:\n\
	The session runs on a single bidirectional QUIC stream.\n\
	Lines read from stdin are sent into the active conversation;\n\
	`/talk name` switches peers and `/quit` exits.\n\
\n\
Examples:\n\
	confab_client --identity alice --peer bob\n\
	confab_client --connect quic://confab.example.com:443 --identity alice\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,confab_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> (SocketAddr, String, String, Option<String>) {
	let mut endpoint: String = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();

	let mut addr_override: Option<SocketAddr> = None;
	let mut sni_override: Option<String> = None;

	let mut identity: Option<String> = None;
	let mut peer: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--sni" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--sni must be non-empty");
					usage_and_exit();
				}
				sni_override = Some(v);
			}
			"--identity" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				identity = Some(v);
			}
			"--peer" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				peer = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (host, port) = ClientConfigV1::parse_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --endpoint value: {endpoint}\n{e}");
		usage_and_exit();
	});

	let identity = identity.unwrap_or_else(|| {
		eprintln!("--identity is required");
		usage_and_exit();
	});
	if let Err(e) = confab_domain::Username::new(&identity) {
		eprintln!("Invalid --identity value: {identity}\n{e}");
		usage_and_exit();
	}
	if let Some(peer) = &peer {
		if let Err(e) = confab_domain::Username::new(peer) {
			eprintln!("Invalid --peer value: {peer}\n{e}");
			usage_and_exit();
		}
	}

	let addr: SocketAddr = addr_override.unwrap_or_else(|| {
		// Placeholder when host isn't an IP literal; DNS resolves during connect.
		let ip_try: Result<SocketAddr, _> = format!("{host}:{port}").parse();
		ip_try.unwrap_or_else(|_| "0.0.0.0:0".parse().expect("valid placeholder addr"))
	});

	let sni: String = sni_override.unwrap_or(host);

	(addr, sni, identity, peer)
}

async fn run_input_loop(mut sender: SessionSender, identity: String, room_rx: watch::Receiver<Option<String>>) {
	let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) => break,
			Err(e) => {
				warn!(error = %e, "stdin read failed");
				break;
			}
		};
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if line == "/quit" {
			break;
		}
		if let Some(peer) = line.strip_prefix("/talk ") {
			if let Err(e) = sender.select_conversation(&identity, peer.trim()).await {
				warn!(error = %e, "select failed");
			}
			continue;
		}
		let room = room_rx.borrow().clone();
		let Some(room) = room else {
			warn!("no active conversation; start one with --peer or /talk <name>");
			continue;
		};
		if let Err(e) = sender.send_message(&identity, &room, line).await {
			warn!(error = %e, "send failed");
			break;
		}
	}
	sender.close(0, "client exit");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (addr, sni, identity, peer) = parse_args();

	let cfg = ClientConfigV1 {
		server_host: sni.clone(),
		server_port: addr.port(),
		server_addr: if addr.ip().is_unspecified() && addr.port() == 0 {
			None
		} else {
			Some(addr)
		},
		client_name: format!("confab-client-cli/{}", env!("CARGO_PKG_VERSION")),
		client_instance_id: format!("cli-{}", std::process::id()),
		..ClientConfigV1::default()
	};

	let resolved = cfg.server_addr.map(|a| a.to_string()).unwrap_or_else(|| "<dns>".to_string());
	info!(server = %resolved, sni = %cfg.server_host, "connecting");

	let (session, welcome) = Session::connect(cfg).await?;
	info!(server = %welcome.server_name, instance = %welcome.server_instance_id, "session established");

	let (mut sender, mut events) = session.split();
	sender.claim_identity(&identity).await?;
	if let Some(peer) = &peer {
		sender.select_conversation(&identity, peer).await?;
	}

	println!("* connected as {identity}; type a message to send, /talk <name> to switch peers, /quit to exit");

	let (room_tx, room_rx) = watch::channel(None::<String>);
	let input_task = tokio::spawn(run_input_loop(sender, identity, room_rx));

	let loop_result = events
		.run_events_loop(|msg| match msg {
			Msg::PresenceUpdate(p) => {
				if p.online.is_empty() {
					println!("* nobody else is online");
				} else {
					println!("* online: {}", p.online.join(", "));
				}
			}
			Msg::ConversationReady(ready) => {
				let _ = room_tx.send(Some(ready.room.clone()));
				println!("* conversation with {} ({} earlier messages)", ready.with_user, ready.messages.len());
				for m in &ready.messages {
					println!("[{}] {}: {}", m.room, m.author, m.text);
				}
			}
			Msg::MessageDelivered(m) => {
				println!("[{}] {}: {}", m.room, m.author, m.text);
			}
			Msg::Pong(p) => {
				debug!(
					client_time_unix_ms = p.client_time_unix_ms,
					server_time_unix_ms = p.server_time_unix_ms,
					"pong"
				);
			}
			Msg::Error(err) => {
				warn!(code = %err.code, message = %err.message, "server error");
			}
			other => {
				warn!("unhandled message: {:?}", other);
			}
		})
		.await;

	input_task.abort();
	let _ = input_task.await;
	loop_result?;
	info!("disconnected");
	Ok(())
}
