#![forbid(unsafe_code)]

pub mod config;
pub mod quic;
pub mod server;
pub mod util;

use std::sync::Arc;

use tracing::{info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::coordinator::Coordinator;

/// QUIC endpoint the server binds when nothing else is configured.
pub const DEFAULT_BIND_ENDPOINT: &str = "quic://127.0.0.1:18310";

/// Accept QUIC connections until the endpoint closes.
///
/// Every accepted connection gets a process-unique id and its own handler
/// task over the shared coordinator.
pub async fn serve(endpoint: quinn::Endpoint, coordinator: Arc<Coordinator>, settings: ConnectionSettings) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;
	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("confab_server_connections_total").increment(1);

		let coordinator = Arc::clone(&coordinator);
		let settings = settings.clone();
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, coordinator, settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	info!("QUIC endpoint closed; accept loop exiting");
	Ok(())
}
