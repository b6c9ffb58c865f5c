#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	/// Errors from [`QuicEndpoint::parse`] and address conversion.
	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("invalid endpoint (expected quic://host:port): {0}")]
		MissingScheme(String),
		#[error("invalid endpoint (expected quic://host:port without path/query/fragment): {0}")]
		PathQueryFragment(String),
		#[error("invalid endpoint (missing :port, expected quic://host:port): {0}")]
		MissingPort(String),
		#[error("invalid endpoint host (expected quic://host:port): {0}")]
		EmptyHost(String),
		#[error("invalid endpoint host (IPv6 must be bracketed like quic://[::1]:18310): {0}")]
		UnbracketedIpv6(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		InvalidPort(String),
		#[error("host must be an IP literal (DNS names not supported here): {0}")]
		NotIpLiteral(String),
	}

	/// Parsed `quic://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport().parse().map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}

		/// Parse a QUIC endpoint string in the form `quic://host:port`.
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = s.strip_prefix("quic://").ok_or_else(|| EndpointError::MissingScheme(s.to_string()))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(EndpointError::PathQueryFragment(s.to_string()));
			}

			let (host, port_str) = rest.rsplit_once(':').ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointError::EmptyHost(s.to_string()));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port: u16 = port_str.trim().parse().map_err(|_| EndpointError::InvalidPort(s.to_string()))?;

			if port == 0 {
				return Err(EndpointError::InvalidPort(s.to_string()));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	/// Validate `quic://host:port`.
	pub fn validate_quic_endpoint(s: &str) -> Result<(), EndpointError> {
		let _ = QuicEndpoint::parse(s)?;
		Ok(())
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = QuicEndpoint::parse("quic://confab.example.com:443").unwrap();
			assert_eq!(e.host, "confab.example.com");
			assert_eq!(e.port, 443);
			assert_eq!(e.hostport(), "confab.example.com:443");
		}

		#[test]
		fn parses_ipv4() {
			let e = QuicEndpoint::parse("quic://127.0.0.1:18310").unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 18310);
			assert_eq!(e.hostport(), "127.0.0.1:18310");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = QuicEndpoint::parse("quic://[::1]:18310").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.port, 18310);
			assert_eq!(e.hostport(), "[::1]:18310");
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = QuicEndpoint::parse("quic://::1:18310").unwrap_err();
			assert!(matches!(err, EndpointError::UnbracketedIpv6(_)));
		}

		#[test]
		fn rejects_path_query_fragment() {
			assert!(QuicEndpoint::parse("quic://127.0.0.1:18310/").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1:18310?x=y").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1:18310#frag").is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1:0").unwrap_err(),
				EndpointError::InvalidPort(_)
			));
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1").unwrap_err(),
				EndpointError::MissingPort(_)
			));
		}

		#[test]
		fn to_socket_addr_if_ip_literal_accepts_ip_literals() {
			let e4 = QuicEndpoint::parse("quic://127.0.0.1:18310").unwrap();
			let a4 = e4.to_socket_addr_if_ip_literal().unwrap();
			assert_eq!(a4.to_string(), "127.0.0.1:18310");

			let e6 = QuicEndpoint::parse("quic://[::1]:18310").unwrap();
			let a6 = e6.to_socket_addr_if_ip_literal().unwrap();
			assert_eq!(a6.to_string(), "[::1]:18310");
		}

		#[test]
		fn to_socket_addr_if_ip_literal_rejects_dns() {
			let e = QuicEndpoint::parse("quic://confab.example.com:443").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
