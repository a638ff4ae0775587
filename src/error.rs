//! Error types for the fallible parts of the public API.
//!
//! Stream-level failures never surface here: they travel upstream as
//! `Event::StreamEnd(ErrorKind)` on the connection's input sink.

use std::net::SocketAddr;

/// Errors returned by connection setup operations.
#[derive(thiserror::Error, Debug)]
pub enum OutboundError {
  #[error("Socket bind failed for {address}: {source}")]
  Bind {
    address: SocketAddr,
    #[source]
    source: std::io::Error,
  },

  #[error("Invalid bind address: {address}")]
  InvalidBindAddress { address: String },

  #[error("Connection has already been started")]
  AlreadyStarted,
}

/// Errors produced by the DNS resolver abstraction.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
  #[error("Failed to initialize DNS resolver: {reason}")]
  Init { reason: String },

  #[error("DNS resolution failed for {host}: {reason}")]
  Lookup { host: String, reason: String },

  #[error("No addresses found for {host}")]
  NoAddresses { host: String },
}

impl ResolveError {
  pub fn init(reason: impl Into<String>) -> Self {
    Self::Init { reason: reason.into() }
  }

  pub fn lookup(host: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Lookup {
      host: host.into(),
      reason: reason.into(),
    }
  }

  pub fn no_addresses(host: impl Into<String>) -> Self {
    Self::NoAddresses { host: host.into() }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::str::FromStr;

  #[test]
  fn bind_error_carries_address_and_source() {
    let addr = SocketAddr::from_str("127.0.0.1:8080").unwrap();
    let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "Address in use");
    let err = OutboundError::Bind {
      address: addr,
      source: io_err,
    };
    let msg = format!("{err}");
    assert!(msg.contains("127.0.0.1:8080"));
    assert!(msg.contains("Address in use"));
  }

  #[test]
  fn resolve_error_helpers() {
    let err = ResolveError::lookup("example.com", "timed out");
    assert!(format!("{err}").contains("example.com"));
    assert!(format!("{err}").contains("timed out"));

    let err = ResolveError::no_addresses("empty.example");
    assert!(format!("{err}").contains("empty.example"));
  }
}
