//! DNS resolution abstractions.
//!
//! Resolution is one of the suspension points of a connection attempt; the
//! whole attempt runs under the connect timeout and is cancelled by dropping
//! the in-flight future, so resolver implementations need no explicit cancel
//! operation.

use crate::error::ResolveError;
use hickory_resolver::TokioResolver;
use std::{cell::RefCell, collections::HashMap, net::SocketAddr, rc::Rc};

/// Trait for DNS resolution strategies.
#[async_trait::async_trait(?Send)]
pub trait DnsResolver {
  /// Resolve a hostname to socket addresses carrying the given port.
  async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError>;
}

/* ---------------------------------------------------------- */
/// Resolver backed by the system DNS configuration.
pub struct SystemResolver {
  inner: TokioResolver,
}

impl SystemResolver {
  /// Create a resolver from the system configuration (`/etc/resolv.conf` on unix).
  pub fn try_new() -> Result<Self, ResolveError> {
    let inner = TokioResolver::builder_tokio()
      .map_err(|e| ResolveError::init(e.to_string()))?
      .build();
    Ok(Self { inner })
  }
}

#[async_trait::async_trait(?Send)]
impl DnsResolver for SystemResolver {
  async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
    let response = self
      .inner
      .lookup_ip(host)
      .await
      .map_err(|e| ResolveError::lookup(host, e.to_string()))?;

    let addresses: Vec<SocketAddr> = response.iter().map(|ip| SocketAddr::new(ip, port)).collect();
    if addresses.is_empty() {
      return Err(ResolveError::no_addresses(host));
    }
    Ok(addresses)
  }
}

/* ---------------------------------------------------------- */
/// Mock DNS resolver for testing.
#[derive(Default)]
pub struct MockDnsResolver {
  responses: HashMap<String, Vec<SocketAddr>>,
}

impl MockDnsResolver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a mock response for a hostname.
  pub fn add_response(&mut self, host: &str, addresses: Vec<SocketAddr>) {
    self.responses.insert(host.to_string(), addresses);
  }

  /// Set multiple responses at once.
  pub fn with_responses(mut self, responses: HashMap<String, Vec<SocketAddr>>) -> Self {
    self.responses = responses;
    self
  }
}

#[async_trait::async_trait(?Send)]
impl DnsResolver for MockDnsResolver {
  async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
    if let Some(base) = self.responses.get(host) {
      Ok(base.iter().map(|addr| SocketAddr::new(addr.ip(), port)).collect())
    } else {
      Err(ResolveError::lookup(host, "no mock response configured"))
    }
  }
}

/* ---------------------------------------------------------- */
thread_local! {
  static SYSTEM_RESOLVER: RefCell<Option<Rc<SystemResolver>>> = const { RefCell::new(None) };
}

/// Per-worker shared system resolver, built lazily on first use.
/// Initialization failures are not cached; the next caller retries.
pub(crate) fn shared_system_resolver() -> Result<Rc<dyn DnsResolver>, ResolveError> {
  SYSTEM_RESOLVER.with(|cell| {
    let mut slot = cell.borrow_mut();
    if let Some(resolver) = slot.as_ref() {
      return Ok(resolver.clone() as Rc<dyn DnsResolver>);
    }
    let resolver = Rc::new(SystemResolver::try_new()?);
    *slot = Some(resolver.clone());
    Ok(resolver as Rc<dyn DnsResolver>)
  })
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{IpAddr, Ipv4Addr};

  #[tokio::test]
  async fn mock_resolver_applies_port() {
    let mut resolver = MockDnsResolver::new();
    resolver.add_response(
      "example.com",
      vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 0)],
    );

    let addresses = resolver.resolve("example.com", 8080).await.unwrap();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0], "192.0.2.1:8080".parse().unwrap());
  }

  #[tokio::test]
  async fn mock_resolver_unknown_host() {
    let resolver = MockDnsResolver::new();
    let err = resolver.resolve("notfound.example", 8080).await.unwrap_err();
    assert!(matches!(err, ResolveError::Lookup { .. }));
  }

  #[test]
  fn mock_resolver_with_responses() {
    let mut responses = HashMap::new();
    responses.insert(
      "test1.com".to_string(),
      vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 0)],
    );
    responses.insert(
      "test2.com".to_string(),
      vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)), 0)],
    );

    let resolver = MockDnsResolver::new().with_responses(responses);
    assert_eq!(resolver.responses.len(), 2);
    assert!(resolver.responses.contains_key("test1.com"));
  }
}
