use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use tokio::net::TcpSocket;

/// Open a TCP socket bound to the given local endpoint, with `SO_REUSEADDR`
/// and `SO_REUSEPORT` so a retried attempt can re-bind the same port.
pub(crate) fn bind_tcp_socket(local: &SocketAddr) -> Result<TcpSocket, std::io::Error> {
  let tcp_socket = if local.is_ipv6() {
    TcpSocket::new_v6()
  } else {
    TcpSocket::new_v4()
  }?;
  tcp_socket.set_reuseaddr(true)?;

  #[cfg(not(target_os = "windows"))]
  tcp_socket.set_reuseport(true)?;

  tcp_socket.bind(*local)?;
  Ok(tcp_socket)
}

/// Open a UDP socket bound to the given local endpoint, with `SO_REUSEADDR`
/// and `SO_REUSEPORT` set. The socket is non-blocking so it can be handed to
/// the tokio reactor.
pub(crate) fn bind_udp_socket(local: &SocketAddr) -> Result<UdpSocket, std::io::Error> {
  let socket = if local.is_ipv6() {
    Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
  } else {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
  }?;
  socket.set_reuse_address(true)?;

  #[cfg(not(target_os = "windows"))]
  socket.set_reuse_port(true)?;

  socket.set_nonblocking(true)?;

  socket.bind(&(*local).into())?;
  Ok(socket.into())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tcp_bind_records_local_endpoint() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let socket = bind_tcp_socket(&addr).unwrap();
    let local = socket.local_addr().unwrap();
    assert_eq!(local.ip(), addr.ip());
    assert_ne!(local.port(), 0);
  }

  #[test]
  fn udp_bind_records_local_endpoint() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let socket = bind_udp_socket(&addr).unwrap();
    let local = socket.local_addr().unwrap();
    assert_eq!(local.ip(), addr.ip());
    assert_ne!(local.port(), 0);
  }
}
