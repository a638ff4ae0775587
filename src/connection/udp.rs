//! Datagram (UDP) outbound connection.
//!
//! "Connecting" a datagram socket binds the peer address so sends and
//! receives are restricted to it and the OS surfaces ICMP unreachables as
//! errors. Message framing on the event stream delimits datagrams: one
//! `MessageStart .. MessageEnd` group maps to exactly one datagram, and each
//! received datagram is emitted upstream as one framed message.

use super::{resolve_target, ConnectionOptions, ConnectionState, OutboundCore, OutboundStatus, Protocol};
use crate::{
  error::OutboundError,
  event::{ErrorKind, Event, EventSink},
  resolver::DnsResolver,
  socket::bind_udp_socket,
  timer::Timer,
  trace::*,
};
use bytes::{Bytes, BytesMut};
use std::{
  cell::{Cell, RefCell},
  collections::VecDeque,
  net::{IpAddr, SocketAddr},
  rc::Rc,
  sync::OnceLock,
  time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

/// Any socket address for IPv4 for auto-binding
static ANY_SOCKET_V4: OnceLock<SocketAddr> = OnceLock::new();
/// Any socket address for IPv6 for auto-binding
static ANY_SOCKET_V6: OnceLock<SocketAddr> = OnceLock::new();

fn any_bind_addr(target: &SocketAddr) -> SocketAddr {
  match target {
    SocketAddr::V4(_) => *ANY_SOCKET_V4.get_or_init(|| "0.0.0.0:0".parse().unwrap()),
    SocketAddr::V6(_) => *ANY_SOCKET_V6.get_or_init(|| "[::]:0".parse().unwrap()),
  }
}

/* ---------------------------------------------------------- */
/// Accumulates the event stream into outgoing datagrams.
///
/// `MessageStart` opens a datagram and discards any partial payload from a
/// previous unterminated message; `Data` appends iff a message is open;
/// `MessageEnd` finalizes the buffer into one datagram; `StreamEnd` marks the
/// stream ended, after which new starts are ignored.
#[derive(Default)]
struct DatagramFramer {
  buffer: BytesMut,
  started: bool,
  ended: bool,
  ready: VecDeque<Bytes>,
}

impl DatagramFramer {
  fn push(&mut self, evt: Event) {
    match evt {
      Event::MessageStart => {
        if !self.ended {
          self.started = true;
          self.buffer.clear();
        }
      }
      Event::Data(data) => {
        if self.started {
          self.buffer.extend_from_slice(&data);
        }
      }
      Event::MessageEnd => {
        if self.started {
          self.ready.push_back(self.buffer.split().freeze());
          self.started = false;
        }
      }
      Event::StreamEnd(_) => {
        if !self.ended {
          self.ended = true;
          self.started = false;
        }
      }
    }
  }

  fn pop_ready(&mut self) -> Option<Bytes> {
    self.ready.pop_front()
  }

  fn pending_bytes(&self) -> usize {
    self.ready.iter().map(|d| d.len()).sum::<usize>() + self.buffer.len()
  }
}

/* ---------------------------------------------------------- */
/// Outbound UDP connection.
pub struct UdpConnection {
  core: Rc<OutboundCore>,
  tx: mpsc::UnboundedSender<Event>,
  rx: RefCell<Option<mpsc::UnboundedReceiver<Event>>>,
  cancel: CancellationToken,
  socket: RefCell<Option<std::net::UdpSocket>>,
  bound_local: Cell<Option<SocketAddr>>,
  started: Cell<bool>,
}

impl UdpConnection {
  /// Create a connection feeding its output into `input`.
  pub fn new(input: impl EventSink + 'static, options: ConnectionOptions) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      core: OutboundCore::new(Protocol::Udp, Box::new(input), options),
      tx,
      rx: RefCell::new(Some(rx)),
      cancel: CancellationToken::new(),
      socket: RefCell::new(None),
      bound_local: Cell::new(None),
      started: Cell::new(false),
    }
  }

  /// Bind the local endpoint. Optional; must precede [`UdpConnection::connect`].
  pub fn bind(&self, ip: &str, port: u16) -> Result<(), OutboundError> {
    if self.started.get() {
      return Err(OutboundError::AlreadyStarted);
    }
    let ip: IpAddr = ip.parse().map_err(|_| OutboundError::InvalidBindAddress {
      address: ip.to_string(),
    })?;
    let addr = SocketAddr::new(ip, port);
    let socket = bind_udp_socket(&addr).map_err(|e| OutboundError::Bind {
      address: addr,
      source: e,
    })?;
    let local = socket.local_addr().map_err(|e| OutboundError::Bind {
      address: addr,
      source: e,
    })?;
    self.core.set_local_addr(local);
    self.bound_local.set(Some(local));
    *self.socket.borrow_mut() = Some(socket);
    Ok(())
  }

  /// Begin the lifecycle towards `host:port`. Non-blocking; single-use.
  pub fn connect(&self, host: &str, port: u16) {
    if self.core.state() == ConnectionState::Closed {
      warn!("{} connect() on a closed connection", self.core.describe());
      return;
    }
    if self.started.replace(true) {
      warn!("{} connect() called more than once", self.core.describe());
      return;
    }
    self.core.set_destination(host, port);

    let Some(rx) = self.rx.borrow_mut().take() else {
      return;
    };
    let driver = run_driver(
      self.core.clone(),
      rx,
      self.cancel.clone(),
      self.socket.borrow_mut().take(),
      self.bound_local.get(),
    );
    tokio::task::spawn_local(driver);
  }

  /// Feed one upstream event into the datagram framer. Events sent before
  /// the connection is established are queued and flushed once connected.
  pub fn send(&self, evt: Event) {
    let _ = self.tx.send(evt);
  }

  /// Request a graceful shutdown: cancel outstanding operations, close the
  /// socket and transition to `Closed`. Idempotent; emits no event.
  pub fn close(&self) {
    if self.core.state() == ConnectionState::Closed {
      return;
    }
    debug!("{} closing", self.core.describe());
    self.cancel.cancel();
    self.core.set_state(ConnectionState::Closed);
  }

  pub fn state(&self) -> ConnectionState {
    self.core.state()
  }

  pub fn status(&self) -> OutboundStatus {
    self.core.status()
  }

  pub fn protocol_name(&self) -> &'static str {
    self.core.protocol_name()
  }

  /// Canonical `"[host]:port"` metric label.
  pub fn address(&self) -> String {
    self.core.address()
  }
}

/* ---------------------------------------------------------- */
/// One resolve-and-connect attempt for a datagram socket.
async fn attempt_once(
  core: &Rc<OutboundCore>,
  resolver: &Option<Rc<dyn DnsResolver>>,
  prebound: Option<std::net::UdpSocket>,
  bound_local: Option<SocketAddr>,
) -> Result<UdpSocket, ErrorKind> {
  core.begin_attempt();
  let target = resolve_target(core, resolver).await?;

  core.set_state(ConnectionState::Connecting);
  debug!("{} connecting...", core.describe());

  let std_socket = match prebound {
    Some(socket) => socket,
    None => {
      let bind_addr = bound_local.unwrap_or_else(|| any_bind_addr(&target));
      bind_udp_socket(&bind_addr).map_err(|e| {
        error!("{} cannot bind datagram socket: {e}", core.describe());
        ErrorKind::ConnectionRefused
      })?
    }
  };
  let socket = UdpSocket::from_std(std_socket).map_err(|e| {
    error!("{} cannot register datagram socket: {e}", core.describe());
    ErrorKind::ConnectionRefused
  })?;

  socket.connect(target).await.map_err(|e| {
    error!("{} cannot connect: {e}", core.describe());
    ErrorKind::ConnectionRefused
  })?;
  Ok(socket)
}

/// Drive the whole lifecycle: retry loop around resolve/connect, then the
/// datagram send pump, receive loop and idle timer.
async fn run_driver(
  core: Rc<OutboundCore>,
  rx: mpsc::UnboundedReceiver<Event>,
  cancel: CancellationToken,
  mut prebound: Option<std::net::UdpSocket>,
  bound_local: Option<SocketAddr>,
) {
  let resolver = core.options().resolver.clone();
  let connect_timeout = core.options().connect_timeout;

  let socket = loop {
    let attempt = attempt_once(&core, &resolver, prebound.take(), bound_local);
    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => return, // close() already knows; emit nothing
      result = async {
        if connect_timeout > Duration::ZERO {
          match timeout(connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
              error!("{} connect timeout", core.describe());
              Err(ErrorKind::ConnectionTimeout)
            }
          }
        } else {
          attempt.await
        }
      } => result,
    };

    match result {
      Ok(socket) => break socket,
      Err(kind) => match core.retry_or_terminate(kind) {
        None => return,
        Some(delay) if delay > Duration::ZERO => {
          let mut retry = Timer::after(delay);
          tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = retry.expired() => {}
          }
        }
        Some(_) => {}
      },
    }
  };

  core.record_connected(socket.local_addr().ok());
  run_io(core, socket, rx, cancel).await;
}

/// Connected-phase loop: drain the framer into the socket, emit each received
/// datagram as one framed message, and close on idle.
async fn run_io(
  core: Rc<OutboundCore>,
  socket: UdpSocket,
  mut rx: mpsc::UnboundedReceiver<Event>,
  cancel: CancellationToken,
) {
  let idle_timeout = core.options().idle_timeout;
  let max_packet_size = core.options().max_packet_size.max(1);
  let mut framer = DatagramFramer::default();
  let mut idle = Timer::unarmed();
  if idle_timeout > Duration::ZERO {
    idle.schedule(idle_timeout);
  }
  let mut recv_buf = vec![0u8; max_packet_size];
  let mut rx_open = true;

  loop {
    core.set_buffered(framer.pending_bytes());

    tokio::select! {
      biased;

      _ = cancel.cancelled() => return, // close() already knows; emit nothing

      evt = rx.recv(), if rx_open => {
        match evt {
          Some(evt) => framer.push(evt),
          None => {
            rx_open = false;
            framer.push(Event::StreamEnd(ErrorKind::NoError));
          }
        }
        let mut sent = false;
        while let Some(datagram) = framer.pop_ready() {
          match socket.send(&datagram).await {
            Ok(n) => {
              core.add_traffic_write(n as u64);
              sent = true;
            }
            Err(e) => {
              warn!("{} error writing to peer: {e}", core.describe());
              core.terminate(ErrorKind::WriteError);
              return;
            }
          }
        }
        if sent && idle_timeout > Duration::ZERO {
          idle.schedule(idle_timeout);
        }
      }

      result = socket.recv(&mut recv_buf) => match result {
        Ok(n) => {
          // Oversized datagrams were truncated by the OS to the receive
          // buffer; `n` is what actually arrived in it.
          core.add_traffic_read(n as u64);
          core.emit(Event::MessageStart);
          if n > 0 {
            core.emit(Event::Data(Bytes::copy_from_slice(&recv_buf[..n])));
          }
          core.emit(Event::MessageEnd);
          if idle_timeout > Duration::ZERO {
            idle.schedule(idle_timeout);
          }
        }
        Err(e) => {
          let kind = ErrorKind::from_read_error(&e);
          match kind {
            ErrorKind::NoError => debug!("{} connection closed by peer", core.describe()),
            ErrorKind::ConnectionReset => warn!("{} connection reset by peer", core.describe()),
            _ => warn!("{} error reading from peer: {e}", core.describe()),
          }
          core.terminate(kind);
          return;
        }
      },

      _ = idle.expired() => {
        debug!("{} idle timeout", core.describe());
        core.terminate(ErrorKind::IdleTimeout);
        return;
      }
    }
  }
}

/* ---------------------------------------------------------- */
