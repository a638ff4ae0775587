//! Reliable-stream (TCP) outbound connection.

use super::{resolve_target, ConnectionOptions, ConnectionState, OutboundCore, OutboundStatus, Protocol};
use crate::{
  error::OutboundError,
  event::{ErrorKind, Event, EventSink},
  pump::StreamPump,
  resolver::DnsResolver,
  socket::bind_tcp_socket,
  timer::Timer,
  trace::*,
};
use std::{
  cell::{Cell, RefCell},
  net::{IpAddr, SocketAddr},
  rc::Rc,
  time::Duration,
};
use tokio::{
  net::{TcpSocket, TcpStream},
  sync::mpsc,
  time::timeout,
};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Outbound TCP connection: resolve, connect, then stream bytes full duplex
/// until half/full close or error.
///
/// The connection is confined to the worker thread that created it and must
/// be driven from within that worker's local task set.
pub struct TcpConnection {
  core: Rc<OutboundCore>,
  tx: mpsc::UnboundedSender<Event>,
  rx: RefCell<Option<mpsc::UnboundedReceiver<Event>>>,
  cancel: CancellationToken,
  socket: RefCell<Option<TcpSocket>>,
  bound_local: Cell<Option<SocketAddr>>,
  started: Cell<bool>,
}

impl TcpConnection {
  /// Create a connection feeding its output into `input`.
  /// The connection is registered with the worker's registry until dropped.
  pub fn new(input: impl EventSink + 'static, options: ConnectionOptions) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      core: OutboundCore::new(Protocol::Tcp, Box::new(input), options),
      tx,
      rx: RefCell::new(Some(rx)),
      cancel: CancellationToken::new(),
      socket: RefCell::new(None),
      bound_local: Cell::new(None),
      started: Cell::new(false),
    }
  }

  /// Bind the local endpoint. Optional; must precede [`TcpConnection::connect`].
  pub fn bind(&self, ip: &str, port: u16) -> Result<(), OutboundError> {
    if self.started.get() {
      return Err(OutboundError::AlreadyStarted);
    }
    let ip: IpAddr = ip.parse().map_err(|_| OutboundError::InvalidBindAddress {
      address: ip.to_string(),
    })?;
    let addr = SocketAddr::new(ip, port);
    let socket = bind_tcp_socket(&addr).map_err(|e| OutboundError::Bind {
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

  /// Begin the lifecycle towards `host:port`. Non-blocking; the connection is
  /// single-use, a second call is ignored. Metric label handles are created
  /// here, once the logical address is known.
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

  /// Feed one upstream event. Payload is forwarded to the socket write side;
  /// message framing is ignored on a byte stream. Events sent before the
  /// connection is established are queued.
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
/// One resolve-and-connect attempt. The connect timer spanning both phases is
/// applied by the caller.
async fn attempt_once(
  core: &Rc<OutboundCore>,
  resolver: &Option<Rc<dyn DnsResolver>>,
  socket: Option<TcpSocket>,
  bound_local: Option<SocketAddr>,
) -> Result<TcpStream, ErrorKind> {
  core.begin_attempt();
  let target = resolve_target(core, resolver).await?;

  core.set_state(ConnectionState::Connecting);
  debug!("{} connecting...", core.describe());

  let result = match socket {
    Some(socket) => socket.connect(target).await,
    None => match bound_local {
      // A retried attempt re-binds the local endpoint chosen by bind().
      Some(addr) => {
        let socket = bind_tcp_socket(&addr).map_err(|e| {
          error!("{} cannot rebind local endpoint {addr}: {e}", core.describe());
          ErrorKind::ConnectionRefused
        })?;
        socket.connect(target).await
      }
      None => TcpStream::connect(target).await,
    },
  };

  result.map_err(|e| {
    error!("{} cannot connect: {e}", core.describe());
    ErrorKind::ConnectionRefused
  })
}

/// Drive the whole lifecycle: retry loop around resolve/connect, then hand
/// the established stream to the byte pump. The task holds its own reference
/// to the connection, so destruction waits for it to finish.
async fn run_driver(
  core: Rc<OutboundCore>,
  rx: mpsc::UnboundedReceiver<Event>,
  cancel: CancellationToken,
  mut first_socket: Option<TcpSocket>,
  bound_local: Option<SocketAddr>,
) {
  let resolver = core.options().resolver.clone();
  let connect_timeout = core.options().connect_timeout;

  let stream = loop {
    let attempt = attempt_once(&core, &resolver, first_socket.take(), bound_local);
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
      Ok(stream) => break stream,
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

  core.record_connected(stream.local_addr().ok());
  StreamPump::new(core, rx, cancel).run(stream).await;
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::{ConnectionOptionsBuilder, StateCallback};
  use crate::event::EventBuffer;
  use crate::registry::connection_count;
  use crate::resolver::MockDnsResolver;
  use crate::stats::encode_prometheus;
  use crate::worker::Worker;
  use async_trait::async_trait;
  use bytes::Bytes;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("condition not reached in time");
  }

  fn state_collector() -> (Rc<RefCell<Vec<ConnectionState>>>, StateCallback) {
    let states: Rc<RefCell<Vec<ConnectionState>>> = Rc::new(RefCell::new(Vec::new()));
    let states_clone = states.clone();
    let callback: StateCallback = Rc::new(move |s: &OutboundStatus| states_clone.borrow_mut().push(s.state));
    (states, callback)
  }

  /// Resolver whose lookups never complete; exercises the connect timeout.
  struct HangingResolver;

  #[async_trait(?Send)]
  impl DnsResolver for HangingResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>, crate::error::ResolveError> {
      std::future::pending().await
    }
  }

  #[test]
  fn happy_path_streams_and_closes_cleanly() {
    let worker = Worker::new("tcp-happy").unwrap();
    worker.block_on(async {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      let port = listener.local_addr().unwrap().port();
      tokio::task::spawn_local(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
      });

      let events = EventBuffer::new();
      let (states, callback) = state_collector();
      let options = ConnectionOptionsBuilder::default()
        .connect_timeout(Duration::from_secs(1))
        .on_state_changed(Some(callback))
        .build()
        .unwrap();
      let conn = TcpConnection::new(events.clone(), options);
      conn.connect("localhost", port);
      conn.send(Event::Data(Bytes::from_static(b"ping")));

      wait_until(|| {
        events
          .events()
          .iter()
          .any(|e| matches!(e, Event::StreamEnd(_)))
      })
      .await;

      let evts = events.events();
      let payload: Vec<u8> = evts
        .iter()
        .filter_map(|e| match e {
          Event::Data(d) => Some(d.to_vec()),
          _ => None,
        })
        .flatten()
        .collect();
      assert_eq!(payload, b"ping");
      assert_eq!(evts.last(), Some(&Event::StreamEnd(ErrorKind::NoError)));

      assert_eq!(
        *states.borrow(),
        vec![
          ConnectionState::Resolving,
          ConnectionState::Connecting,
          ConnectionState::Connected,
          ConnectionState::Closed,
        ]
      );

      let status = conn.status();
      assert_eq!(status.state, ConnectionState::Closed);
      // localhost is rewritten to the loopback literal before resolution.
      assert_eq!(status.remote_address().as_deref(), Some("127.0.0.1"));
      assert_eq!(status.remote_port(), Some(port));
      assert!(status.local_port().is_some());
      assert_eq!(status.retries, 0);

      // Exactly one connect-time observation for this peer.
      let scrape = encode_prometheus();
      let needle = format!(
        "pipy_outbound_conn_time_count{{protocol=\"TCP\",peer=\"[localhost]:{port}\"}} 1"
      );
      assert!(scrape.contains(&needle), "missing {needle} in scrape:\n{scrape}");
    });
  }

  #[test]
  fn refused_with_two_retries() {
    let worker = Worker::new("tcp-refused").unwrap();
    worker.block_on(async {
      // Grab a loopback port with no listener behind it.
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      let port = listener.local_addr().unwrap().port();
      drop(listener);

      let events = EventBuffer::new();
      let (states, callback) = state_collector();
      let options = ConnectionOptionsBuilder::default()
        .retry_count(2)
        .retry_delay(Duration::from_millis(50))
        .on_state_changed(Some(callback))
        .build()
        .unwrap();
      let conn = TcpConnection::new(events.clone(), options);
      conn.connect("127.0.0.1", port);

      wait_until(|| !events.is_empty()).await;

      assert_eq!(
        events.events(),
        vec![Event::StreamEnd(ErrorKind::ConnectionRefused)]
      );
      assert_eq!(
        *states.borrow(),
        vec![
          ConnectionState::Resolving,
          ConnectionState::Connecting,
          ConnectionState::Idle,
          ConnectionState::Resolving,
          ConnectionState::Connecting,
          ConnectionState::Idle,
          ConnectionState::Resolving,
          ConnectionState::Connecting,
          ConnectionState::Closed,
        ]
      );
      assert_eq!(conn.status().retries, 2);
      assert_eq!(conn.state(), ConnectionState::Closed);
    });
  }

  #[test]
  fn dns_failure_terminates_without_retry() {
    let worker = Worker::new("tcp-dns").unwrap();
    worker.block_on(async {
      let events = EventBuffer::new();
      let resolver: Rc<dyn DnsResolver> = Rc::new(MockDnsResolver::new());
      let options = ConnectionOptionsBuilder::default()
        .resolver(Some(resolver))
        .build()
        .unwrap();
      let conn = TcpConnection::new(events.clone(), options);
      conn.connect("nx.invalid", 80);

      wait_until(|| !events.is_empty()).await;

      assert_eq!(events.events(), vec![Event::StreamEnd(ErrorKind::CannotResolve)]);
      assert_eq!(conn.state(), ConnectionState::Closed);
      assert_eq!(conn.status().error, Some(ErrorKind::CannotResolve));
    });
  }

  #[test]
  fn connect_timeout_fires_while_resolving() {
    let worker = Worker::new("tcp-timeout").unwrap();
    worker.block_on(async {
      let events = EventBuffer::new();
      let resolver: Rc<dyn DnsResolver> = Rc::new(HangingResolver);
      let options = ConnectionOptionsBuilder::default()
        .connect_timeout(Duration::from_millis(100))
        .resolver(Some(resolver))
        .build()
        .unwrap();
      let conn = TcpConnection::new(events.clone(), options);
      let started = std::time::Instant::now();
      conn.connect("blackhole.test", 80);

      wait_until(|| !events.is_empty()).await;

      assert!(started.elapsed() >= Duration::from_millis(100));
      assert_eq!(
        events.events(),
        vec![Event::StreamEnd(ErrorKind::ConnectionTimeout)]
      );
      assert_eq!(conn.state(), ConnectionState::Closed);
    });
  }

  #[test]
  fn close_is_idempotent_and_silent() {
    let worker = Worker::new("tcp-close").unwrap();
    worker.block_on(async {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      let port = listener.local_addr().unwrap().port();
      tokio::task::spawn_local(async move {
        // Accept and hold the connection open.
        let _held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
      });

      let events = EventBuffer::new();
      let conn = TcpConnection::new(events.clone(), ConnectionOptions::default());
      conn.connect("127.0.0.1", port);
      wait_until(|| conn.state() == ConnectionState::Connected).await;

      conn.close();
      conn.close();
      assert_eq!(conn.state(), ConnectionState::Closed);

      tokio::time::sleep(Duration::from_millis(50)).await;
      assert!(events.is_empty()); // cancellation produces no event
    });
  }

  #[test]
  fn bind_precedes_connect_and_sticks() {
    let worker = Worker::new("tcp-bind").unwrap();
    worker.block_on(async {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      let port = listener.local_addr().unwrap().port();
      tokio::task::spawn_local(async move {
        let _held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
      });

      let events = EventBuffer::new();
      let conn = TcpConnection::new(events.clone(), ConnectionOptions::default());
      conn.bind("127.0.0.1", 0).unwrap();
      let bound_port = conn.status().local_port().unwrap();
      assert_ne!(bound_port, 0);

      conn.connect("127.0.0.1", port);
      wait_until(|| conn.state() == ConnectionState::Connected).await;
      assert_eq!(conn.status().local_port(), Some(bound_port));

      // bind() after the lifecycle started is rejected.
      assert!(matches!(
        conn.bind("127.0.0.1", 0),
        Err(OutboundError::AlreadyStarted)
      ));
      conn.close();
    });
  }

  #[test]
  fn registry_reflects_connection_lifetime() {
    let worker = Worker::new("tcp-registry").unwrap();
    worker.block_on(async {
      let before = connection_count();
      let events = EventBuffer::new();
      let resolver: Rc<dyn DnsResolver> = Rc::new(MockDnsResolver::new());
      let options = ConnectionOptionsBuilder::default()
        .resolver(Some(resolver))
        .build()
        .unwrap();
      let conn = TcpConnection::new(events.clone(), options);
      assert_eq!(connection_count(), before + 1);

      conn.connect("nx.invalid", 80);
      wait_until(|| !events.is_empty()).await;
      // Still registered while the handle is alive.
      assert_eq!(connection_count(), before + 1);

      drop(conn);
      wait_until(|| connection_count() == before).await;
    });
  }
}
