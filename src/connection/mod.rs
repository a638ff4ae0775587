//! Outbound connection lifecycle shared by both transports.
//!
//! A connection is confined to the worker thread that created it: its state
//! lives in plain cells, the driving task is spawned on the worker's local
//! task set, and shared ownership is reference-counted with `Rc` — every
//! outstanding async operation holds one clone, so the connection is only
//! destroyed (and deregistered) once all of them have completed or been
//! cancelled.

use crate::{
  constants::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_UDP_IDLE_TIMEOUT, LOCALHOST, LOCALHOST_IP},
  error::OutboundError,
  event::{ErrorKind, Event, EventSink},
  registry,
  resolver::{shared_system_resolver, DnsResolver},
  stats::{self, CounterHandle, HistogramSeries, OutboundMetrics},
  trace::*,
};
use std::{
  cell::{Cell, RefCell},
  fmt,
  net::{IpAddr, SocketAddr},
  rc::Rc,
  time::{Duration, Instant},
};
use uuid::Uuid;

mod tcp;
mod udp;

pub use tcp::TcpConnection;
pub use udp::UdpConnection;

/* ---------------------------------------------------------- */
/// Transport protocol of an outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  Tcp,
  Udp,
}

impl Protocol {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Tcp => "TCP",
      Self::Udp => "UDP",
    }
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/* ---------------------------------------------------------- */
/// Connection lifecycle states.
///
/// Transitions are monotonic except that a transient failure resets the
/// connection to `Idle` while a retry is pending. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Idle,
  Resolving,
  Connecting,
  Connected,
  Closed,
}

impl ConnectionState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Idle => "idle",
      Self::Resolving => "resolving",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
      Self::Closed => "closed",
    }
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/* ---------------------------------------------------------- */
/// Callback invoked on every state transition, from the worker thread that
/// drives the connection. Must not block and must not re-enter `close()` on
/// the same connection without external guards.
pub type StateCallback = Rc<dyn Fn(&OutboundStatus)>;

/// Connection options.
#[derive(Clone, derive_builder::Builder)]
pub struct ConnectionOptions {
  /// Transport selected by the [`OutboundConnection`] factory.
  #[builder(default = "Protocol::Tcp")]
  pub protocol: Protocol,
  /// Covers the whole resolve-and-connect phase of one attempt; zero disables.
  #[builder(default = "Duration::ZERO")]
  pub connect_timeout: Duration,
  /// `-1` retries forever, `0` disables retry.
  #[builder(default = "0")]
  pub retry_count: i32,
  /// Delay between a failed attempt and the next one.
  #[builder(default = "Duration::ZERO")]
  pub retry_delay: Duration,
  /// Closes a datagram connection after this long without traffic; zero disables.
  #[builder(default = "DEFAULT_UDP_IDLE_TIMEOUT")]
  pub idle_timeout: Duration,
  /// Receive buffer size for one datagram; larger datagrams are truncated.
  #[builder(default = "DEFAULT_MAX_PACKET_SIZE")]
  pub max_packet_size: usize,
  /// Observer for state transitions.
  #[builder(default)]
  pub on_state_changed: Option<StateCallback>,
  /// Resolver override; defaults to the worker's shared system resolver.
  #[builder(default)]
  pub resolver: Option<Rc<dyn DnsResolver>>,
}

impl Default for ConnectionOptions {
  fn default() -> Self {
    Self {
      protocol: Protocol::Tcp,
      connect_timeout: Duration::ZERO,
      retry_count: 0,
      retry_delay: Duration::ZERO,
      idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
      max_packet_size: DEFAULT_MAX_PACKET_SIZE,
      on_state_changed: None,
      resolver: None,
    }
  }
}

impl fmt::Debug for ConnectionOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionOptions")
      .field("protocol", &self.protocol)
      .field("connect_timeout", &self.connect_timeout)
      .field("retry_count", &self.retry_count)
      .field("retry_delay", &self.retry_delay)
      .field("idle_timeout", &self.idle_timeout)
      .field("max_packet_size", &self.max_packet_size)
      .field("on_state_changed", &self.on_state_changed.is_some())
      .field("resolver", &self.resolver.is_some())
      .finish()
  }
}

/* ---------------------------------------------------------- */
/// Snapshot of a connection's observable surface.
#[derive(Clone)]
pub struct OutboundStatus {
  pub id: Uuid,
  pub protocol: Protocol,
  pub state: ConnectionState,
  pub host: String,
  pub port: u16,
  pub local_addr: Option<SocketAddr>,
  pub remote_addr: Option<SocketAddr>,
  pub retries: u32,
  pub error: Option<ErrorKind>,
  pub connection_time_ms: f64,
  pub buffered: usize,
}

impl OutboundStatus {
  pub fn protocol_name(&self) -> &'static str {
    self.protocol.name()
  }

  /// Canonical `"[host]:port"` label used for metrics.
  pub fn address(&self) -> String {
    format!("[{}]:{}", self.host, self.port)
  }

  pub fn local_address(&self) -> Option<String> {
    self.local_addr.map(|a| a.ip().to_string())
  }

  pub fn local_port(&self) -> Option<u16> {
    self.local_addr.map(|a| a.port())
  }

  pub fn remote_address(&self) -> Option<String> {
    self.remote_addr.map(|a| a.ip().to_string())
  }

  pub fn remote_port(&self) -> Option<u16> {
    self.remote_addr.map(|a| a.port())
  }
}

impl fmt::Debug for OutboundStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutboundStatus")
      .field("protocol", &self.protocol)
      .field("state", &self.state)
      .field("address", &self.address())
      .field("local_addr", &self.local_addr)
      .field("remote_addr", &self.remote_addr)
      .field("retries", &self.retries)
      .field("error", &self.error)
      .finish()
  }
}

/* ---------------------------------------------------------- */
/// Metric handles keyed by this connection's `(protocol, "[host]:port")` labels.
pub(crate) struct MetricHandles {
  pub(crate) traffic_in: CounterHandle,
  pub(crate) traffic_out: CounterHandle,
  pub(crate) conn_time: Rc<HistogramSeries>,
}

/// Shared lifecycle state of one outbound connection.
pub(crate) struct OutboundCore {
  id: Uuid,
  protocol: Protocol,
  options: ConnectionOptions,
  input: Box<dyn EventSink>,
  metrics: Rc<OutboundMetrics>,
  state: Cell<ConnectionState>,
  host: RefCell<String>,
  port: Cell<u16>,
  local_addr: Cell<Option<SocketAddr>>,
  remote_addr: Cell<Option<SocketAddr>>,
  retries: Cell<u32>,
  start_time: Cell<Option<Instant>>,
  error: Cell<Option<ErrorKind>>,
  traffic_read: Cell<u64>,
  traffic_write: Cell<u64>,
  buffered: Cell<usize>,
  connection_time_ms: Cell<f64>,
  labels: RefCell<Option<MetricHandles>>,
  registry_slot: Cell<Option<usize>>,
}

impl OutboundCore {
  pub(crate) fn new(protocol: Protocol, input: Box<dyn EventSink>, options: ConnectionOptions) -> Rc<Self> {
    let core = Rc::new(Self {
      id: Uuid::new_v4(),
      protocol,
      options,
      input,
      metrics: stats::outbound_metrics(),
      state: Cell::new(ConnectionState::Idle),
      host: RefCell::new(String::new()),
      port: Cell::new(0),
      local_addr: Cell::new(None),
      remote_addr: Cell::new(None),
      retries: Cell::new(0),
      start_time: Cell::new(None),
      error: Cell::new(None),
      traffic_read: Cell::new(0),
      traffic_write: Cell::new(0),
      buffered: Cell::new(0),
      connection_time_ms: Cell::new(0.0),
      labels: RefCell::new(None),
      registry_slot: Cell::new(None),
    });
    let slot = registry::register(&core);
    core.registry_slot.set(Some(slot));
    debug!("[outbound {}] ++", core.id.as_simple());
    core
  }

  pub(crate) fn options(&self) -> &ConnectionOptions {
    &self.options
  }

  pub(crate) fn state(&self) -> ConnectionState {
    self.state.get()
  }

  /// Transition the state machine. `Closed` is terminal and same-state calls
  /// are ignored, so the state-change callback fires exactly once per
  /// transition.
  pub(crate) fn set_state(&self, next: ConnectionState) {
    let prev = self.state.get();
    if prev == next || prev == ConnectionState::Closed {
      return;
    }
    self.state.set(next);
    if let Some(callback) = self.options.on_state_changed.as_ref() {
      callback(&self.status());
    }
  }

  /// Record the logical destination and create the metric label handles.
  /// Called before the lifecycle starts so the label string is stable.
  pub(crate) fn set_destination(&self, host: &str, port: u16) {
    *self.host.borrow_mut() = host.to_string();
    self.port.set(port);

    let address = self.address();
    let labels = [self.protocol_name(), address.as_str()];
    *self.labels.borrow_mut() = Some(MetricHandles {
      traffic_in: self.metrics.traffic_in.with_labels(&labels),
      traffic_out: self.metrics.traffic_out.with_labels(&labels),
      conn_time: self.metrics.conn_time.with_labels(&labels),
    });
  }

  pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
    self.local_addr.set(Some(addr));
  }

  pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
    self.remote_addr.set(Some(addr));
  }

  pub(crate) fn host(&self) -> String {
    self.host.borrow().clone()
  }

  pub(crate) fn port(&self) -> u16 {
    self.port.get()
  }

  pub(crate) fn protocol_name(&self) -> &'static str {
    self.protocol.name()
  }

  /// Canonical `"[host]:port"` metric label.
  pub(crate) fn address(&self) -> String {
    format!("[{}]:{}", self.host.borrow(), self.port.get())
  }

  /// Compact identity used in log lines.
  pub(crate) fn describe(&self) -> String {
    let (local_ip, local_port) = match self.local_addr.get() {
      Some(a) => (a.ip().to_string(), a.port()),
      None => ("0.0.0.0".to_string(), 0),
    };
    let remote_ip = match self.remote_addr.get() {
      Some(a) => a.ip().to_string(),
      None => String::new(),
    };
    format!(
      "[outbound {}] [{}]:{} -> [{}]:{} ({})",
      self.id.as_simple(),
      local_ip,
      local_port,
      remote_ip,
      self.port.get(),
      self.host.borrow()
    )
  }

  /// Feed one event to the upstream sink. Nothing is emitted once closed.
  pub(crate) fn emit(&self, evt: Event) {
    if self.state.get() == ConnectionState::Closed {
      return;
    }
    self.input.feed(evt);
  }

  /// Terminal error path: record the error once, emit the stream end and
  /// close. No-op if the connection already terminated.
  pub(crate) fn terminate(&self, kind: ErrorKind) {
    if self.state.get() == ConnectionState::Closed || self.error.get().is_some() {
      return;
    }
    self.error.set(Some(kind));
    self.emit(Event::StreamEnd(kind));
    self.set_state(ConnectionState::Closed);
  }

  /// Decide what to do about a failed attempt: either consume a retry
  /// (resetting to `Idle` and returning the delay before the next attempt) or
  /// surface the error and terminate.
  pub(crate) fn retry_or_terminate(&self, kind: ErrorKind) -> Option<Duration> {
    let max = self.options.retry_count;
    if max >= 0 && self.retries.get() >= max as u32 {
      self.terminate(kind);
      return None;
    }
    self.retries.set(self.retries.get() + 1);
    self.set_state(ConnectionState::Idle);
    Some(self.options.retry_delay)
  }

  /// Mark the start of one resolve-and-connect attempt.
  pub(crate) fn begin_attempt(&self) {
    self.start_time.set(Some(Instant::now()));
    let retries = self.retries.get();
    if retries > 0 {
      warn!("{} retry connecting... (retries = {})", self.describe(), retries);
    }
    self.set_state(ConnectionState::Resolving);
    debug!("{} resolving hostname...", self.describe());
  }

  /// Record a successful connect: local endpoint, connect latency into the
  /// per-connection and worker-wide histograms, then enter `Connected`.
  pub(crate) fn record_connected(&self, local: Option<SocketAddr>) {
    if let Some(addr) = local {
      self.local_addr.set(Some(addr));
    }
    let conn_time = self
      .start_time
      .get()
      .map(|t| t.elapsed().as_secs_f64() * 1000.0)
      .unwrap_or(0.0);
    self.connection_time_ms.set(self.connection_time_ms.get() + conn_time);
    if let Some(handles) = self.labels.borrow().as_ref() {
      handles.conn_time.observe(conn_time);
    }
    self.metrics.conn_time.observe(conn_time);
    debug!("{} connected in {:.3} ms", self.describe(), conn_time);
    self.set_state(ConnectionState::Connected);
  }

  pub(crate) fn add_traffic_read(&self, n: u64) {
    self.traffic_read.set(self.traffic_read.get() + n);
  }

  pub(crate) fn add_traffic_write(&self, n: u64) {
    self.traffic_write.set(self.traffic_write.get() + n);
  }

  /// Read-and-reset the inbound byte counter; drained by the metric scrape.
  pub(crate) fn take_traffic_in(&self) -> u64 {
    self.traffic_read.replace(0)
  }

  /// Read-and-reset the outbound byte counter; drained by the metric scrape.
  pub(crate) fn take_traffic_out(&self) -> u64 {
    self.traffic_write.replace(0)
  }

  pub(crate) fn set_buffered(&self, n: usize) {
    self.buffered.set(n);
  }

  pub(crate) fn traffic_in_handle(&self) -> Option<CounterHandle> {
    self.labels.borrow().as_ref().map(|h| h.traffic_in.clone())
  }

  pub(crate) fn traffic_out_handle(&self) -> Option<CounterHandle> {
    self.labels.borrow().as_ref().map(|h| h.traffic_out.clone())
  }

  pub(crate) fn status(&self) -> OutboundStatus {
    OutboundStatus {
      id: self.id,
      protocol: self.protocol,
      state: self.state.get(),
      host: self.host.borrow().clone(),
      port: self.port.get(),
      local_addr: self.local_addr.get(),
      remote_addr: self.remote_addr.get(),
      retries: self.retries.get(),
      error: self.error.get(),
      connection_time_ms: self.connection_time_ms.get(),
      buffered: self.buffered.get(),
    }
  }
}

impl Drop for OutboundCore {
  fn drop(&mut self) {
    if let Some(slot) = self.registry_slot.get() {
      registry::deregister(slot);
    }
    debug!("[outbound {}] --", self.id.as_simple());
  }
}

/* ---------------------------------------------------------- */
/// Resolve the configured destination to the endpoint of this attempt.
///
/// `localhost` is rewritten to the loopback literal before resolution so the
/// outcome does not depend on the host database; an IP literal resolves
/// without a lookup. Only the first resolved endpoint is used — a retry
/// repeats the whole resolve-and-connect cycle.
pub(crate) async fn resolve_target(
  core: &Rc<OutboundCore>,
  resolver: &Option<Rc<dyn DnsResolver>>,
) -> Result<SocketAddr, ErrorKind> {
  let mut host = core.host();
  if host == LOCALHOST {
    host = LOCALHOST_IP.to_string();
  }
  let port = core.port();

  if let Ok(ip) = host.parse::<IpAddr>() {
    let target = SocketAddr::new(ip, port);
    core.set_remote_addr(target);
    return Ok(target);
  }

  let resolver = match resolver {
    Some(r) => r.clone(),
    None => match shared_system_resolver() {
      Ok(r) => r,
      Err(e) => {
        error!("{} cannot resolve hostname: {e}", core.describe());
        return Err(ErrorKind::CannotResolve);
      }
    },
  };

  match resolver.resolve(&host, port).await {
    Ok(addresses) => match addresses.first() {
      Some(target) => {
        core.set_remote_addr(*target);
        Ok(*target)
      }
      None => {
        error!("{} cannot resolve hostname: empty result", core.describe());
        Err(ErrorKind::CannotResolve)
      }
    },
    Err(e) => {
      error!("{} cannot resolve hostname: {e}", core.describe());
      Err(ErrorKind::CannotResolve)
    }
  }
}

/* ---------------------------------------------------------- */
/// Factory over the two transports, dispatching on `options.protocol`.
pub enum OutboundConnection {
  Tcp(TcpConnection),
  Udp(UdpConnection),
}

impl OutboundConnection {
  pub fn new(input: impl EventSink + 'static, options: ConnectionOptions) -> Self {
    match options.protocol {
      Protocol::Tcp => Self::Tcp(TcpConnection::new(input, options)),
      Protocol::Udp => Self::Udp(UdpConnection::new(input, options)),
    }
  }

  /// Bind the local endpoint before connecting.
  pub fn bind(&self, ip: &str, port: u16) -> Result<(), OutboundError> {
    match self {
      Self::Tcp(c) => c.bind(ip, port),
      Self::Udp(c) => c.bind(ip, port),
    }
  }

  /// Begin the lifecycle towards `host:port`. Non-blocking.
  pub fn connect(&self, host: &str, port: u16) {
    match self {
      Self::Tcp(c) => c.connect(host, port),
      Self::Udp(c) => c.connect(host, port),
    }
  }

  /// Feed one upstream event into the connection.
  pub fn send(&self, evt: Event) {
    match self {
      Self::Tcp(c) => c.send(evt),
      Self::Udp(c) => c.send(evt),
    }
  }

  /// Request a graceful shutdown. Idempotent; emits no event.
  pub fn close(&self) {
    match self {
      Self::Tcp(c) => c.close(),
      Self::Udp(c) => c.close(),
    }
  }

  pub fn state(&self) -> ConnectionState {
    match self {
      Self::Tcp(c) => c.state(),
      Self::Udp(c) => c.state(),
    }
  }

  pub fn status(&self) -> OutboundStatus {
    match self {
      Self::Tcp(c) => c.status(),
      Self::Udp(c) => c.status(),
    }
  }

  pub fn protocol_name(&self) -> &'static str {
    match self {
      Self::Tcp(_) => Protocol::Tcp.name(),
      Self::Udp(_) => Protocol::Udp.name(),
    }
  }

  /// Canonical `"[host]:port"` metric label.
  pub fn address(&self) -> String {
    match self {
      Self::Tcp(c) => c.address(),
      Self::Udp(c) => c.address(),
    }
  }
}

/* ---------------------------------------------------------- */
