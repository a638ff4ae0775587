//! Outbound connection subsystem for a programmable layer-4 proxy pipeline.
//!
//! Given a symbolic destination (host, port, transport) and an event stream
//! from an upstream pipeline, a connection resolves the destination,
//! establishes a transport-layer connection, forwards bytes or datagrams in
//! both directions and surfaces lifecycle and error information back into the
//! pipeline as events. Two transports are supported behind one contract: a
//! reliable byte stream (TCP) and an unreliable datagram transport (UDP).
//!
//! Everything is per-worker: a [`Worker`] owns a current-thread runtime, and
//! connections, the registry and the metric objects are confined to the
//! thread that created them.
//!
//! ```no_run
//! use outbound_l4::{ConnectionOptionsBuilder, Event, EventBuffer, OutboundConnection, Worker};
//!
//! let worker = Worker::new("worker-0").unwrap();
//! worker.block_on(async {
//!   let events = EventBuffer::new();
//!   let options = ConnectionOptionsBuilder::default()
//!     .connect_timeout(std::time::Duration::from_secs(5))
//!     .retry_count(2)
//!     .build()
//!     .unwrap();
//!   let conn = OutboundConnection::new(events.clone(), options);
//!   conn.connect("example.com", 80);
//!   conn.send(Event::Data("GET / HTTP/1.0\r\n\r\n".into()));
//!   // ... poll `events` for data and the terminal StreamEnd ...
//! });
//! ```

mod connection;
mod constants;
mod error;
mod event;
mod pump;
mod registry;
mod resolver;
mod socket;
mod stats;
mod timer;
mod trace;
mod worker;

pub use connection::{
  ConnectionOptions, ConnectionOptionsBuilder, ConnectionOptionsBuilderError, ConnectionState, OutboundConnection,
  OutboundStatus, Protocol, StateCallback, TcpConnection, UdpConnection,
};
pub use constants::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_UDP_IDLE_TIMEOUT};
pub use error::{OutboundError, ResolveError};
pub use event::{ErrorKind, Event, EventBuffer, EventSink};
pub use registry::connection_count;
pub use resolver::{DnsResolver, MockDnsResolver, SystemResolver};
pub use stats::{encode_prometheus, Counter, CounterHandle, Gauge, GaugeHandle, Histogram, HistogramSeries};
pub use timer::Timer;
pub use worker::Worker;
