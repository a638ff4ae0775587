//! Pipeline event alphabet consumed and produced by outbound connections.
//!
//! A reliable-stream connection treats the alphabet as a plain byte stream and
//! ignores message framing on egress; a datagram connection uses the framing
//! tokens to delimit datagrams.

use bytes::Bytes;
use std::{cell::RefCell, fmt, rc::Rc};
use tokio::sync::mpsc;

/* ---------------------------------------------------------- */
/// Terminal error kinds carried by [`Event::StreamEnd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Clean EOF / normal close
  NoError,
  /// DNS returned no result or a transient lookup error
  CannotResolve,
  /// The OS refused the connection or the peer is unreachable
  ConnectionRefused,
  /// The connect timeout elapsed while resolving or connecting
  ConnectionTimeout,
  /// Non-EOF, non-reset read failure
  ReadError,
  /// Write failure
  WriteError,
  /// Peer reset the connection
  ConnectionReset,
  /// The idle timeout elapsed with no traffic
  IdleTimeout,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::NoError => "NO_ERROR",
      Self::CannotResolve => "CANNOT_RESOLVE",
      Self::ConnectionRefused => "CONNECTION_REFUSED",
      Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
      Self::ReadError => "READ_ERROR",
      Self::WriteError => "WRITE_ERROR",
      Self::ConnectionReset => "CONNECTION_RESET",
      Self::IdleTimeout => "IDLE_TIMEOUT",
    }
  }

  /// Classify a failed socket read. EOF closes cleanly, a peer reset is
  /// reported as such, anything else is a read error.
  pub(crate) fn from_read_error(e: &std::io::Error) -> Self {
    match e.kind() {
      std::io::ErrorKind::UnexpectedEof => Self::NoError,
      std::io::ErrorKind::ConnectionReset => Self::ConnectionReset,
      _ => Self::ReadError,
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/* ---------------------------------------------------------- */
/// One event on the pipeline stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Opens a message
  MessageStart,
  /// Payload chunk
  Data(Bytes),
  /// Closes the currently open message
  MessageEnd,
  /// Terminal event; nothing follows on this stream
  StreamEnd(ErrorKind),
}

/// The upstream sink that receives events produced by a connection.
pub trait EventSink {
  fn feed(&self, evt: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
  fn feed(&self, evt: Event) {
    // The receiving side going away is not an error for the producer.
    let _ = self.send(evt);
  }
}

/// In-memory sink that records every event it receives.
/// Mainly useful for tests and for inspecting a connection's output.
#[derive(Clone, Default)]
pub struct EventBuffer {
  inner: Rc<RefCell<Vec<Event>>>,
}

impl EventBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of all recorded events.
  pub fn events(&self) -> Vec<Event> {
    self.inner.borrow().clone()
  }

  /// Drain the recorded events.
  pub fn take(&self) -> Vec<Event> {
    std::mem::take(&mut self.inner.borrow_mut())
  }

  pub fn len(&self) -> usize {
    self.inner.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.borrow().is_empty()
  }
}

impl EventSink for EventBuffer {
  fn feed(&self, evt: Event) {
    self.inner.borrow_mut().push(evt);
  }
}

/* ---------------------------------------------------------- */
