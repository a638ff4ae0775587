//! Full-duplex byte pump between an event stream and a reliable-stream socket.
//!
//! Egress coalesces payload chunks into a single write buffer with one
//! outstanding write at a time; the event channel queues behind it. Ingress
//! reads into a bounded chunk and emits each completed read as a data event.
//! The pump is generic over the socket so a wrapped stream (e.g. TLS) can
//! reuse it unchanged.

use crate::{
  connection::OutboundCore,
  constants::STREAM_READ_BUFFER_SIZE,
  event::{ErrorKind, Event},
  trace::*,
};
use bytes::{Bytes, BytesMut};
use std::rc::Rc;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  sync::mpsc,
};
use tokio_util::sync::CancellationToken;

pub(crate) struct StreamPump {
  core: Rc<OutboundCore>,
  rx: mpsc::UnboundedReceiver<Event>,
  cancel: CancellationToken,
}

impl StreamPump {
  pub(crate) fn new(core: Rc<OutboundCore>, rx: mpsc::UnboundedReceiver<Event>, cancel: CancellationToken) -> Self {
    Self { core, rx, cancel }
  }

  /// Copy in both directions until half/full close, an error, or cancellation.
  ///
  /// An upstream `StreamEnd` flushes pending output and shuts down the write
  /// side; reading continues until the peer closes. Cancellation flushes and
  /// returns without emitting any event.
  pub(crate) async fn run<S>(self, stream: S)
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let Self { core, mut rx, cancel } = self;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_chunk = vec![0u8; STREAM_READ_BUFFER_SIZE];
    let mut write_buf = BytesMut::new();
    let mut rx_open = true;
    let mut ended = false;
    let mut shut = false;

    loop {
      core.set_buffered(write_buf.len());

      if ended && write_buf.is_empty() && !shut {
        let _ = writer.shutdown().await;
        shut = true;
      }

      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          if !write_buf.is_empty() {
            let _ = writer.write_all_buf(&mut write_buf).await;
          }
          let _ = writer.shutdown().await;
          core.set_buffered(0);
          return;
        }

        evt = rx.recv(), if rx_open => match evt {
          Some(Event::Data(data)) => {
            if !ended {
              write_buf.extend_from_slice(&data);
            }
          }
          Some(Event::StreamEnd(_)) => ended = true,
          Some(_) => {} // message framing is meaningless on a byte stream
          None => {
            rx_open = false;
            ended = true;
          }
        },

        result = writer.write_buf(&mut write_buf), if !write_buf.is_empty() => match result {
          Ok(n) => core.add_traffic_write(n as u64),
          Err(e) => {
            warn!("{} error writing to peer: {e}", core.describe());
            core.terminate(ErrorKind::WriteError);
            return;
          }
        },

        result = reader.read(&mut read_chunk) => match result {
          Ok(0) => {
            debug!("{} connection closed by peer", core.describe());
            if !write_buf.is_empty() {
              let _ = writer.write_all_buf(&mut write_buf).await;
            }
            core.terminate(ErrorKind::NoError);
            return;
          }
          Ok(n) => {
            core.add_traffic_read(n as u64);
            core.emit(Event::Data(Bytes::copy_from_slice(&read_chunk[..n])));
          }
          Err(e) => {
            let kind = ErrorKind::from_read_error(&e);
            match kind {
              ErrorKind::ConnectionReset => warn!("{} connection reset by peer", core.describe()),
              _ => warn!("{} error reading from peer: {e}", core.describe()),
            }
            core.terminate(kind);
            return;
          }
        },
      }
    }
  }
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::{ConnectionOptions, Protocol};
  use crate::event::EventBuffer;

  fn make_pump(events: &EventBuffer) -> (Rc<OutboundCore>, mpsc::UnboundedSender<Event>, StreamPump) {
    let core = OutboundCore::new(Protocol::Tcp, Box::new(events.clone()), ConnectionOptions::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let pump = StreamPump::new(core.clone(), rx, cancel);
    (core, tx, pump)
  }

  #[tokio::test]
  async fn copies_both_directions_until_peer_close() {
    let events = EventBuffer::new();
    let (core, tx, pump) = make_pump(&events);
    let (client, mut server) = tokio::io::duplex(1024);

    tx.send(Event::Data(Bytes::from_static(b"ping"))).unwrap();

    let script = async move {
      let mut buf = [0u8; 4];
      server.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"ping");
      server.write_all(b"pong").await.unwrap();
      // Dropping the server half closes the stream.
    };
    tokio::join!(pump.run(client), script);

    let evts = events.events();
    assert!(evts.contains(&Event::Data(Bytes::from_static(b"pong"))));
    assert_eq!(evts.last(), Some(&Event::StreamEnd(ErrorKind::NoError)));
    assert_eq!(core.take_traffic_out(), 4);
    assert_eq!(core.take_traffic_in(), 4);
  }

  #[tokio::test]
  async fn stream_end_performs_half_close() {
    let events = EventBuffer::new();
    let (_core, tx, pump) = make_pump(&events);
    let (client, mut server) = tokio::io::duplex(1024);

    tx.send(Event::Data(Bytes::from_static(b"bye"))).unwrap();
    tx.send(Event::StreamEnd(ErrorKind::NoError)).unwrap();

    let script = async move {
      let mut collected = Vec::new();
      server.read_to_end(&mut collected).await.unwrap(); // sees EOF after the flush
      assert_eq!(collected, b"bye");
      server.write_all(b"late").await.unwrap();
      drop(server);
    };
    tokio::join!(pump.run(client), script);

    // Reading continued after the half close.
    let evts = events.events();
    assert!(evts.contains(&Event::Data(Bytes::from_static(b"late"))));
    assert_eq!(evts.last(), Some(&Event::StreamEnd(ErrorKind::NoError)));
  }

  #[tokio::test]
  async fn cancellation_emits_nothing() {
    let events = EventBuffer::new();
    let core = OutboundCore::new(Protocol::Tcp, Box::new(events.clone()), ConnectionOptions::default());
    let (_tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let pump = StreamPump::new(core.clone(), rx, cancel.clone());
    let (client, server) = tokio::io::duplex(1024);

    cancel.cancel();
    pump.run(client).await;
    drop(server);

    assert!(events.is_empty());
    assert_ne!(core.state(), crate::connection::ConnectionState::Closed);
  }

  #[tokio::test]
  async fn framing_events_are_ignored_on_egress() {
    let events = EventBuffer::new();
    let (_core, tx, pump) = make_pump(&events);
    let (client, mut server) = tokio::io::duplex(1024);

    tx.send(Event::MessageStart).unwrap();
    tx.send(Event::Data(Bytes::from_static(b"a"))).unwrap();
    tx.send(Event::MessageEnd).unwrap();
    tx.send(Event::Data(Bytes::from_static(b"b"))).unwrap();
    drop(tx);

    let script = async move {
      let mut collected = Vec::new();
      server.read_to_end(&mut collected).await.unwrap();
      assert_eq!(collected, b"ab"); // payload concatenated, framing dropped
      drop(server);
    };
    tokio::join!(pump.run(client), script);
  }
}
