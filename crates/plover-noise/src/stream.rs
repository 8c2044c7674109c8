//! Single-slot segment bridge between the handshake worker and the layer.
//!
//! The worker side makes blocking calls ([`SegmentedStream::write_segment`]
//! and [`SegmentedStream::read_segment`]); each call fires a [`StreamEvent`]
//! at the registered sink, synchronously on the worker thread. The sink
//! consumes the pending outbound segment (WRITE) or supplies the next
//! inbound one (READ) through the slot channels. This is the sole
//! concurrency boundary between the worker thread and the network-facing
//! thread.
//!
//! Both slots are `crossbeam_channel::bounded(1)`, so the handoff contract
//! (at most one segment in flight per direction) is enforced by the channel
//! itself rather than by callback discipline.

use anyhow::Result;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::trace;

use plover_crypto::SegmentIo;

/// Bridge signal consumed by the stream's event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A segment is waiting in the outbound slot.
    Write,
    /// The worker is blocked waiting for an inbound segment.
    Read,
}

/// Consumer of stream events; implemented by the session layer.
///
/// Invoked synchronously on the worker thread. Errors propagate back into
/// the worker's blocking call.
pub trait StreamEventSink: Send + Sync {
    fn on_stream_event(&self, event: StreamEvent) -> Result<()>;
}

/// Stream bridge errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    #[error("no event sink registered")]
    NoSink,

    #[error("no pending outbound segment")]
    Empty,
}

/// Blocking, single-slot, bidirectional segment adapter.
///
/// Lifetime is scoped to one handshake attempt; [`SegmentedStream::close`]
/// wakes any blocked caller with [`StreamError::Closed`].
pub struct SegmentedStream {
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    closed: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    sink: Mutex<Option<Arc<dyn StreamEventSink>>>,
}

impl SegmentedStream {
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = bounded(1);
        let (inbound_tx, inbound_rx) = bounded(1);
        // Never carries a message; dropping the sender is the close signal.
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        Self {
            outbound_tx,
            outbound_rx,
            inbound_tx,
            inbound_rx,
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            sink: Mutex::new(None),
        }
    }

    /// Register the event sink. Must happen before the worker starts.
    pub fn set_event_sink(&self, sink: Arc<dyn StreamEventSink>) {
        *self.sink.lock().expect("sink lock poisoned") = Some(sink);
    }

    /// Close the stream, waking blocked callers on both sides.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown_tx.lock().expect("shutdown lock poisoned").take();
        trace!("segmented stream closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn notify(&self, event: StreamEvent) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .expect("sink lock poisoned")
            .clone()
            .ok_or(StreamError::NoSink)?;
        sink.on_stream_event(event)
    }

    // ---- layer side ------------------------------------------------------

    /// Pop the pending outbound segment. The WRITE event guarantees one is
    /// waiting.
    pub fn take_write_segment(&self) -> Result<Vec<u8>, StreamError> {
        self.outbound_rx.try_recv().map_err(|_| {
            if self.is_closed() {
                StreamError::Closed
            } else {
                StreamError::Empty
            }
        })
    }

    /// Fill the inbound slot, unblocking the worker's pending read.
    pub fn put_read_segment(&self, segment: Vec<u8>) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        select! {
            send(self.inbound_tx, segment) -> res => res.map_err(|_| StreamError::Closed),
            recv(self.shutdown_rx) -> _ => Err(StreamError::Closed),
        }
    }
}

impl SegmentIo for SegmentedStream {
    /// Hand one segment to the layer. Blocks until the sink consumes it.
    fn write_segment(&self, segment: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::Closed.into());
        }

        select! {
            send(self.outbound_tx, segment) -> res => res.map_err(|_| StreamError::Closed)?,
            recv(self.shutdown_rx) -> _ => return Err(StreamError::Closed.into()),
        }
        self.notify(StreamEvent::Write)
    }

    /// Pull the next inbound segment, blocking until the sink supplies one.
    fn read_segment(&self) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(StreamError::Closed.into());
        }

        self.notify(StreamEvent::Read)?;

        // A segment supplied during the notify wins over a racing close.
        if let Ok(segment) = self.inbound_rx.try_recv() {
            return Ok(segment);
        }
        select! {
            recv(self.inbound_rx) -> seg => seg.map_err(|_| StreamError::Closed.into()),
            recv(self.shutdown_rx) -> _ => Err(StreamError::Closed.into()),
        }
    }
}

impl Default for SegmentedStream {
    fn default() -> Self {
        Self::new()
    }
}
