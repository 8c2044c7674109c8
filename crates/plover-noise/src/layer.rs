//! Session orchestration between the segmented transport and the
//! authenticated upper layer.
//!
//! [`NoiseLayer`] reacts to three external signals: auth-intent (emit the
//! version header and arm a handshake worker), disconnect (full reset) and
//! inbound segments from the transport. Inbound segments are always
//! appended to the session's FIFO queue; while the handshake runs they stay
//! buffered, and once the protocol reaches the transport phase they are
//! drained through the state machine and delivered upward in arrival order.
//!
//! # Locking
//!
//! `drain()` holds the layer's flush mutex for the whole pop/decrypt/deliver
//! loop; it is the only exclusive lock in the system with protocol-state
//! locking strictly nested inside it. Nothing called under it re-enters
//! `drain()`, so deadlock is structurally impossible.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error};

use plover_crypto::{
    ClientIdentity, NoiseKeypair, NoiseProtocol, NoisePublicKey, Phase, SegmentIo, UserAgent,
};

use crate::stream::{SegmentedStream, StreamError, StreamEvent, StreamEventSink};
use crate::worker::HandshakeWorker;

/// Fixed protocol version header (major 2, minor 1), written unframed
/// exactly once per connection attempt, before the first handshake segment.
pub const PROTOCOL_HEADER: [u8; 4] = [0x57, 0x41, 0x02, 0x01];

/// Auth-intent signal from the layer above.
#[derive(Debug, Clone, Copy)]
pub struct AuthIntent {
    pub username: u64,
    pub passive: bool,
}

/// Injected per-stack configuration: key material and identity metadata.
///
/// Everything here is construction-time data; the layer never fabricates
/// keys or identity fields on its own.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// Local static Noise keypair.
    pub keypair: NoiseKeypair,
    /// Known static public key of the server.
    pub server_static: NoisePublicKey,
    /// User-agent descriptor reported during the handshake.
    pub useragent: UserAgent,
    /// Display name reported during the handshake.
    pub pushname: String,
    /// Request a short-lived connection.
    pub short_connect: bool,
}

impl LayerConfig {
    /// Build a config from base64-encoded key material.
    pub fn from_base64(
        keypair: &str,
        server_static: &str,
        useragent: UserAgent,
        pushname: &str,
        short_connect: bool,
    ) -> plover_common::Result<Self> {
        let keypair = NoiseKeypair::from_base64(keypair).map_err(plover_common::Error::config)?;
        let server_static =
            NoisePublicKey::from_base64(server_static).map_err(plover_common::Error::config)?;

        Ok(Self {
            keypair,
            server_static,
            useragent,
            pushname: pushname.to_string(),
            short_connect,
        })
    }

    fn identity_for(&self, intent: &AuthIntent) -> ClientIdentity {
        ClientIdentity {
            username: intent.username,
            passive: intent.passive,
            useragent: self.useragent.clone(),
            pushname: self.pushname.clone(),
            short_connect: self.short_connect,
        }
    }
}

/// The layer's view of the transport below it.
pub trait TransportSink: Send + Sync {
    /// Toggle segment framing for subsequent writes. Disabled only around
    /// the version header.
    fn set_framing_enabled(&self, enabled: bool);

    /// Write bytes to the transport.
    fn write(&self, bytes: &[u8]) -> Result<()>;
}

/// The layer's view of the authenticated layer above it.
pub trait PayloadSink: Send + Sync {
    /// Deliver one decrypted application payload.
    fn deliver(&self, payload: Vec<u8>);
}

/// The opaque cryptographic collaborator.
///
/// [`NoiseProtocol`] is the production implementation; tests substitute a
/// scripted one so phase transitions are deterministic.
pub trait ProtocolStateMachine: Send + Sync {
    fn phase(&self) -> Phase;

    /// Return to the initial HANDSHAKE phase, discarding session state.
    fn reset(&self);

    /// Register the listener fired on the HANDSHAKE -> TRANSPORT
    /// transition.
    fn set_phase_listener(&self, listener: Box<dyn Fn(Phase) + Send + Sync>);

    /// Run the blocking handshake exchange over `io`.
    fn run_handshake(
        &self,
        io: Arc<dyn SegmentIo>,
        identity: &ClientIdentity,
        local_static: &NoiseKeypair,
        remote_static: &NoisePublicKey,
    ) -> Result<()>;

    /// Encrypt and transmit one application payload.
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Decrypt one inbound segment, returning the plaintext.
    fn receive(&self, segment: &[u8]) -> Result<Vec<u8>>;
}

impl ProtocolStateMachine for NoiseProtocol {
    fn phase(&self) -> Phase {
        NoiseProtocol::phase(self)
    }

    fn reset(&self) {
        NoiseProtocol::reset(self)
    }

    fn set_phase_listener(&self, listener: Box<dyn Fn(Phase) + Send + Sync>) {
        NoiseProtocol::set_phase_listener(self, listener)
    }

    fn run_handshake(
        &self,
        io: Arc<dyn SegmentIo>,
        identity: &ClientIdentity,
        local_static: &NoiseKeypair,
        remote_static: &NoisePublicKey,
    ) -> Result<()> {
        NoiseProtocol::run_handshake(self, io, identity, local_static, remote_static)
    }

    fn send(&self, payload: &[u8]) -> Result<()> {
        NoiseProtocol::send(self, payload)
    }

    fn receive(&self, segment: &[u8]) -> Result<Vec<u8>> {
        Ok(NoiseProtocol::receive(self, segment)?)
    }
}

/// Per-connection-attempt state. Fully replaced on disconnect.
struct Session {
    stream: Option<Arc<SegmentedStream>>,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    worker: Option<HandshakeWorker>,
}

impl Session {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            stream: None,
            inbound_tx,
            inbound_rx,
            worker: None,
        }
    }

    fn worker_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_active())
    }

    /// Close the stream and replace the queue; a worker blocked in either
    /// wakes with an error and exits.
    fn reset(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        let (inbound_tx, inbound_rx) = unbounded();
        self.inbound_tx = inbound_tx;
        self.inbound_rx = inbound_rx;
        self.worker = None;
    }
}

/// The Noise session layer.
pub struct NoiseLayer {
    weak: Weak<NoiseLayer>,
    config: LayerConfig,
    protocol: Arc<dyn ProtocolStateMachine>,
    transport: Arc<dyn TransportSink>,
    upstream: Arc<dyn PayloadSink>,
    session: Mutex<Session>,
    flush_lock: Mutex<()>,
}

impl NoiseLayer {
    /// Create a layer backed by the production [`NoiseProtocol`].
    pub fn new(
        config: LayerConfig,
        transport: Arc<dyn TransportSink>,
        upstream: Arc<dyn PayloadSink>,
    ) -> Arc<Self> {
        Self::with_protocol(config, Arc::new(NoiseProtocol::new()), transport, upstream)
    }

    /// Create a layer with an explicit protocol state machine.
    pub fn with_protocol(
        config: LayerConfig,
        protocol: Arc<dyn ProtocolStateMachine>,
        transport: Arc<dyn TransportSink>,
        upstream: Arc<dyn PayloadSink>,
    ) -> Arc<Self> {
        let layer = Arc::new_cyclic(|weak: &Weak<NoiseLayer>| NoiseLayer {
            weak: weak.clone(),
            config,
            protocol: protocol.clone(),
            transport,
            upstream,
            session: Mutex::new(Session::new()),
            flush_lock: Mutex::new(()),
        });

        let listener_layer = Arc::downgrade(&layer);
        protocol.set_phase_listener(Box::new(move |phase| {
            if let Some(layer) = listener_layer.upgrade() {
                layer.on_protocol_state_changed(phase);
            }
        }));

        layer
    }

    /// Current protocol phase.
    pub fn phase(&self) -> Phase {
        self.protocol.phase()
    }

    /// Number of inbound segments currently buffered.
    pub fn buffered_segments(&self) -> usize {
        self.session
            .lock()
            .expect("session lock poisoned")
            .inbound_rx
            .len()
    }

    /// Transport disconnected: reset to the initial state.
    ///
    /// The protocol returns to the HANDSHAKE phase and the session is
    /// replaced wholesale, discarding buffered segments. An in-flight
    /// worker is not joined; closing its stream wakes it if blocked, and
    /// otherwise it observes the transport failure on its own.
    pub fn on_disconnected(&self) {
        debug!("transport disconnected, resetting noise session");
        self.protocol.reset();
        self.session
            .lock()
            .expect("session lock poisoned")
            .reset();
    }

    /// Auth-intent signal: emit the version header and, unless a handshake
    /// is already in progress, arm a worker for this attempt.
    ///
    /// A repeated call while the handshake runs is a logged no-op, never an
    /// error.
    pub fn on_auth_intent(&self, intent: AuthIntent) -> Result<()> {
        debug!(
            username = intent.username,
            passive = intent.passive,
            "received auth intent"
        );

        // The version header travels outside segment framing.
        self.transport.set_framing_enabled(false);
        let wrote = self.transport.write(&PROTOCOL_HEADER);
        self.transport.set_framing_enabled(true);
        wrote.context("failed to write protocol header")?;

        let mut session = self.session.lock().expect("session lock poisoned");
        if self.protocol.phase() != Phase::Handshake || session.worker_active() {
            debug!("handshake already in progress, ignoring auth intent");
            return Ok(());
        }

        let stream = Arc::new(SegmentedStream::new());
        let sink = self
            .weak
            .upgrade()
            .expect("layer alive while handling auth intent");
        stream.set_event_sink(sink);

        debug!(username = intent.username, "starting handshake worker");
        let worker = HandshakeWorker::spawn(
            self.protocol.clone(),
            stream.clone(),
            self.config.identity_for(&intent),
            self.config.keypair.clone(),
            self.config.server_static,
        )
        .context("failed to start handshake worker")?;

        session.stream = Some(stream);
        session.worker = Some(worker);
        Ok(())
    }

    /// Accept one application payload for encryption and transmission.
    ///
    /// Valid in either phase; pre-handshake rejection is the state
    /// machine's call.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.protocol.send(payload)
    }

    /// Accept one raw segment from the transport.
    ///
    /// Always enqueued first, preserving arrival order regardless of
    /// phase; outside the handshake the queue is drained immediately on
    /// the calling thread.
    pub fn receive(&self, segment: Vec<u8>) -> Result<()> {
        let tx = self
            .session
            .lock()
            .expect("session lock poisoned")
            .inbound_tx
            .clone();
        if tx.send(segment).is_err() {
            // The session was reset between the clone and the send; the
            // segment belonged to the dead session.
            debug!("discarding segment addressed to a reset session");
            return Ok(());
        }

        if self.protocol.phase() != Phase::Handshake {
            self.drain()?;
        }
        Ok(())
    }

    /// Phase listener target: flush everything buffered during the
    /// handshake, exactly once per transition.
    fn on_protocol_state_changed(&self, phase: Phase) {
        if phase != Phase::Transport {
            return;
        }
        debug!("protocol entered transport phase, flushing buffered segments");
        if let Err(e) = self.drain() {
            error!("flush after phase transition failed: {e:#}");
        }
    }

    /// Pop, decrypt and deliver buffered segments until the queue is empty.
    ///
    /// Serialized by the flush mutex. A push that races a finishing drain
    /// is not lost: the pusher re-checks the phase after enqueueing and
    /// runs its own drain.
    fn drain(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().expect("flush lock poisoned");
        let rx = self
            .session
            .lock()
            .expect("session lock poisoned")
            .inbound_rx
            .clone();

        while let Ok(segment) = rx.try_recv() {
            let payload = self
                .protocol
                .receive(&segment)
                .context("failed to decrypt buffered segment")?;
            self.upstream.deliver(payload);
        }
        Ok(())
    }
}

impl StreamEventSink for NoiseLayer {
    /// Bridge a worker-side stream call to the transport or the inbound
    /// queue. Runs on the worker thread; this is the only synchronization
    /// point between the two threads.
    fn on_stream_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Write => {
                let stream = self
                    .session
                    .lock()
                    .expect("session lock poisoned")
                    .stream
                    .clone()
                    .ok_or(StreamError::Closed)?;
                let segment = stream.take_write_segment()?;
                self.transport.write(&segment)
            }
            StreamEvent::Read => {
                let (stream, rx) = {
                    let session = self.session.lock().expect("session lock poisoned");
                    (
                        session.stream.clone().ok_or(StreamError::Closed)?,
                        session.inbound_rx.clone(),
                    )
                };
                let segment = rx.recv().map_err(|_| StreamError::Closed)?;
                Ok(stream.put_read_segment(segment)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted collaborator: blocks in `run_handshake` until the test
    /// releases the gate, then transitions and fires the listener.
    struct ScriptedProtocol {
        phase: Mutex<Phase>,
        listener: Mutex<Option<Box<dyn Fn(Phase) + Send + Sync>>>,
        handshakes: AtomicUsize,
        resets: AtomicUsize,
        sent: Mutex<Vec<Vec<u8>>>,
        gate_rx: Receiver<()>,
    }

    impl ScriptedProtocol {
        fn new() -> (Arc<Self>, Sender<()>) {
            let (gate_tx, gate_rx) = unbounded();
            let protocol = Arc::new(Self {
                phase: Mutex::new(Phase::Handshake),
                listener: Mutex::new(None),
                handshakes: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                gate_rx,
            });
            (protocol, gate_tx)
        }
    }

    impl ProtocolStateMachine for ScriptedProtocol {
        fn phase(&self) -> Phase {
            *self.phase.lock().unwrap()
        }

        fn reset(&self) {
            *self.phase.lock().unwrap() = Phase::Handshake;
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn set_phase_listener(&self, listener: Box<dyn Fn(Phase) + Send + Sync>) {
            *self.listener.lock().unwrap() = Some(listener);
        }

        fn run_handshake(
            &self,
            _io: Arc<dyn SegmentIo>,
            _identity: &ClientIdentity,
            _local_static: &NoiseKeypair,
            _remote_static: &NoisePublicKey,
        ) -> Result<()> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            if self.gate_rx.recv().is_err() {
                bail!("handshake aborted");
            }
            *self.phase.lock().unwrap() = Phase::Transport;
            if let Some(listener) = self.listener.lock().unwrap().as_ref() {
                listener(Phase::Transport);
            }
            Ok(())
        }

        fn send(&self, payload: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn receive(&self, segment: &[u8]) -> Result<Vec<u8>> {
            if *self.phase.lock().unwrap() != Phase::Transport {
                bail!("not established");
            }
            let mut out = b"dec:".to_vec();
            out.extend_from_slice(segment);
            Ok(out)
        }
    }

    /// Transport capturing every write together with the framing state it
    /// was made under.
    struct TestTransport {
        framing: AtomicBool,
        writes: Mutex<Vec<(bool, Vec<u8>)>>,
    }

    impl TestTransport {
        fn new() -> Self {
            Self {
                framing: AtomicBool::new(true),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl TransportSink for TestTransport {
        fn set_framing_enabled(&self, enabled: bool) {
            self.framing.store(enabled, Ordering::SeqCst);
        }

        fn write(&self, bytes: &[u8]) -> Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((self.framing.load(Ordering::SeqCst), bytes.to_vec()));
            Ok(())
        }
    }

    struct ChannelSink {
        tx: Sender<Vec<u8>>,
    }

    impl PayloadSink for ChannelSink {
        fn deliver(&self, payload: Vec<u8>) {
            let _ = self.tx.send(payload);
        }
    }

    fn test_config() -> LayerConfig {
        LayerConfig {
            keypair: NoiseKeypair::generate(),
            server_static: NoiseKeypair::generate().public(),
            useragent: UserAgent::new("2.19.51", "android", "vbox", "10"),
            pushname: "plover".to_string(),
            short_connect: true,
        }
    }

    fn intent() -> AuthIntent {
        AuthIntent {
            username: 123456789,
            passive: false,
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_layer() -> (
        Arc<NoiseLayer>,
        Arc<ScriptedProtocol>,
        Sender<()>,
        Arc<TestTransport>,
        Receiver<Vec<u8>>,
    ) {
        let (protocol, gate) = ScriptedProtocol::new();
        let transport = Arc::new(TestTransport::new());
        let (up_tx, up_rx) = unbounded();
        let layer = NoiseLayer::with_protocol(
            test_config(),
            protocol.clone(),
            transport.clone(),
            Arc::new(ChannelSink { tx: up_tx }),
        );
        (layer, protocol, gate, transport, up_rx)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn test_header_written_unframed_before_handshake() {
        let (layer, _protocol, gate, transport, _up_rx) = build_layer();

        layer.on_auth_intent(intent()).unwrap();

        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (false, PROTOCOL_HEADER.to_vec()));
        drop(writes);
        drop(gate);
    }

    #[test]
    fn test_buffered_segments_flush_in_order_on_transition() {
        let (layer, _protocol, gate, _transport, up_rx) = build_layer();
        layer.on_auth_intent(intent()).unwrap();

        layer.receive(b"s1".to_vec()).unwrap();
        layer.receive(b"s2".to_vec()).unwrap();
        layer.receive(b"s3".to_vec()).unwrap();
        assert_eq!(layer.buffered_segments(), 3);
        assert!(up_rx.is_empty());

        gate.send(()).unwrap();
        for expected in ["dec:s1", "dec:s2", "dec:s3"] {
            let payload = up_rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(payload, expected.as_bytes());
        }

        // Post-transition receive delivers immediately.
        layer.receive(b"s4".to_vec()).unwrap();
        let payload = up_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload, b"dec:s4");
        assert_eq!(layer.buffered_segments(), 0);
    }

    #[test]
    fn test_repeated_auth_intent_starts_one_worker() {
        let (layer, protocol, gate, transport, _up_rx) = build_layer();

        layer.on_auth_intent(intent()).unwrap();
        let first = layer.session.lock().unwrap().stream.clone().unwrap();

        layer.on_auth_intent(intent()).unwrap();
        let second = layer.session.lock().unwrap().stream.clone().unwrap();

        // Same stream, one worker; the header still went out per attempt.
        assert!(Arc::ptr_eq(&first, &second));
        wait_for(|| protocol.handshakes.load(Ordering::SeqCst) >= 1);
        assert_eq!(protocol.handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.writes.lock().unwrap().len(), 2);
        drop(gate);
    }

    #[test]
    fn test_auth_intent_after_transport_is_noop() {
        let (layer, protocol, gate, _transport, _up_rx) = build_layer();

        layer.on_auth_intent(intent()).unwrap();
        gate.send(()).unwrap();
        wait_for(|| layer.phase() == Phase::Transport);
        wait_for(|| !layer.session.lock().unwrap().worker_active());

        layer.on_auth_intent(intent()).unwrap();
        assert_eq!(protocol.handshakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_resets_state() {
        let (layer, protocol, gate, _transport, _up_rx) = build_layer();

        layer.on_auth_intent(intent()).unwrap();
        layer.receive(b"s1".to_vec()).unwrap();
        layer.receive(b"s2".to_vec()).unwrap();
        assert_eq!(layer.buffered_segments(), 2);

        layer.on_disconnected();
        assert_eq!(layer.phase(), Phase::Handshake);
        assert_eq!(layer.buffered_segments(), 0);
        assert_eq!(protocol.resets.load(Ordering::SeqCst), 1);

        // A fresh attempt arms a new worker.
        layer.on_auth_intent(intent()).unwrap();
        wait_for(|| protocol.handshakes.load(Ordering::SeqCst) == 2);
        drop(gate);
    }

    #[test]
    fn test_no_loss_under_concurrent_receive_and_transition() {
        let (layer, _protocol, gate, _transport, up_rx) = build_layer();
        layer.on_auth_intent(intent()).unwrap();

        let producer = {
            let layer = layer.clone();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    layer.receive(format!("m{i:03}").into_bytes()).unwrap();
                }
            })
        };

        // Fire the transition while the producer is mid-stream.
        gate.send(()).unwrap();

        for i in 0..200u32 {
            let payload = up_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(payload, format!("dec:m{i:03}").into_bytes());
        }
        producer.join().unwrap();
        assert_eq!(layer.buffered_segments(), 0);
    }

    #[test]
    fn test_send_forwards_to_protocol() {
        let (layer, protocol, gate, _transport, _up_rx) = build_layer();

        layer.send(b"payload").unwrap();
        assert_eq!(*protocol.sent.lock().unwrap(), vec![b"payload".to_vec()]);
        drop(gate);
    }

    #[test]
    fn test_config_from_base64_roundtrip() {
        let keypair = NoiseKeypair::generate();
        let server = NoiseKeypair::generate().public();

        let config = LayerConfig::from_base64(
            &keypair.to_base64(),
            &server.to_base64(),
            UserAgent::new("2.19.51", "android", "vbox", "10"),
            "plover",
            true,
        )
        .unwrap();
        assert_eq!(config.keypair.public(), keypair.public());
        assert_eq!(config.server_static, server);
    }

    #[test]
    fn test_config_from_base64_rejects_garbage() {
        assert!(LayerConfig::from_base64(
            "???",
            "???",
            UserAgent::new("1", "p", "d", "o"),
            "x",
            false,
        )
        .is_err());
    }
}
