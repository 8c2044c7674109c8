//! Minimal wiring demo: the session layer talking to an in-process
//! responder.
//!
//! Run with `cargo run --example echo` (set `RUST_LOG=debug` to watch the
//! handshake).

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plover_crypto::protocol::NOISE_PATTERN;
use plover_crypto::{NoiseKeypair, Phase, UserAgent};
use plover_noise::{AuthIntent, LayerConfig, NoiseLayer, PayloadSink, TransportSink};

struct Wire {
    framing: AtomicBool,
    segments_tx: Sender<Vec<u8>>,
}

impl TransportSink for Wire {
    fn set_framing_enabled(&self, enabled: bool) {
        self.framing.store(enabled, Ordering::SeqCst);
    }

    fn write(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if self.framing.load(Ordering::SeqCst) {
            self.segments_tx.send(bytes.to_vec())?;
        } else {
            println!("header: {}", hex::encode(bytes));
        }
        Ok(())
    }
}

struct Printer {
    tx: Sender<Vec<u8>>,
}

impl PayloadSink for Printer {
    fn deliver(&self, payload: Vec<u8>) {
        let _ = self.tx.send(payload);
    }
}

fn main() -> anyhow::Result<()> {
    plover_common::init_tracing();

    let server_static = NoiseKeypair::generate();
    let client_static = NoiseKeypair::generate();

    // Key material enters as base64 configuration, the way a real client
    // would load it.
    let config = LayerConfig::from_base64(
        &client_static.to_base64(),
        &server_static.public().to_base64(),
        UserAgent::new("2.19.51", "linux", "demo", "6.1"),
        "echo-demo",
        true,
    )?;

    let (segments_tx, segments_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = unbounded();
    let (up_tx, up_rx) = unbounded();

    let layer = NoiseLayer::new(
        config,
        Arc::new(Wire {
            framing: AtomicBool::new(true),
            segments_tx,
        }),
        Arc::new(Printer { tx: up_tx }),
    );

    layer.on_auth_intent(AuthIntent {
        username: 123456789,
        passive: false,
    })?;

    // Responder side, in-process.
    let msg1 = segments_rx.recv_timeout(Duration::from_secs(2))?;
    let private = server_static.private_bytes();
    let mut responder = snow::Builder::new(NOISE_PATTERN.parse()?)
        .local_private_key(&private)
        .build_responder()?;

    let mut buf = vec![0u8; 65535];
    responder.read_message(&msg1, &mut buf)?;
    let mut msg2 = vec![0u8; 65535];
    let len = responder.write_message(&[], &mut msg2)?;
    msg2.truncate(len);
    layer.receive(msg2)?;
    let mut responder = responder.into_transport_mode()?;

    while layer.phase() != Phase::Transport {
        std::thread::sleep(Duration::from_millis(10));
    }

    // One encrypted round trip.
    layer.send(b"ping")?;
    let ciphertext = segments_rx.recv_timeout(Duration::from_secs(2))?;
    let mut plaintext = vec![0u8; ciphertext.len()];
    let len = responder.read_message(&ciphertext, &mut plaintext)?;
    println!("responder got: {}", String::from_utf8_lossy(&plaintext[..len]));

    let mut reply = vec![0u8; 64];
    let len = responder.write_message(b"pong", &mut reply)?;
    reply.truncate(len);
    layer.receive(reply)?;

    let payload = up_rx.recv_timeout(Duration::from_secs(2))?;
    println!("client got: {}", String::from_utf8_lossy(&payload));

    Ok(())
}
