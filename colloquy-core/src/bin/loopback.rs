//! Loopback demo: a live session against the in-process echo transport.
//!
//! Opens the default microphone and speakers, streams captured speech
//! through the loopback channel, and plays the echo back — so you should
//! hear yourself with a small delay. After a few seconds a synthetic
//! barge-in flushes pending playback, then the session is closed and the
//! duplex diagnostics are printed.
//!
//! ```sh
//! RUST_LOG=info cargo run --bin loopback
//! ```

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use colloquy_core::session::{SessionConfig, SessionController};
use colloquy_core::transport::stub::LoopbackConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let connector = LoopbackConnector::new();
    let remote = connector.handle();
    let controller = SessionController::new(SessionConfig::default(), Box::new(connector));

    let mut status = controller.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            info!(phase = ?event.phase, detail = ?event.detail, "session status");
        }
    });

    let mut loudness = controller.subscribe_loudness();
    tokio::spawn(async move {
        let mut peak = 0f32;
        while let Ok(event) = loudness.recv().await {
            if event.level > peak {
                peak = event.level;
                info!(level = event.level, "new loudness peak");
            }
        }
    });

    controller.connect().await?;
    info!("say something — the echo plays back on your speakers");
    tokio::time::sleep(Duration::from_secs(5)).await;

    info!("injecting a barge-in: pending playback is flushed");
    remote.interrupt();
    tokio::time::sleep(Duration::from_secs(3)).await;

    controller.disconnect();
    // Give the session thread a moment to finish teardown.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snap = controller.diagnostics();
    info!(
        samples_captured = snap.samples_captured,
        frames_sent = snap.frames_sent,
        blocks_received = snap.blocks_received,
        chunks_scheduled = snap.chunks_scheduled,
        interruptions = snap.interruptions,
        "final diagnostics"
    );

    Ok(())
}
