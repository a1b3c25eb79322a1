use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use frontier_host::surface::{OutboundFrame, SurfaceKind};
use frontier_host::{HeadlessBackend, Host, HostConfig, HostEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => HostConfig::load(Some(path)),
        None => HostConfig::from_env(),
    }
    .context("load host config")?;
    setup_tracing(&config.log_filter);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let local = LocalSet::new();
    let result = local.block_on(&runtime, run(config));
    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_background();
    result
}

async fn run(config: HostConfig) -> Result<()> {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let root_preferences = config.root_preferences.clone();
    let host = Host::new(config, HeadlessBackend::new().with_outbox(outbox_tx))
        .context("register host handlers")?;
    let root = host
        .create_surface(SurfaceKind::TopLevel, root_preferences)
        .context("create root surface")?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("HOST_READY {root}\n").as_bytes())
        .await
        .context("write ready line")?;
    stdout.flush().await.context("flush stdout")?;
    info!(target = "host", surface = %root, "host ready");

    let writer = tokio::task::spawn_local(write_outbound(outbox_rx));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reader = tokio::task::spawn_local(read_events(events_tx));

    tokio::select! {
        _ = host.run(events_rx) => info!(target = "host", "input closed"),
        _ = tokio::signal::ctrl_c() => info!(target = "host", "interrupted"),
    }
    reader.abort();
    host.shutdown();
    drop(host);

    match tokio::time::timeout(SHUTDOWN_GRACE, writer).await {
        Ok(joined) => joined.context("join outbound writer")??,
        Err(_) => warn!(target = "host", "outbound writer did not drain in time"),
    }
    Ok(())
}

async fn read_events(events: mpsc::UnboundedSender<HostEvent>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<HostEvent>(line) {
            Ok(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(err) => warn!(target = "host", error = %err, "ignoring malformed event line"),
        }
    }
    Ok(())
}

async fn write_outbound(mut outbox: mpsc::UnboundedReceiver<OutboundFrame>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = outbox.recv().await {
        let mut line = serde_json::to_vec(&frame).context("encode outbound frame")?;
        line.push(b'\n');
        stdout.write_all(&line).await.context("write stdout")?;
        stdout.flush().await.context("flush stdout")?;
    }
    Ok(())
}

fn setup_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
