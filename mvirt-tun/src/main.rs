use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use ipnet::IpNet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_tun::adapter::{Adapter, Consumer};
use mvirt_tun::config::AdapterConfig;
use mvirt_tun::exchange::{EXCH_MAX_BUFFER_SIZE, EXCH_MAX_PACKET_SIZE};
use mvirt_tun::lifecycle::AdapterState;
use mvirt_tun::registry::AdapterRegistry;
use mvirt_tun::tun::{self, TunDevice, TunStack};

/// Default consumer socket path.
const SOCKET_PATH: &str = "/run/mvirt/tun.sock";

/// Capacity of each read issued on behalf of a socket consumer.
const READ_BUFFER_SIZE: usize = 4 * EXCH_MAX_PACKET_SIZE;

#[derive(Parser, Debug)]
#[command(version, about = "Bridge a TUN device to exchange-buffer consumers", long_about = None)]
struct Args {
    /// Adapter and TUN device name (overrides the config file)
    #[arg(short, long)]
    name: Option<String>,

    /// Address to assign to the TUN device (e.g., 10.200.0.1/24)
    #[arg(short, long)]
    address: Option<IpNet>,

    /// Unix socket consumers connect to
    #[arg(short, long, default_value = SOCKET_PATH)]
    socket: PathBuf,

    /// Maximum queued outbound batches (overrides the config file)
    #[arg(long)]
    max_queued_batches: Option<usize>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn adapter_config(&self) -> Result<AdapterConfig> {
        let mut config = match &self.config {
            Some(path) => AdapterConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => AdapterConfig::default(),
        };
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(max) = self.max_queued_batches {
            config.max_queued_batches = max;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_tun=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = args.adapter_config()?;
    let name = config
        .name
        .get_or_insert_with(|| "mvirt-tun0".to_string())
        .clone();

    info!(name = %name, socket = %args.socket.display(), "Starting mvirt-tun bridge");

    let device = Arc::new(
        TunDevice::create(&name)
            .with_context(|| format!("Failed to create TUN device {name} (root privileges?)"))?,
    );
    device.bring_up().context("Failed to bring up TUN device")?;
    if let Some(address) = args.address {
        device
            .add_address(address)
            .context("Failed to assign TUN address")?;
    }

    let registry = AdapterRegistry::new();
    let adapter = registry.create(&config, Arc::new(TunStack::new(Arc::clone(&device))))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let reader = tun::spawn_reader(
        Arc::clone(&device),
        Arc::clone(&adapter),
        Arc::clone(&shutdown),
    )
    .context("Failed to spawn TUN reader")?;

    let listener = bind_socket(&args.socket)?;
    info!(socket = %args.socket.display(), "Waiting for consumers");

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let adapter = Arc::clone(&adapter);
                    tokio::spawn(async move {
                        if let Err(e) = serve_consumer(adapter, stream).await {
                            warn!(error = %e, "Consumer connection ended");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Failed to accept consumer"),
            },
        }
    }

    registry.halt_all();
    shutdown.store(true, Ordering::SeqCst);
    if reader.join().is_err() {
        error!("TUN reader thread panicked");
    }
    let _ = std::fs::remove_file(&args.socket);

    info!("Bridge stopped");
    Ok(())
}

fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // Stale socket from a previous run
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

/// Shuttle exchange buffers between one socket consumer and the adapter.
///
/// Each buffer travels as a u32 little-endian length followed by the buffer.
async fn serve_consumer(adapter: Arc<Adapter>, stream: UnixStream) -> Result<()> {
    let consumer = adapter.open()?;
    if adapter.state() == AdapterState::Paused
        && let Err(e) = adapter.restart()
    {
        debug!(error = %e, "Adapter already restarted");
    }
    info!(handle = %consumer.id(), "Consumer connected");

    let (mut rx, mut tx) = stream.into_split();
    let result = tokio::select! {
        r = pump_outbound(&consumer, &mut tx) => r,
        r = pump_inbound(&consumer, &mut rx) => r,
    };
    info!(handle = %consumer.id(), "Consumer disconnected");
    result
}

/// Adapter reads to the socket.
async fn pump_outbound(consumer: &Consumer, tx: &mut OwnedWriteHalf) -> Result<()> {
    loop {
        let buf = consumer.read(READ_BUFFER_SIZE)?.await?;
        tx.write_u32_le(buf.len() as u32).await?;
        tx.write_all(&buf).await?;
    }
}

/// Socket to adapter writes. Returns when the consumer closes the socket.
async fn pump_inbound(consumer: &Consumer, rx: &mut OwnedReadHalf) -> Result<()> {
    loop {
        let len = match rx.read_u32_le().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len > EXCH_MAX_BUFFER_SIZE {
            bail!("Write buffer of {len} bytes exceeds the exchange maximum");
        }
        let mut buf = vec![0u8; len];
        rx.read_exact(&mut buf).await?;
        match consumer.write(&buf) {
            Ok(report) => debug!(
                packets = report.packets,
                errors = report.errors,
                "Write buffer indicated"
            ),
            Err(e) => warn!(error = %e, "Write buffer rejected"),
        }
    }
}
