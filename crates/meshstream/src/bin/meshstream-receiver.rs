use anyhow::{Context, Result};
use clap::Parser;
use meshstream::{init_logging, LogLevel, Receiver, ReceiverConfig, ReceiverEvent};
use meshstream_assets::{AssetStore, ShaderTable};
use meshstream_network::{QuicChannel, StreamTransportConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive and decode a meshstream")]
struct Args {
    /// Sender address
    #[arg(default_value = "127.0.0.1:4433")]
    server: SocketAddr,

    /// Show each frame as it arrives instead of blending
    #[arg(long)]
    no_interpolate: bool,

    /// Milliseconds between blend steps
    #[arg(long, default_value = "10")]
    time_span: u64,

    /// Milliseconds without updates before snapping to the latest frame
    #[arg(long, default_value = "100")]
    lag_threshold: u64,

    /// Seconds to wait for an asset before asking again
    #[arg(long, default_value = "10")]
    request_timeout: u64,

    /// Give up on a missing asset after this many misses
    #[arg(long)]
    max_miss_retries: Option<u32>,

    /// Ask the sender for raw frames only
    #[arg(long)]
    no_compression: bool,

    /// Shader used for materials without a mapping
    #[arg(long, default_value = "Standard")]
    default_shader: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Path to log file (stdout if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level, args.log_file.as_deref())?;

    let config = ReceiverConfig {
        interpolate: !args.no_interpolate,
        time_span: Duration::from_millis(args.time_span),
        lag_threshold: Duration::from_millis(args.lag_threshold),
        request_timeout: Duration::from_secs(args.request_timeout),
        max_miss_retries: args.max_miss_retries,
        accept_compression: !args.no_compression,
        ..ReceiverConfig::default()
    };

    let (channel, events) = QuicChannel::connect(args.server, StreamTransportConfig::default())
        .await
        .with_context(|| format!("Failed to connect to {}", args.server))?;

    let store = Arc::new(AssetStore::new());
    let (receiver, mut updates) = Receiver::new(
        config,
        Arc::new(channel),
        store,
        ShaderTable::new(args.default_shader),
    );

    let session = tokio::spawn(receiver.run(events, async {
        let _ = tokio::signal::ctrl_c().await;
    }));

    while let Some(update) = updates.recv().await {
        match update {
            ReceiverEvent::AssetsReady { vertex_counts } => {
                info!("Assets ready, vertex counts {:?}", vertex_counts);
            }
            ReceiverEvent::Frame(frame) => {
                info!(
                    "{:?} #{}: {} vertices",
                    frame.kind, frame.timestamp, frame.vertices
                );
            }
            ReceiverEvent::ServerClosed => {
                info!("Sender closed the stream");
                break;
            }
            ReceiverEvent::Disconnected(_) => {
                info!("Disconnected");
                break;
            }
            ReceiverEvent::Connected(id) => info!("Connected as {id}"),
        }
    }

    session.abort();
    Ok(())
}
