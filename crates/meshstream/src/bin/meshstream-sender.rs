use anyhow::{Context, Result};
use clap::Parser;
use meshstream::{init_logging, DemoSource, LogLevel, Sender, SenderConfig};
use meshstream_assets::AssetStore;
use meshstream_codec::{CompressionAlgorithm, TileGrid};
use meshstream_network::{QuicChannel, StreamTransportConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream an animated demo mesh to receivers")]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: SocketAddr,

    /// Tiles per grid half-edge divisor
    #[arg(long, default_value = "4")]
    area_range: u8,

    /// Grid edge length in tiles
    #[arg(long, default_value = "128")]
    package_size: u8,

    /// Milliseconds between frames
    #[arg(long, default_value = "100")]
    frame_interval: u64,

    /// Fragments between two keyframes
    #[arg(long, default_value = "4")]
    subframes: u32,

    /// Compression offered to receivers that accept it
    #[arg(long, value_enum, default_value = "zstd")]
    compression: CompressionAlgorithm,

    /// Never compress frames
    #[arg(long)]
    no_compression: bool,

    /// Send frames on the unreliable class when the transport allows
    #[arg(long)]
    unreliable_stream: bool,

    /// Keep-alive interval in seconds
    #[arg(long, default_value = "5")]
    keep_alive: u64,

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
    info!("Sender args: {:?}", args);

    let config = SenderConfig {
        grid: TileGrid::new(args.area_range, args.package_size),
        frame_interval: Duration::from_millis(args.frame_interval.max(1)),
        subframes_per_keyframe: args.subframes,
        compression: (!args.no_compression).then_some(args.compression),
        reliable_stream: !args.unreliable_stream,
    };

    let source = DemoSource::default();
    let store = Arc::new(AssetStore::new());

    let transport = StreamTransportConfig {
        keep_alive_interval: Duration::from_secs(args.keep_alive),
        max_idle_timeout: Duration::from_secs(args.keep_alive * 6),
        ..StreamTransportConfig::default()
    };
    let (channel, events) = QuicChannel::listen(args.bind, transport)
        .await
        .context("Failed to start listener")?;
    info!("Streaming on {}", channel.local_addr()?);

    let sender = Sender::new(config, Arc::new(channel), store, source)?;
    let stats = sender
        .run(events, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("Final stats: {:?}", stats);
    Ok(())
}
