pub mod fixtures;
pub mod network;

pub use fixtures::{populated_store, AssetSet};
pub use network::{LossyChannel, NetworkConditions};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    EnvFilter::new(
                        "meshstream=debug,meshstream_sync=debug,meshstream_network=debug,meshstream_codec=info",
                    )
                }),
            )
            .with_test_writer()
            .init();
    });
}
