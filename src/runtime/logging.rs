//! Process-wide `tracing` setup.
//!
//! Engine events carry an `instance` field. Script console output is logged
//! under the `dimina_jscore::console` target.

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Environment variable holding the log filter, e.g. `DIMINA_LOG=dimina_jscore=debug`.
pub const LOG_ENV: &str = "DIMINA_LOG";

static TRACING: OnceCell<()> = OnceCell::new();

/// Install the fmt subscriber once. Later calls, or a subscriber installed by
/// the embedding application, leave the existing one in place.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let layer = tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .with_target(true)
            .with_filter(filter);

        let _ = Registry::default().with(layer).try_init();
    });
}
