use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LEVEL_VAR: &str = "LOG_LEVEL";

/// Installs the global subscriber. `--debug` wins over `LOG_LEVEL`, which
/// wins over the `info` default.
pub fn init(debug: bool) {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        level_from(std::env::var(LEVEL_VAR).ok().as_deref())
    };

    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
                .with_filter(level),
        )
        .try_init();
    if let Err(e) = installed {
        eprintln!("Logging already initialised: {e}");
    }
}

fn level_from(value: Option<&str>) -> LevelFilter {
    match value {
        None => LevelFilter::INFO,
        Some(raw) => LevelFilter::from_str(raw.trim()).unwrap_or_else(|_| {
            eprintln!("Unknown {LEVEL_VAR} {raw:?}, using info");
            LevelFilter::INFO
        }),
    }
}
