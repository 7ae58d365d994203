//! Tracing subscriber setup for the node process.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. `verbose` stacks: 0 = warn, 1 = info,
/// 2 = debug, 3+ = trace. `LATTICE_LOG` overrides the computed filter.
pub fn init(verbose: u8) {
    INIT.get_or_init(|| {
        let default = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_env("LATTICE_LOG")
            .unwrap_or_else(|_| EnvFilter::new(format!("lattice={default}")));
        let _ = Registry::default()
            .with(filter)
            .with(fmt::layer().compact().with_target(true))
            .try_init();
    });
}
