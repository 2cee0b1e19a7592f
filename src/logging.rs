//! Tracing setup shared by both binaries

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Map a `-v` count onto a level, starting from `base`
pub fn level_for(base: &str, verbosity: u8) -> &str {
    match (base, verbosity) {
        (base, 0) => base,
        (_, 1) => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("procraft={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_overrides_base() {
        assert_eq!(level_for("warn", 0), "warn");
        assert_eq!(level_for("warn", 1), "debug");
        assert_eq!(level_for("info", 3), "trace");
    }
}
