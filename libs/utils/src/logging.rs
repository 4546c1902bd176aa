//! Process-wide logging setup, shared by the `pg_catchup` binary and its
//! tests. Mirrors the teacher's `tracing` + `EnvFilter` initialization:
//! `RUST_LOG` controls verbosity, defaulting to `info` when unset.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(default_level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
