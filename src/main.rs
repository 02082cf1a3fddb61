use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Log filter comes from `PATTERNSTORE_LOG`; defaults to warnings only so
/// command output stays clean.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("PATTERNSTORE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    patternstore::run().context("patternstore command failed")
}
