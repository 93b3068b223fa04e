//! Ferry worker process entry point.
//!
//! Spawned by the supervisor with stdio piped: stdout carries the wire
//! protocol, stderr carries logs.

mod loader;
mod runtime;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    runtime::run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
