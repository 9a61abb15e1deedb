//! # Bassline
//!
//! Binary for the Bassline propagation kernel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  apps/bassline (THE BINARY)                 │
//! │                                                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐  │
//! │  │    CLI      │   │  Peer server │   │     Bridges     │  │
//! │  │   (clap)    │   │    (axum)    │   │ local / remote  │  │
//! │  └──────┬──────┘   └──────┬───────┘   └────────┬────────┘  │
//! │         └─────────────────┼────────────────────┘           │
//! │                           ▼                                │
//! │                   ┌───────────────┐                        │
//! │                   │ bassline-core │                        │
//! │                   │   (KERNEL)    │                        │
//! │                   └───────────────┘                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Serve the kernel to remote bridges
//! bassline server --port 8080
//!
//! # Run commands locally or against a peer
//! bassline exec '{"type":"add-group","name":"root"}'
//! bassline exec -f commands.json --remote http://127.0.0.1:8080
//!
//! # Templates
//! bassline export -g 1 -o adder.bltp -t binary
//! bassline import -i adder.bltp
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // BASSLINE_LOG_FORMAT=json switches to machine-parseable output.
    let log_format = std::env::var("BASSLINE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bassline=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
