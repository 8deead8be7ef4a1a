mod activity;
mod changes;
mod classify;
mod cli;
mod config;
mod model;
mod notify;
mod poll;
mod remote;
mod store;

use std::env;

use anyhow::Result;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = cli::parse_args(&args)?;
    cli::run(command).await
}

/// Logs go to stderr so command output stays pipeable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("SPRINT_WATCH_LOG")
        .unwrap_or_else(|_| EnvFilter::new("sprint_watch=info,warn"));

    let format = env::var("SPRINT_WATCH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}
