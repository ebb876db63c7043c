//! Tandem Runtime
//!
//! Command-line host: loads or evaluates scripts in one context and prints
//! the completion value

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use tandem_script::Context;

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries script output and the result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!("Tandem v{}", tandem_core::VERSION);

    let ctx = Context::with_config(cli.engine_config()?)?;
    ctx.set("print", cli::print_function())?;

    let result = cli.execute(&ctx)?;
    if !result.is_undefined() {
        println!("{}", serde_json::to_string_pretty(&result.to_json()?)?);
    }

    ctx.gc()?;
    Ok(())
}
