//! Cron-driven entry point: every invocation advances treasury work by one
//! step and exits.

use clap::Parser;
use st0x_treasury::cli::{self, Cli};
use st0x_treasury::config::{Ctx, setup_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = Cli::parse();
    let ctx = Ctx::load_file(&parsed.config)?;
    setup_tracing(ctx.log_level);

    cli::run(ctx, parsed.command).await?;
    Ok(())
}
