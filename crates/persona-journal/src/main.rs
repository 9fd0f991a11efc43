#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use persona_journal::{cli, config::Config, telemetry, Journal};

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = cli::Cli::parse();

    let cfg = Config::from_env()?;
    cfg.log_summary();

    let journal = Journal::from_config(&cfg)?;
    cli::run(args, &journal).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
