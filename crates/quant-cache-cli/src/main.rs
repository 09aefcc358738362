use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = quant_cache_cli::Cli::parse();
    let config = quant_cache_cli::app_init()?;
    quant_cache_cli::run(cli, config).await
}
