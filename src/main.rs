use admin_auth::settings::Settings;
use admin_auth::{init_tracing, run_server};
use clap::Parser;
use std::path::PathBuf;

/// Admin authentication service for the automation host.
#[derive(Parser)]
#[clap(version)]
struct Args {
    /// Directory holding the `default` and `local` configuration files.
    #[clap(long, default_value = "config")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::with_config_dir(&args.config_dir)?;
    init_tracing(&settings);
    run_server(settings).await
}
