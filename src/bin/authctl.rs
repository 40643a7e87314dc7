use admin_auth::settings::Settings;
use admin_auth::{init_tracing, run_admin, AdminCommand};
use clap::Parser;
use std::path::PathBuf;

/// Manage the users known to the admin authentication service.
#[derive(Parser)]
#[clap(version)]
struct Args {
    /// Directory holding the `default` and `local` configuration files.
    #[clap(long, default_value = "config")]
    config_dir: PathBuf,
    #[clap(subcommand)]
    command: AdminCommand,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::with_config_dir(&args.config_dir)?;
    init_tracing(&settings);
    run_admin(args.command, &settings).await
}
