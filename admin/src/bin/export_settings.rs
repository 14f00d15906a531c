//! Export Settings - Publishes local settings to the `settings` secret bundle.
//!
//! Settings are read from the environment (and `.env`), never from the secret
//! store itself. An existing bundle is left alone unless `--replace` is given.

use clap::Parser;
use shared::{AwsSecretStore, ExportOutcome, Settings, SETTINGS_SECRET_NAME};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "export_settings")]
#[command(about = "Publish local settings to the secret store", long_about = None)]
struct Args {
    /// Delete an existing bundle before exporting
    #[arg(long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();

    let settings = Settings::from_env()?;
    let store = AwsSecretStore::from_settings(&settings).await;

    let outcome = if args.replace {
        settings.export_replacing(&store).await?
    } else {
        settings.export(&store).await?
    };

    if outcome == ExportOutcome::Exported {
        info!(secret = SETTINGS_SECRET_NAME, region = %settings.aws_region, "settings published");
    }

    Ok(())
}
