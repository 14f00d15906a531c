//! Show Settings - Resolves settings the way the services do and logs the result.
//!
//! Secret values are redacted.

use clap::Parser;
use shared::{AwsSecretStore, Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "show_settings")]
#[command(about = "Print the effective settings", long_about = None)]
struct Args {
    /// Skip the secret store and resolve from the environment only
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();

    let (settings, source) = if args.offline {
        (Settings::from_env()?, "environment")
    } else {
        let store = AwsSecretStore::from_env().await;
        let outcome = Settings::load(&store).await?;
        let source = if outcome.is_fallback() {
            "environment"
        } else {
            "secret store"
        };
        (outcome.into_settings(), source)
    };

    info!(
        source,
        model = settings.openai_model_id.as_deref().unwrap_or("<unset>"),
        token_window = settings.openai_max_token_window(),
        "settings resolved"
    );
    println!("{:#?}", settings);

    Ok(())
}
