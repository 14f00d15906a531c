//! Check Database - Opens the MongoDB connection from the resolved settings.
//!
//! Exits with status 2 when the server cannot be reached and 1 for any other
//! failure (bad URI, invalid settings).

use shared::{AwsSecretStore, MongoConnection, Settings};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn check() -> shared::Result<()> {
    let store = AwsSecretStore::from_env().await;
    let settings = Settings::load(&store).await?.into_settings();

    let connection = MongoConnection::mongo(&settings);
    let database = connection.database(&settings.database_name).await?;
    let collections = database.list_collection_names().await?;

    info!(
        database = %settings.database_name,
        collections = collections.len(),
        "database reachable"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    match check().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, transient = e.is_transient(), "database check failed");
            if e.is_transient() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
