//! Secret bundle storage backed by AWS Secrets Manager.
//!
//! A secret bundle is a named set of string key/value pairs. On the wire it is a
//! single JSON object stored as the secret's `SecretString`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::config::{Credentials, Region};
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::Client as SecretsClient;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::Settings;

/// A decoded secret bundle.
pub type SecretBundle = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret '{0}' already exists")]
    AlreadyExists(String),
    /// A bundle of this name was deleted and the store has not finished purging it.
    #[error("secret '{0}' is scheduled for deletion")]
    PendingDeletion(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret '{name}' is not a valid bundle: {reason}")]
    Malformed { name: String, reason: String },
    #[error("AWS error: {0}")]
    Aws(String),
}

/// Remote store for named secret bundles.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the bundle stored under `name`.
    async fn get_secret_bundle(&self, name: &str) -> Result<SecretBundle, SecretStoreError>;

    /// Create a new bundle. Fails with [`SecretStoreError::AlreadyExists`] if `name` is taken.
    async fn create_secret_bundle(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<(), SecretStoreError>;

    /// Delete the bundle stored under `name`.
    async fn delete_secret_bundle(&self, name: &str) -> Result<(), SecretStoreError>;
}

/// Encode a bundle as the JSON object stored in the secret.
pub fn encode_bundle(values: &BTreeMap<String, String>) -> String {
    Value::Object(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
    .to_string()
}

/// Decode a secret string into a bundle.
///
/// Numbers and booleans are accepted and kept in their JSON text form, nulls are
/// dropped. Nested arrays or objects make the bundle malformed.
pub fn decode_bundle(name: &str, secret_string: &str) -> Result<SecretBundle, SecretStoreError> {
    let malformed = |reason: String| SecretStoreError::Malformed {
        name: name.to_string(),
        reason,
    };

    let object: serde_json::Map<String, Value> =
        serde_json::from_str(secret_string).map_err(|e| malformed(e.to_string()))?;

    let mut bundle = SecretBundle::with_capacity(object.len());
    for (key, value) in object {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => continue,
            Value::Array(_) | Value::Object(_) => {
                return Err(malformed(format!("value for '{}' is not a scalar", key)))
            }
        };
        bundle.insert(key, value);
    }

    Ok(bundle)
}

fn sdk_error<E, R>(err: &SdkError<E, R>) -> SecretStoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            SecretStoreError::Unavailable(message)
        }
        _ => SecretStoreError::Aws(message),
    }
}

/// Secret store backed by AWS Secrets Manager, with a per-instance read cache.
pub struct AwsSecretStore {
    client: SecretsClient,
    cache: RwLock<HashMap<String, SecretBundle>>,
}

impl AwsSecretStore {
    pub fn new(client: SecretsClient) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Build a client from the default AWS provider chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(SecretsClient::new(&config))
    }

    /// Build a client for the region in `settings`, using its static keys when both are set.
    pub async fn from_settings(settings: &Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.aws_region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&settings.aws_access_key, &settings.aws_secret_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "twin-settings",
            ));
        }

        Self::new(SecretsClient::new(&loader.load().await))
    }

    /// Clear the read cache (useful after out-of-band edits or credential rotation).
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(name);
    }
}

#[async_trait]
impl SecretStore for AwsSecretStore {
    async fn get_secret_bundle(&self, name: &str) -> Result<SecretBundle, SecretStoreError> {
        // Check cache first
        {
            let cache = self.cache.read().await;
            if let Some(bundle) = cache.get(name) {
                return Ok(bundle.clone());
            }
        }

        let response = match self.client.get_secret_value().secret_id(name).send().await {
            Ok(response) => response,
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false);
                return Err(if not_found {
                    SecretStoreError::NotFound(name.to_string())
                } else {
                    sdk_error(&err)
                });
            }
        };

        let secret_string = response.secret_string().ok_or_else(|| SecretStoreError::Malformed {
            name: name.to_string(),
            reason: "secret has no string value".to_string(),
        })?;

        let bundle = decode_bundle(name, secret_string)?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(name.to_string(), bundle.clone());
        }

        Ok(bundle)
    }

    async fn create_secret_bundle(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<(), SecretStoreError> {
        let result = self
            .client
            .create_secret()
            .name(name)
            .secret_string(encode_bundle(values))
            .send()
            .await;

        if let Err(err) = result {
            return Err(match err.as_service_error() {
                Some(e) if e.is_resource_exists_exception() => {
                    SecretStoreError::AlreadyExists(name.to_string())
                }
                Some(e)
                    if e.is_invalid_request_exception()
                        && e.message().is_some_and(|m| m.contains("scheduled for deletion")) =>
                {
                    SecretStoreError::PendingDeletion(name.to_string())
                }
                _ => sdk_error(&err),
            });
        }

        self.invalidate(name).await;
        debug!(secret = name, keys = values.len(), "created secret bundle");
        Ok(())
    }

    async fn delete_secret_bundle(&self, name: &str) -> Result<(), SecretStoreError> {
        let result = self
            .client
            .delete_secret()
            .secret_id(name)
            .force_delete_without_recovery(true)
            .send()
            .await;

        self.invalidate(name).await;

        if let Err(err) = result {
            let not_found = err
                .as_service_error()
                .map(|e| e.is_resource_not_found_exception())
                .unwrap_or(false);
            return Err(if not_found {
                SecretStoreError::NotFound(name.to_string())
            } else {
                sdk_error(&err)
            });
        }

        debug!(secret = name, "deleted secret bundle");
        Ok(())
    }
}

/// Map-backed secret store for local runs and tests.
pub struct InMemorySecretStore {
    bundles: RwLock<HashMap<String, SecretBundle>>,
    available: bool,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self {
            bundles: RwLock::new(HashMap::new()),
            available: true,
        }
    }

    /// A store whose every call fails as if the service were unreachable.
    pub fn unavailable() -> Self {
        Self {
            bundles: RwLock::new(HashMap::new()),
            available: false,
        }
    }

    fn check_available(&self) -> Result<(), SecretStoreError> {
        if self.available {
            Ok(())
        } else {
            Err(SecretStoreError::Unavailable(
                "in-memory store is offline".to_string(),
            ))
        }
    }
}

impl Default for InMemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret_bundle(&self, name: &str) -> Result<SecretBundle, SecretStoreError> {
        self.check_available()?;
        self.bundles
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }

    async fn create_secret_bundle(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<(), SecretStoreError> {
        self.check_available()?;
        let mut bundles = self.bundles.write().await;
        if bundles.contains_key(name) {
            return Err(SecretStoreError::AlreadyExists(name.to_string()));
        }
        bundles.insert(
            name.to_string(),
            values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        Ok(())
    }

    async fn delete_secret_bundle(&self, name: &str) -> Result<(), SecretStoreError> {
        self.check_available()?;
        self.bundles
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_secretsmanager::config::retry::RetryConfig;
    use aws_smithy_runtime::client::http::test_util::{ReplayEvent, StaticReplayClient};
    use aws_smithy_types::body::SdkBody;

    fn reply(status: u16, body: &str) -> ReplayEvent {
        ReplayEvent::new(
            http::Request::builder()
                .uri("https://secretsmanager.eu-central-1.amazonaws.com/")
                .body(SdkBody::empty())
                .unwrap(),
            http::Response::builder()
                .status(status)
                .header("content-type", "application/x-amz-json-1.1")
                .body(SdkBody::from(body.to_string()))
                .unwrap(),
        )
    }

    fn secret_value(database_name: &str) -> ReplayEvent {
        let secret_string = encode_bundle(&BTreeMap::from([(
            "DATABASE_NAME".to_string(),
            database_name.to_string(),
        )]));
        let body = serde_json::json!({
            "ARN": "arn:aws:secretsmanager:eu-central-1:123456789012:secret:settings-AbCdEf",
            "Name": "settings",
            "VersionId": "v1",
            "SecretString": secret_string,
        });
        reply(200, &body.to_string())
    }

    fn service_error(kind: &str, message: &str) -> ReplayEvent {
        let body = serde_json::json!({ "__type": kind, "Message": message });
        reply(400, &body.to_string())
    }

    fn replay_store(events: Vec<ReplayEvent>) -> (AwsSecretStore, StaticReplayClient) {
        let http_client = StaticReplayClient::new(events);
        let config = aws_sdk_secretsmanager::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-central-1"))
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .retry_config(RetryConfig::disabled())
            .http_client(http_client.clone())
            .build();
        (AwsSecretStore::new(SecretsClient::from_conf(config)), http_client)
    }

    #[tokio::test]
    async fn test_aws_store_caches_reads() {
        let (store, http_client) = replay_store(vec![secret_value("twin")]);

        let first = store.get_secret_bundle("settings").await.unwrap();
        let second = store.get_secret_bundle("settings").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.get("DATABASE_NAME").map(String::as_str), Some("twin"));
        assert_eq!(http_client.actual_requests().count(), 1);
    }

    #[tokio::test]
    async fn test_aws_store_create_invalidates_cache() {
        let created = r#"{"ARN":"arn:aws:secretsmanager:eu-central-1:123456789012:secret:settings-AbCdEf","Name":"settings","VersionId":"v2"}"#;
        let (store, http_client) = replay_store(vec![
            secret_value("before"),
            reply(200, created),
            secret_value("after"),
        ]);

        let before = store.get_secret_bundle("settings").await.unwrap();
        assert_eq!(before.get("DATABASE_NAME").map(String::as_str), Some("before"));

        store.create_secret_bundle("settings", &BTreeMap::new()).await.unwrap();

        let after = store.get_secret_bundle("settings").await.unwrap();
        assert_eq!(after.get("DATABASE_NAME").map(String::as_str), Some("after"));
        assert_eq!(http_client.actual_requests().count(), 3);
    }

    #[tokio::test]
    async fn test_aws_store_clear_cache_refetches() {
        let (store, http_client) = replay_store(vec![secret_value("twin"), secret_value("twin")]);

        store.get_secret_bundle("settings").await.unwrap();
        store.clear_cache().await;
        store.get_secret_bundle("settings").await.unwrap();

        assert_eq!(http_client.actual_requests().count(), 2);
    }

    #[tokio::test]
    async fn test_aws_store_maps_service_errors() {
        let (store, _) = replay_store(vec![
            service_error(
                "ResourceNotFoundException",
                "Secrets Manager can't find the specified secret.",
            ),
            service_error(
                "ResourceExistsException",
                "The operation failed because the secret settings already exists.",
            ),
            service_error(
                "InvalidRequestException",
                "You can't create this secret because a secret with this name is already scheduled for deletion.",
            ),
            service_error("AccessDeniedException", "not authorized"),
        ]);
        let values = BTreeMap::new();

        assert!(matches!(
            store.get_secret_bundle("settings").await,
            Err(SecretStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.create_secret_bundle("settings", &values).await,
            Err(SecretStoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.create_secret_bundle("settings", &values).await,
            Err(SecretStoreError::PendingDeletion(_))
        ));
        assert!(matches!(
            store.create_secret_bundle("settings", &values).await,
            Err(SecretStoreError::Aws(_))
        ));
    }

    #[tokio::test]
    async fn test_aws_store_unreachable_is_unavailable() {
        let (store, _) = replay_store(Vec::new());

        assert!(matches!(
            store.get_secret_bundle("settings").await,
            Err(SecretStoreError::Unavailable(_))
        ));
    }


    #[test]
    fn test_decode_bundle_stringifies_scalars() {
        let json = r#"{"DATABASE_NAME":"twin","QDRANT_DATABASE_PORT":6333,"USE_QDRANT_CLOUD":true,"OPENAI_API_KEY":null}"#;
        let bundle = decode_bundle("settings", json).unwrap();
        assert_eq!(bundle.get("DATABASE_NAME"), Some(&"twin".to_string()));
        assert_eq!(bundle.get("QDRANT_DATABASE_PORT"), Some(&"6333".to_string()));
        assert_eq!(bundle.get("USE_QDRANT_CLOUD"), Some(&"true".to_string()));
        assert!(!bundle.contains_key("OPENAI_API_KEY"));
    }

    #[test]
    fn test_decode_bundle_rejects_nested_values() {
        let err = decode_bundle("settings", r#"{"COPIES":[1,2]}"#).unwrap_err();
        assert!(matches!(err, SecretStoreError::Malformed { .. }));

        let err = decode_bundle("settings", "not json").unwrap_err();
        assert!(matches!(err, SecretStoreError::Malformed { .. }));
    }

    #[test]
    fn test_encoded_bundle_decodes_to_same_entries() {
        let mut values = BTreeMap::new();
        values.insert("DATABASE_NAME".to_string(), "twin".to_string());
        values.insert("TOP_P_INFERENCE".to_string(), "0.9".to_string());

        let bundle = decode_bundle("settings", &encode_bundle(&values)).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("TOP_P_INFERENCE"), Some(&"0.9".to_string()));
    }

    #[tokio::test]
    async fn test_in_memory_store_lifecycle() {
        let store = InMemorySecretStore::new();
        let mut values = BTreeMap::new();
        values.insert("DATABASE_NAME".to_string(), "twin".to_string());

        assert!(matches!(
            store.get_secret_bundle("settings").await,
            Err(SecretStoreError::NotFound(_))
        ));

        store.create_secret_bundle("settings", &values).await.unwrap();
        assert!(matches!(
            store.create_secret_bundle("settings", &values).await,
            Err(SecretStoreError::AlreadyExists(_))
        ));

        let bundle = store.get_secret_bundle("settings").await.unwrap();
        assert_eq!(bundle.get("DATABASE_NAME"), Some(&"twin".to_string()));

        store.delete_secret_bundle("settings").await.unwrap();
        assert!(matches!(
            store.delete_secret_bundle("settings").await,
            Err(SecretStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemorySecretStore::unavailable();
        assert!(matches!(
            store.get_secret_bundle("settings").await,
            Err(SecretStoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.create_secret_bundle("settings", &BTreeMap::new()).await,
            Err(SecretStoreError::Unavailable(_))
        ));
    }
}
