//! Settings for the twin services.
//!
//! Values are resolved from the `settings` secret bundle when it can be fetched, and
//! otherwise from the process environment (a `.env` file included) with built-in
//! defaults for anything unset.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::redact_uri;
use crate::secrets::{SecretBundle, SecretStore, SecretStoreError};
use crate::{Error, Result};

/// Name of the secret bundle holding the settings.
pub const SETTINGS_SECRET_NAME: &str = "settings";

/// Context size used for models missing from [`OFFICIAL_TOKEN_WINDOWS`].
pub const DEFAULT_TOKEN_WINDOW: u32 = 128_000;

/// Documented maximum context sizes per OpenAI model id.
pub const OFFICIAL_TOKEN_WINDOWS: &[(&str, u32)] = &[
    ("gpt_3.5-turbo", 16358),
    ("gpt-3.5-turbo", 16385),
    ("gpt-4-turbo", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
];

/// Create attempts made by [`Settings::export_replacing`] while a deleted bundle is still
/// being purged.
const REPLACE_ATTEMPTS: u32 = 10;
const REPLACE_RETRY_DELAY: Duration = Duration::from_millis(200);

const SENSITIVE_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "HUGGINGFACE_ACCESS_TOKEN",
    "COMET_API_KEY",
    "QDRANT_APIKEY",
    "AWS_ACCESS_KEY",
    "AWS_SECRET_KEY",
    "LINKEDIN_PASSWORD",
];

/// Usable token budget for `model_id`: 90% of its documented context size.
pub fn token_window_for(model_id: Option<&str>) -> u32 {
    let official = model_id
        .and_then(|id| {
            OFFICIAL_TOKEN_WINDOWS
                .iter()
                .find(|(known, _)| *known == id)
                .map(|(_, window)| *window)
        })
        .unwrap_or(DEFAULT_TOKEN_WINDOW);

    official * 9 / 10
}

/// Application settings.
///
/// Field names map to upper-case environment variables and bundle keys
/// (`database_host` is `DATABASE_HOST`).
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Settings {
    // OpenAI
    pub openai_model_id: Option<String>,
    pub openai_api_key: Option<String>,

    // HuggingFace
    pub huggingface_access_token: Option<String>,

    // Comet ML
    pub comet_api_key: Option<String>,
    pub comet_project: Option<String>,

    // MongoDB
    pub database_host: String,
    pub database_name: String,

    // Qdrant vector database
    pub use_qdrant_cloud: bool,
    pub qdrant_database_host: String,
    pub qdrant_database_port: u16,
    pub qdrant_cloud_url: String,
    pub qdrant_apikey: Option<String>,

    // AWS authentication
    pub aws_region: String,
    pub aws_access_key: Option<String>,
    pub aws_secret_key: Option<String>,
    pub aws_arn_role: Option<String>,

    // SageMaker deployment
    pub hf_model_id: String,
    pub gpu_instance_type: String,
    pub sm_num_gpus: u32,
    pub max_input_length: u32,
    pub max_total_tokens: u32,
    pub max_batch_total_tokens: u32,
    /// Number of replicas
    pub copies: u32,
    pub gpus: u32,
    pub cpus: u32,

    // SageMaker inference
    pub sagemaker_endpoint_config_inference: String,
    pub sagemaker_endpoint_inference: String,
    pub temperature_inference: f64,
    pub top_p_inference: f64,
    pub max_new_tokens_inference: u32,

    // RAG
    pub text_embedding_model_id: String,
    pub reranking_cross_encoder_model_id: String,
    pub rag_model_device: String,

    // LinkedIn crawler
    pub linkedin_username: Option<String>,
    pub linkedin_password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_model_id: Some("gpt-4o-mini".to_string()),
            openai_api_key: None,
            huggingface_access_token: None,
            comet_api_key: None,
            comet_project: None,
            database_host: "mongodb://localhost:27017".to_string(),
            database_name: "twin".to_string(),
            use_qdrant_cloud: false,
            qdrant_database_host: "localhost".to_string(),
            qdrant_database_port: 6333,
            qdrant_cloud_url: "str".to_string(),
            qdrant_apikey: None,
            aws_region: "eu-central-1".to_string(),
            aws_access_key: None,
            aws_secret_key: None,
            aws_arn_role: None,
            hf_model_id: "mlabonne/TwinLlama-3.1-8B-DPO".to_string(),
            gpu_instance_type: "ml.g5.2xlarge".to_string(),
            sm_num_gpus: 1,
            max_input_length: 2048,
            max_total_tokens: 4096,
            max_batch_total_tokens: 4096,
            copies: 1,
            gpus: 1,
            cpus: 2,
            sagemaker_endpoint_config_inference: "twin".to_string(),
            sagemaker_endpoint_inference: "twin".to_string(),
            temperature_inference: 0.01,
            top_p_inference: 0.9,
            max_new_tokens_inference: 150,
            text_embedding_model_id: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            reranking_cross_encoder_model_id: "cross-encoder/ms-marco-MiniLM-L-4-v2".to_string(),
            rag_model_device: "cpu".to_string(),
            linkedin_username: None,
            linkedin_password: None,
        }
    }
}

/// How [`Settings::load`] obtained its settings.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Built from the remote secret bundle.
    Loaded(Settings),
    /// The secret store could not provide the bundle; built from environment and defaults.
    FellBackToDefaults(Settings),
}

impl LoadOutcome {
    pub fn settings(&self) -> &Settings {
        match self {
            LoadOutcome::Loaded(settings) | LoadOutcome::FellBackToDefaults(settings) => settings,
        }
    }

    pub fn into_settings(self) -> Settings {
        match self {
            LoadOutcome::Loaded(settings) | LoadOutcome::FellBackToDefaults(settings) => settings,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, LoadOutcome::FellBackToDefaults(_))
    }
}

/// Result of [`Settings::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Exported,
    /// A bundle with the same name exists and was left untouched.
    AlreadyExists,
}

/// Layered key lookup: bundle entries first, then the fallback lookup.
struct Source<'a, F> {
    bundle: Option<&'a SecretBundle>,
    lookup: F,
}

impl<'a, F> Source<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        self.bundle
            .and_then(|bundle| bundle.get(key).cloned())
            .or_else(|| (self.lookup)(key))
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn optional(&self, key: &str, default: Option<String>) -> Option<String> {
        self.raw(key).or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{} = {:?}: {}", key, value, e))),
            None => Ok(default),
        }
    }

    /// Like `parse`, but infinities and NaN are rejected.
    fn float(&self, key: &str, default: f64) -> Result<f64> {
        let value = self.parse(key, default)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(Error::Config(format!("{} = {}: not a finite number", key, value)))
        }
    }

    fn boolean(&self, key: &str, default: bool) -> Result<bool> {
        match self.raw(key) {
            Some(value) => parse_bool(&value)
                .ok_or_else(|| Error::Config(format!("{} = {:?}: not a boolean", key, value))),
            None => Ok(default),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "t" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Load `.env` into the process environment. Returns false if a file was found but
/// could not be used.
fn load_dotenv() -> bool {
    report_dotenv(dotenvy::dotenv())
}

fn report_dotenv(result: std::result::Result<PathBuf, dotenvy::Error>) -> bool {
    match result {
        Ok(path) => {
            debug!(path = %path.display(), "loaded .env");
            true
        }
        Err(e) if e.not_found() => true,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable .env file");
            false
        }
    }
}

/// Name lookup over `vars` that ignores case. An exact-case match wins.
fn env_lookup<I>(vars: I) -> impl Fn(&str) -> Option<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let exact: HashMap<String, String> = vars.into_iter().collect();
    let mut folded = HashMap::with_capacity(exact.len());
    for (key, value) in &exact {
        let upper = key.to_ascii_uppercase();
        if *key == upper {
            folded.insert(upper, value.clone());
        } else {
            folded.entry(upper).or_insert_with(|| value.clone());
        }
    }

    move |key: &str| {
        exact
            .get(key)
            .or_else(|| folded.get(&key.to_ascii_uppercase()))
            .cloned()
    }
}

fn process_env() -> impl Fn(&str) -> Option<String> {
    env_lookup(
        env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?))),
    )
}

impl Settings {
    /// Load settings from environment variables (and `.env`, if present).
    ///
    /// Variable names are matched case-insensitively.
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_lookup(process_env())
    }

    /// Resolve settings against an arbitrary key lookup, defaulting anything it lacks.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::resolve(&Source {
            bundle: None,
            lookup,
        })
    }

    /// Resolve settings from a secret bundle, then `lookup`, then defaults.
    pub fn from_bundle<F>(bundle: &SecretBundle, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::resolve(&Source {
            bundle: Some(bundle),
            lookup,
        })
    }

    fn resolve<F>(src: &Source<'_, F>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();

        Ok(Self {
            openai_model_id: src.optional("OPENAI_MODEL_ID", d.openai_model_id),
            openai_api_key: src.optional("OPENAI_API_KEY", d.openai_api_key),
            huggingface_access_token: src
                .optional("HUGGINGFACE_ACCESS_TOKEN", d.huggingface_access_token),
            comet_api_key: src.optional("COMET_API_KEY", d.comet_api_key),
            comet_project: src.optional("COMET_PROJECT", d.comet_project),
            database_host: src.string("DATABASE_HOST", d.database_host),
            database_name: src.string("DATABASE_NAME", d.database_name),
            use_qdrant_cloud: src.boolean("USE_QDRANT_CLOUD", d.use_qdrant_cloud)?,
            qdrant_database_host: src.string("QDRANT_DATABASE_HOST", d.qdrant_database_host),
            qdrant_database_port: src.parse("QDRANT_DATABASE_PORT", d.qdrant_database_port)?,
            qdrant_cloud_url: src.string("QDRANT_CLOUD_URL", d.qdrant_cloud_url),
            qdrant_apikey: src.optional("QDRANT_APIKEY", d.qdrant_apikey),
            aws_region: src.string("AWS_REGION", d.aws_region),
            aws_access_key: src.optional("AWS_ACCESS_KEY", d.aws_access_key),
            aws_secret_key: src.optional("AWS_SECRET_KEY", d.aws_secret_key),
            aws_arn_role: src.optional("AWS_ARN_ROLE", d.aws_arn_role),
            hf_model_id: src.string("HF_MODEL_ID", d.hf_model_id),
            gpu_instance_type: src.string("GPU_INSTANCE_TYPE", d.gpu_instance_type),
            sm_num_gpus: src.parse("SM_NUM_GPUS", d.sm_num_gpus)?,
            max_input_length: src.parse("MAX_INPUT_LENGTH", d.max_input_length)?,
            max_total_tokens: src.parse("MAX_TOTAL_TOKENS", d.max_total_tokens)?,
            max_batch_total_tokens: src.parse("MAX_BATCH_TOTAL_TOKENS", d.max_batch_total_tokens)?,
            copies: src.parse("COPIES", d.copies)?,
            gpus: src.parse("GPUS", d.gpus)?,
            cpus: src.parse("CPUS", d.cpus)?,
            sagemaker_endpoint_config_inference: src.string(
                "SAGEMAKER_ENDPOINT_CONFIG_INFERENCE",
                d.sagemaker_endpoint_config_inference,
            ),
            sagemaker_endpoint_inference: src
                .string("SAGEMAKER_ENDPOINT_INFERENCE", d.sagemaker_endpoint_inference),
            temperature_inference: src.float("TEMPERATURE_INFERENCE", d.temperature_inference)?,
            top_p_inference: src.float("TOP_P_INFERENCE", d.top_p_inference)?,
            max_new_tokens_inference: src
                .parse("MAX_NEW_TOKENS_INFERENCE", d.max_new_tokens_inference)?,
            text_embedding_model_id: src.string("TEXT_EMBEDDING_MODEL_ID", d.text_embedding_model_id),
            reranking_cross_encoder_model_id: src.string(
                "RERANKING_CROSS_ENCODER_MODEL_ID",
                d.reranking_cross_encoder_model_id,
            ),
            rag_model_device: src.string("RAG_MODEL_DEVICE", d.rag_model_device),
            linkedin_username: src.optional("LINKEDIN_USERNAME", d.linkedin_username),
            linkedin_password: src.optional("LINKEDIN_PASSWORD", d.linkedin_password),
        })
    }

    /// Load settings from the `settings` secret bundle, falling back to the environment.
    ///
    /// Secret store failures are logged and never returned; an `Err` here means a
    /// value (from either source) could not be parsed.
    pub async fn load(store: &dyn SecretStore) -> Result<LoadOutcome> {
        load_dotenv();
        Self::load_with(store, process_env()).await
    }

    /// [`Settings::load`] against an explicit fallback lookup.
    pub async fn load_with<F>(store: &dyn SecretStore, lookup: F) -> Result<LoadOutcome>
    where
        F: Fn(&str) -> Option<String>,
    {
        info!(secret = SETTINGS_SECRET_NAME, "loading settings from the secret store");

        match store.get_secret_bundle(SETTINGS_SECRET_NAME).await {
            Ok(bundle) => Ok(LoadOutcome::Loaded(Self::from_bundle(&bundle, lookup)?)),
            Err(e) => {
                warn!(
                    secret = SETTINGS_SECRET_NAME,
                    error = %e,
                    "failed to load settings from the secret store, using environment defaults"
                );
                Ok(LoadOutcome::FellBackToDefaults(Self::from_lookup(lookup)?))
            }
        }
    }

    /// Token budget for the configured OpenAI model.
    pub fn openai_max_token_window(&self) -> u32 {
        token_window_for(self.openai_model_id.as_deref())
    }

    /// Every set field in its string form, keyed by variable name. Unset options are omitted.
    pub fn to_bundle(&self) -> Result<BTreeMap<String, String>> {
        let Value::Object(fields) = serde_json::to_value(self)? else {
            return Err(Error::Config("settings did not serialize to an object".to_string()));
        };

        Ok(fields
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Null => return None,
                    other => other.to_string(),
                };
                Some((key, value))
            })
            .collect())
    }

    /// Publish these settings as the `settings` secret bundle.
    ///
    /// An existing bundle is not overwritten: the call logs a warning and returns
    /// [`ExportOutcome::AlreadyExists`]. Other store failures are returned as errors.
    pub async fn export(&self, store: &dyn SecretStore) -> Result<ExportOutcome> {
        let values = self.to_bundle()?;

        match store.create_secret_bundle(SETTINGS_SECRET_NAME, &values).await {
            Ok(()) => {
                info!(secret = SETTINGS_SECRET_NAME, keys = values.len(), "exported settings");
                Ok(ExportOutcome::Exported)
            }
            Err(SecretStoreError::AlreadyExists(_)) => {
                warn!(
                    "secret '{}' already exists. Delete it (or run export_settings --replace) before trying to recreate it.",
                    SETTINGS_SECRET_NAME
                );
                Ok(ExportOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete any existing `settings` bundle, then export.
    ///
    /// Deletion completes asynchronously on the store side, so the create is retried
    /// briefly while the old bundle is still pending deletion.
    pub async fn export_replacing(&self, store: &dyn SecretStore) -> Result<ExportOutcome> {
        match store.delete_secret_bundle(SETTINGS_SECRET_NAME).await {
            Ok(()) => info!(secret = SETTINGS_SECRET_NAME, "deleted existing settings bundle"),
            Err(SecretStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut attempt = 1;
        loop {
            match self.export(store).await {
                Err(Error::SecretStore(SecretStoreError::PendingDeletion(_)))
                    if attempt < REPLACE_ATTEMPTS =>
                {
                    debug!(attempt, "previous settings bundle still pending deletion");
                    tokio::time::sleep(REPLACE_RETRY_DELAY).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.to_bundle().map_err(|_| fmt::Error)?;
        let mut map = f.debug_map();
        for (key, value) in &fields {
            if SENSITIVE_KEYS.contains(&key.as_str()) {
                map.entry(key, &"****");
            } else if key == "DATABASE_HOST" {
                map.entry(key, &redact_uri(value));
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}
