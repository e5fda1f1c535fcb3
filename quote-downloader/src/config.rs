//! Downloader configuration: optional TOML file, then `QUOTES__*` environment variables.
//!
//! The API key pair comes from `API_KEY_ID` and `API_SECRET_KEY` and is required. A `.env` file
//! in the working directory is loaded first when present.
//!
//! ```toml
//! [request]
//! symbol = "QQQ"
//! start = "2016-01-01T00:00:00Z"
//! max_pages = 3
//!
//! [store]
//! path = "db/ticks.db"
//! file_mode = 0o600
//! lock_timeout_ms = 500
//!
//! [ingest]
//! batch_size = 500
//! worker_count = 4
//! ```
use std::env;

use anyhow::{bail, Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use quote_store::{IngestOptions, RetryPolicy, StoreOptions};
use serde::Deserialize;

use crate::fetch::{Credentials, QuotesRequest};

pub const DEFAULT_CONFIG_FILE: &str = "downloader.toml";
const CONFIG_FILE_VAR: &str = "QUOTES_CONFIG";
const ENV_PREFIX: &str = "QUOTES";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api_key_id: String,
    #[serde(default)]
    pub api_secret_key: String,
    #[serde(default)]
    pub request: QuotesRequest,
    #[serde(default)]
    pub store: StoreOptions,
    #[serde(default)]
    pub ingest: IngestOptions,
    /// Policy for the HTTP fetch.
    #[serde(default = "RetryPolicy::network")]
    pub fetch_retry: RetryPolicy,
    /// Policy for opening the store and creating namespaces.
    #[serde(default)]
    pub store_retry: RetryPolicy,
}

impl AppConfig {
    /// Loads `.env`, the config file named by `QUOTES_CONFIG` (default `downloader.toml`, optional)
    /// and the environment.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = env::var(CONFIG_FILE_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let builder = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("api_key_id", env::var("API_KEY_ID").ok())?
            .set_override_option("api_secret_key", env::var("API_SECRET_KEY").ok())?;
        Self::from_builder(builder).with_context(|| format!("loading configuration ({path})"))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key_id.is_empty() {
            bail!("API_KEY_ID is required");
        }
        if self.api_secret_key.is_empty() {
            bail!("API_SECRET_KEY is required");
        }
        self.request.validate()?;
        self.store.validate()?;
        self.ingest.validate()?;
        self.fetch_retry.validate().context("fetch_retry")?;
        self.store_retry.validate().context("store_retry")?;
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            key_id: self.api_key_id.clone(),
            secret_key: self.api_secret_key.clone(),
        }
    }
}
