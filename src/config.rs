//! Configuration file handling for the ledger.
//!
//! The configuration file is stored at `$LEDGER_HOME/config.json` and contains the collaborator
//! endpoints, the admin list and the batch settings for sync and migration jobs. Credentials live
//! beside it in `$LEDGER_HOME/.secrets`.

use crate::api::Mode;
use crate::auth::Authorizer;
use crate::error::{ErrorType, IntoResult, Res};
use crate::store::{DocumentStore, SqliteStore, MAX_BATCH_OPS};
use crate::sync::{RemovedPolicy, SyncOptions};
use crate::{utils, Result};
use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use url::Url;

const APP_NAME: &str = "ledger";
const CONFIG_VERSION: u8 = 1;
const SECRETS: &str = ".secrets";
const CONFIG_JSON: &str = "config.json";
const LEDGER_SQLITE: &str = "ledger.sqlite";
const AGGREGATOR_JSON: &str = "aggregator.json";
const MODEL_JSON: &str = "model.json";

/// Credentials for the bank-data aggregator, read from `.secrets/aggregator.json`.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSecret {
    pub client_id: String,
    pub secret: String,
}

impl Debug for AggregatorSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorSecret")
            .field("client_id", &self.client_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Credentials for the generative model, read from `.secrets/model.json`.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelSecret {
    pub api_key: String,
}

impl Debug for ModelSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSecret")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// What `Config::create` needs to lay out a new ledger home.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub aggregator_url: Url,
    pub model_url: Url,
    pub webhook_url: Option<Url>,
    /// User ids allowed to seed and publish global rules.
    pub admins: Vec<String>,
    /// Copied into `.secrets/aggregator.json` if given.
    pub aggregator_secret: Option<PathBuf>,
    /// Copied into `.secrets/model.json` if given.
    pub model_secret: Option<PathBuf>,
}

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to `$LEDGER_HOME` and from there it loads `$LEDGER_HOME/config.json`, opens the
/// SQLite store and, in live mode, reads the collaborator credentials.
#[derive(Clone)]
pub struct Config {
    root: PathBuf,
    secrets: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
    sqlite_path: PathBuf,
    store: Arc<dyn DocumentStore>,
    aggregator_url: Url,
    model_url: Url,
    webhook_url: Option<Url>,
    aggregator_secret: Option<AggregatorSecret>,
    model_secret: Option<ModelSecret>,
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("root", &self.root)
            .field("config_file", &self.config_file)
            .field("sqlite_path", &self.sqlite_path)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Creates the ledger home directory and:
    /// - writes an initial `config.json` with default batch settings
    /// - copies any given secret files into `.secrets`
    /// - initializes the SQLite store
    ///
    /// # Errors
    /// - Returns a `Config` error if any file operation fails or the store already exists.
    pub async fn create(dir: impl Into<PathBuf>, options: InitOptions) -> Result<Self> {
        Self::create_inner(dir.into(), options)
            .await
            .pub_result(ErrorType::Config)
    }

    async fn create_inner(maybe_relative: PathBuf, options: InitOptions) -> Res<Self> {
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the ledger home directory")?;
        let root = utils::canonicalize(&maybe_relative).await?;
        let config_path = root.join(CONFIG_JSON);
        if config_path.exists() {
            bail!("A ledger already exists at '{}'", root.display());
        }

        let secrets = root.join(SECRETS);
        utils::make_dir(&secrets).await?;
        if let Some(from) = &options.aggregator_secret {
            utils::copy(from, secrets.join(AGGREGATOR_JSON)).await?;
        }
        if let Some(from) = &options.model_secret {
            utils::copy(from, secrets.join(MODEL_JSON)).await?;
        }

        let config_file = ConfigFile {
            aggregator_url: options.aggregator_url.to_string(),
            model_url: options.model_url.to_string(),
            webhook_url: options.webhook_url.as_ref().map(Url::to_string),
            admins: options.admins,
            ..ConfigFile::default()
        };
        config_file.validate()?;
        config_file.save(&config_path).await?;

        let sqlite_path = root.join(LEDGER_SQLITE);
        let store = SqliteStore::init(&sqlite_path)
            .await
            .context("Unable to create the SQLite store")?;

        Ok(Self {
            root,
            secrets,
            config_path,
            config_file,
            sqlite_path,
            store: Arc::new(store),
            aggregator_url: options.aggregator_url,
            model_url: options.model_url,
            webhook_url: options.webhook_url,
            aggregator_secret: None,
            model_secret: None,
        })
    }

    /// This will
    /// - validate that `ledger_home` and its config file exist
    /// - load and validate the config file
    /// - open the SQLite store
    /// - in `Mode::Live`, load both credential files
    ///
    /// Every failure is a `Config` error, raised before any job starts.
    pub async fn load(ledger_home: impl Into<PathBuf>, mode: Mode) -> Result<Self> {
        Self::load_inner(ledger_home.into(), mode)
            .await
            .pub_result(ErrorType::Config)
    }

    async fn load_inner(maybe_relative: PathBuf, mode: Mode) -> Res<Self> {
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("The ledger home is missing")?;

        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            bail!("The config file is missing '{}'", config_path.display())
        }
        let config_file = ConfigFile::load(&config_path).await?;
        let aggregator_url = parse_url("aggregator_url", &config_file.aggregator_url)?;
        let model_url = parse_url("model_url", &config_file.model_url)?;
        let webhook_url = config_file
            .webhook_url
            .as_deref()
            .map(|u| parse_url("webhook_url", u))
            .transpose()?;

        let secrets = root.join(SECRETS);
        if !secrets.is_dir() {
            bail!("The secrets directory is missing '{}'", secrets.display())
        }

        let sqlite_path = root.join(LEDGER_SQLITE);
        let store = SqliteStore::load(&sqlite_path)
            .await
            .context("Unable to load the SQLite store")?;

        let mut config = Self {
            root,
            secrets,
            config_path,
            config_file,
            sqlite_path,
            store: Arc::new(store),
            aggregator_url,
            model_url,
            webhook_url,
            aggregator_secret: None,
            model_secret: None,
        };
        if mode == Mode::Live {
            let path = config.aggregator_secret_path();
            config.aggregator_secret = Some(
                utils::deserialize(&path)
                    .await
                    .context("Unable to load the aggregator credentials")?,
            );
            let path = config.model_secret_path();
            config.model_secret = Some(
                utils::deserialize(&path)
                    .await
                    .context("Unable to load the model credentials")?,
            );
        }
        debug!("Loaded config from {}", config.config_path.display());
        Ok(config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn secrets(&self) -> &Path {
        &self.secrets
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Swaps the document store, so command tests can inject store failures.
    #[cfg(test)]
    pub(crate) fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn aggregator_url(&self) -> &Url {
        &self.aggregator_url
    }

    pub fn model_url(&self) -> &Url {
        &self.model_url
    }

    pub fn webhook_url(&self) -> Option<&Url> {
        self.webhook_url.as_ref()
    }

    /// `None` unless the config was loaded in `Mode::Live`.
    pub fn aggregator_secret(&self) -> Option<&AggregatorSecret> {
        self.aggregator_secret.as_ref()
    }

    /// `None` unless the config was loaded in `Mode::Live`.
    pub fn model_secret(&self) -> Option<&ModelSecret> {
        self.model_secret.as_ref()
    }

    pub fn authorizer(&self) -> Authorizer {
        Authorizer::new(self.config_file.admins.iter())
    }

    pub fn sync_options(&self) -> SyncOptions {
        let sync = &self.config_file.sync;
        SyncOptions {
            batch_size: sync.batch_size,
            removed: sync.removed,
            concurrency: sync.concurrency,
        }
    }

    pub fn migrate_settings(&self) -> MigrateSettings {
        self.config_file.migrate
    }

    /// Returns the stored `aggregator_secret_path` if it is absolute, otherwise resolves it
    /// against the ledger home.
    pub fn aggregator_secret_path(&self) -> PathBuf {
        self.resolve(
            self.config_file
                .aggregator_secret_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(SECRETS).join(AGGREGATOR_JSON)),
        )
    }

    /// Returns the stored `model_secret_path` if it is absolute, otherwise resolves it against
    /// the ledger home.
    pub fn model_secret_path(&self) -> PathBuf {
        self.resolve(
            self.config_file
                .model_secret_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(SECRETS).join(MODEL_JSON)),
        )
    }

    fn resolve(&self, p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            return p;
        }
        self.root.join(p)
    }
}

fn parse_url(field: &str, value: &str) -> Res<Url> {
    Url::parse(value).with_context(|| format!("Invalid {field} in config file: '{value}'"))
}

/// Sync settings in `config.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Record writes per commit.
    pub batch_size: usize,
    pub removed: RemovedPolicy,
    /// Owners synced at once by `sync --all`.
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let defaults = SyncOptions::default();
        Self {
            batch_size: defaults.batch_size,
            removed: defaults.removed,
            concurrency: defaults.concurrency,
        }
    }
}

/// Migration settings in `config.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MigrateSettings {
    /// Records read per query.
    pub page_size: usize,
    /// Record writes per commit.
    pub batch_size: usize,
}

impl Default for MigrateSettings {
    fn default() -> Self {
        Self {
            page_size: 400,
            batch_size: 450,
        }
    }
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "ledger",
///   "config_version": 1,
///   "aggregator_url": "https://sandbox.aggregator.example/",
///   "model_url": "https://model.example/v1/generate",
///   "admins": ["ops-1"],
///   "sync": { "batch_size": 400, "removed": "flag", "concurrency": 4 },
///   "migrate": { "page_size": 400, "batch_size": 450 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "ledger"
    app_name: String,

    config_version: u8,

    aggregator_url: String,

    model_url: String,

    /// Registered with the aggregator when an account is linked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    webhook_url: Option<String>,

    #[serde(default)]
    admins: Vec<String>,

    #[serde(default)]
    sync: SyncSettings,

    #[serde(default)]
    migrate: MigrateSettings,

    /// Relative to the ledger home or absolute. Defaults to `.secrets/aggregator.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregator_secret_path: Option<PathBuf>,

    /// Relative to the ledger home or absolute. Defaults to `.secrets/model.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_secret_path: Option<PathBuf>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            aggregator_url: String::new(),
            model_url: String::new(),
            webhook_url: None,
            admins: Vec::new(),
            sync: SyncSettings::default(),
            migrate: MigrateSettings::default(),
            aggregator_secret_path: None,
            model_secret_path: None,
        }
    }
}

impl ConfigFile {
    async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        let config: ConfigFile = utils::deserialize(path).await?;
        config.validate()?;
        Ok(config)
    }

    async fn save(&self, path: impl AsRef<Path>) -> Res<()> {
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(path, data)
            .await
            .context("Unable to write config file")
    }

    fn validate(&self) -> Res<()> {
        ensure!(
            self.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            self.app_name
        );
        check_batch("sync.batch_size", self.sync.batch_size)?;
        check_batch("migrate.batch_size", self.migrate.batch_size)?;
        ensure!(self.migrate.page_size > 0, "migrate.page_size must be at least 1");
        ensure!(self.sync.concurrency > 0, "sync.concurrency must be at least 1");
        Ok(())
    }
}

/// Batch sizes must stay strictly below the store's atomic limit.
pub(crate) fn check_batch(name: &str, size: usize) -> Res<()> {
    ensure!(
        size > 0 && size < MAX_BATCH_OPS,
        "{name} must be between 1 and {}, got {size}",
        MAX_BATCH_OPS - 1
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> InitOptions {
        InitOptions {
            aggregator_url: Url::parse("https://aggregator.example/").unwrap(),
            model_url: Url::parse("https://model.example/v1/generate").unwrap(),
            webhook_url: None,
            admins: vec!["ops-1".to_string()],
            aggregator_secret: None,
            model_secret: None,
        }
    }

    async fn write_json(path: &Path, json: &str) {
        utils::write(path, json).await.unwrap();
    }

    #[tokio::test]
    async fn test_config_create_and_load() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("ledger_home");
        let agg = dir.path().join("agg.json");
        let model = dir.path().join("model.json");
        write_json(&agg, r#"{"client_id": "cid", "secret": "s3cret"}"#).await;
        write_json(&model, r#"{"api_key": "k"}"#).await;

        let created = Config::create(
            &home,
            InitOptions {
                aggregator_secret: Some(agg.clone()),
                model_secret: Some(model),
                ..options()
            },
        )
        .await
        .unwrap();
        assert!(created.secrets().is_dir());
        assert!(created.sqlite_path().is_file());
        assert!(agg.is_file());

        let loaded = Config::load(&home, Mode::Live).await.unwrap();
        assert_eq!(loaded.aggregator_secret().unwrap().client_id, "cid");
        assert_eq!(loaded.model_secret().unwrap().api_key, "k");
        assert_eq!(loaded.sync_options().batch_size, 400);
        assert_eq!(loaded.sync_options().removed, RemovedPolicy::Flag);
        assert_eq!(loaded.migrate_settings(), MigrateSettings::default());
        assert!(loaded.authorizer().check("ops-1").is_ok());
        assert!(!format!("{:?}", loaded.aggregator_secret()).contains("s3cret"));
    }

    #[tokio::test]
    async fn test_missing_secrets_fail_only_in_live_mode() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("ledger_home");
        Config::create(&home, options()).await.unwrap();

        let err = Config::load(&home, Mode::Live).await.unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Config);
        let config = Config::load(&home, Mode::Test).await.unwrap();
        assert!(config.aggregator_secret().is_none());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("ledger_home");
        Config::create(&home, options()).await.unwrap();
        let err = Config::create(&home, options()).await.unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Config);
    }

    #[tokio::test]
    async fn test_config_file_load_with_minimal_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_json(
            &path,
            r#"{
                "app_name": "ledger",
                "config_version": 1,
                "aggregator_url": "https://aggregator.example/",
                "model_url": "https://model.example/"
            }"#,
        )
        .await;
        let config = ConfigFile::load(&path).await.unwrap();
        assert!(config.admins.is_empty());
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.migrate.batch_size, 450);
    }

    #[tokio::test]
    async fn test_config_file_rejections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        for (json, needle) in [
            (
                r#"{"app_name": "wrong_app", "config_version": 1, "aggregator_url": "", "model_url": ""}"#,
                "Invalid app_name",
            ),
            (
                r#"{"app_name": "ledger", "config_version": 1, "aggregator_url": "", "model_url": "",
                    "sync": {"batch_size": 500}}"#,
                "sync.batch_size",
            ),
            (
                r#"{"app_name": "ledger", "config_version": 1, "aggregator_url": "", "model_url": "",
                    "migrate": {"batch_size": 0}}"#,
                "migrate.batch_size",
            ),
        ] {
            write_json(&path, json).await;
            let err = ConfigFile::load(&path).await.unwrap_err();
            assert!(err.to_string().contains(needle), "{err}");
        }
    }

    #[test]
    fn test_serialization_omits_none_fields() {
        let json = serde_json::to_string(&ConfigFile::default()).unwrap();
        assert!(!json.contains("webhook_url"));
        assert!(!json.contains("aggregator_secret_path"));
        assert!(json.contains(r#""removed":"flag""#));
    }

    #[test]
    fn test_check_batch() {
        assert!(check_batch("b", 1).is_ok());
        assert!(check_batch("b", 499).is_ok());
        assert!(check_batch("b", 500).is_err());
        assert!(check_batch("b", 0).is_err());
    }
}
