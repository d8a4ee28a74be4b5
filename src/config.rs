#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{BrokerError, Result};
use crate::process::ManagerConfig;
use crate::storage::retry::{RetryPolicy, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT};
use crate::types::OperationType;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = ".broker/config.toml";
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_DB_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

const ENV_PREFIX: &str = "BROKER_";

/// Worker count per operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueWorkers {
    pub provisioning: usize,
    pub deprovisioning: usize,
    pub update: usize,
    pub upgrade_kyma: usize,
    pub upgrade_cluster: usize,
}

impl Default for QueueWorkers {
    fn default() -> Self {
        Self {
            provisioning: 25,
            deprovisioning: 25,
            update: 20,
            upgrade_kyma: 10,
            upgrade_cluster: 10,
        }
    }
}

impl QueueWorkers {
    #[must_use]
    pub const fn for_type(&self, operation_type: OperationType) -> usize {
        match operation_type {
            OperationType::Provision => self.provisioning,
            OperationType::Deprovision => self.deprovisioning,
            OperationType::Update => self.update,
            OperationType::UpgradeKyma => self.upgrade_kyma,
            OperationType::UpgradeCluster => self.upgrade_cluster,
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.provisioning
            + self.deprovisioning
            + self.update
            + self.upgrade_kyma
            + self.upgrade_cluster
    }
}

/// Setting key for the worker count of one queue.
const fn workers_key(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::Provision => "provisioning_workers",
        OperationType::Deprovision => "deprovisioning_workers",
        OperationType::Update => "update_workers",
        OperationType::UpgradeKyma => "upgrade_kyma_workers",
        OperationType::UpgradeCluster => "upgrade_cluster_workers",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub step_retry_interval: Duration,
    pub storage_retry: RetryPolicy,
    pub max_page_size: u32,
    pub workers: QueueWorkers,
}

impl EngineConfig {
    #[must_use]
    pub const fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            operation_timeout: self.operation_timeout,
            step_retry_interval: self.step_retry_interval,
        }
    }

    /// Database URL safe for logs.
    #[must_use]
    pub fn masked_database_url(&self) -> String {
        mask_database_url(&self.database_url)
    }

    /// Resolves the configuration from the process environment and the
    /// config file, if it exists.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or a value is invalid.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let env_lookup = |key: &str| std::env::var(key).ok();
        let config_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .map_err(|e| BrokerError::ConfigError(format!("Failed to read config: {e}")))?;
            ConfigFile::parse(&content, env_lookup)
        } else {
            ConfigFile::default()
        };
        Self::resolve_from(env_lookup, &file)
    }

    /// Environment wins over the file, the file wins over defaults.
    ///
    /// # Errors
    /// Returns `ConfigError` for values that are not positive integers.
    pub fn resolve_from<F>(env_lookup: F, file: &ConfigFile) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings {
            env_lookup: &env_lookup,
            file,
        };

        let mut workers = QueueWorkers::default();
        for operation_type in OperationType::ALL {
            let key = workers_key(operation_type);
            let Some(count) = settings.positive(key)? else {
                continue;
            };
            let count = usize::try_from(count)
                .map_err(|_| BrokerError::ConfigError(format!("{key} is out of range")))?;
            match operation_type {
                OperationType::Provision => workers.provisioning = count,
                OperationType::Deprovision => workers.deprovisioning = count,
                OperationType::Update => workers.update = count,
                OperationType::UpgradeKyma => workers.upgrade_kyma = count,
                OperationType::UpgradeCluster => workers.upgrade_cluster = count,
            }
        }

        let db_max_connections = match settings.positive("db_max_connections")? {
            Some(value) => u32::try_from(value).map_err(|_| {
                BrokerError::ConfigError("db_max_connections is out of range".to_string())
            })?,
            None => default_max_connections(workers.total()),
        };
        let max_page_size = match settings.positive("max_page_size")? {
            Some(value) => u32::try_from(value).map_err(|_| {
                BrokerError::ConfigError("max_page_size is out of range".to_string())
            })?,
            None => DEFAULT_MAX_PAGE_SIZE,
        };

        let storage_retry = RetryPolicy::new(
            settings
                .positive("storage_retry_interval_ms")?
                .map_or(DEFAULT_RETRY_INTERVAL, Duration::from_millis),
            settings
                .positive("storage_retry_timeout_ms")?
                .map_or(DEFAULT_RETRY_TIMEOUT, Duration::from_millis),
        );
        let defaults = ManagerConfig::default();

        Ok(Self {
            database_url: settings.database_url(),
            db_max_connections,
            db_connect_timeout: settings
                .positive("db_connect_timeout_ms")?
                .map_or(DEFAULT_DB_CONNECT_TIMEOUT, Duration::from_millis),
            operation_timeout: settings
                .positive("operation_timeout_secs")?
                .map_or(defaults.operation_timeout, Duration::from_secs),
            step_retry_interval: settings
                .positive("step_retry_interval_secs")?
                .map_or(defaults.step_retry_interval, Duration::from_secs),
            storage_retry,
            max_page_size,
            workers,
        })
    }
}

/// `key = "value"` lines of the config file, with `${VAR:-default}` already expanded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    entries: HashMap<String, String>,
}

impl ConfigFile {
    pub fn parse<F>(content: &str, env_lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_entry)
            .map(|(key, value)| (key.to_string(), expand_env_vars(value, &env_lookup)))
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

struct Settings<'a, F> {
    env_lookup: &'a F,
    file: &'a ConfigFile,
}

impl<F> Settings<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn env(&self, name: &str) -> Option<String> {
        (self.env_lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn raw(&self, key: &str) -> Option<String> {
        self.env(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()))
            .or_else(|| {
                self.file
                    .get(key)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string)
            })
    }

    fn positive(&self, key: &str) -> Result<Option<u64>> {
        self.raw(key)
            .map(|raw| {
                raw.parse::<u64>()
                    .ok()
                    .filter(|value| *value > 0)
                    .ok_or_else(|| {
                        BrokerError::ConfigError(format!(
                            "{key} must be a positive integer, got '{raw}'"
                        ))
                    })
            })
            .transpose()
    }

    fn database_url(&self) -> String {
        self.env("DATABASE_URL")
            .or_else(|| self.raw("database_url"))
            .unwrap_or_else(|| self.computed_default_database_url())
    }

    fn computed_default_database_url(&self) -> String {
        let user = self.env("BROKER_DB_USER").unwrap_or_else(|| "broker".to_string());
        let pass = self
            .env("BROKER_DB_PASSWORD")
            .unwrap_or_else(|| "broker".to_string());
        let host = self
            .env("BROKER_DB_HOST")
            .unwrap_or_else(|| "localhost".to_string());
        let port = self.env("BROKER_DB_PORT").unwrap_or_else(|| "5432".to_string());
        let db = self
            .env("BROKER_DB_NAME")
            .unwrap_or_else(|| "broker_db".to_string());
        format!("postgres://{user}:{pass}@{host}:{port}/{db}")
    }
}

fn default_max_connections(total_workers: usize) -> u32 {
    let workers = u32::try_from(total_workers).unwrap_or(u32::MAX);
    32_u32.max(workers.saturating_mul(3))
}

fn parse_entry(line: &str) -> Option<(&str, &str)> {
    line.split_once('=')
        .map(|(lhs, rhs)| (lhs.trim(), rhs.trim().trim_matches('"')))
        .filter(|(key, _)| !key.is_empty())
}

pub fn parse_key_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    parse_entry(line).and_then(|(lhs, rhs)| (lhs == key).then_some(rhs))
}

fn expand_env_vars<F>(input: &str, env_lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = input.to_string();
    let mut cursor = 0;
    while let Some(offset) = result[cursor..].find("${") {
        let start = cursor + offset;
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_part = &result[start + 2..start + end];
        let (var_name, default) = var_part.split_once(":-").unwrap_or((var_part, ""));
        let value = env_lookup(var_name).unwrap_or_else(|| default.to_string());
        result.replace_range(start..=(start + end), &value);
        cursor = start + value.len();
    }
    result
}

#[must_use]
pub fn mask_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("********"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid-database-url>".to_string(),
    }
}
