//! Credential loading.
//!
//! All platform credentials and the storage location live in a single JSON
//! document identified by a secret id. Sections are `yahoo`, `microsoft` and
//! `storage`; keys are accepted in lower or upper case.

use crate::auth::Credentials;
use crate::error::Error;
use crate::platform::microsoft::Environment;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Returns the raw JSON document stored under `secret_id`.
    async fn fetch(&self, secret_id: &str) -> Result<String, Error>;
}

/// Reads `{dir}/{secret_id}.json`.
#[derive(Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSecretStore { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl SecretStore for FileSecretStore {
    async fn fetch(&self, secret_id: &str) -> Result<String, Error> {
        let path = self.dir.join(format!("{}.json", secret_id));
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::SecretUnavailable {
                secret_id: secret_id.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })
    }
}

/// Reads the document from an environment variable.
#[derive(Clone)]
pub struct EnvSecretStore {
    var: String,
}

impl EnvSecretStore {
    pub fn new(var: &str) -> Self {
        EnvSecretStore {
            var: var.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, secret_id: &str) -> Result<String, Error> {
        std::env::var(&self.var).map_err(|e| Error::SecretUnavailable {
            secret_id: secret_id.to_string(),
            reason: format!("{}: {}", self.var, e),
        })
    }
}

#[derive(Debug, Clone)]
pub struct YahooSecret {
    pub credentials: Credentials,
    pub base_account_id: Option<String>,
    pub exclude_search: Vec<String>,
    pub exclude_display: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MicrosoftSecret {
    pub credentials: Credentials,
    pub developer_token: String,
    pub customer_id: Option<String>,
    pub environment: Environment,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StorageSecret {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
}

/// A parsed secret document.
#[derive(Debug)]
pub struct Secrets {
    secret_id: String,
    doc: Map<String, Value>,
}

impl Secrets {
    pub async fn load(store: &dyn SecretStore, secret_id: &str) -> Result<Self, Error> {
        let raw = store.fetch(secret_id).await?;
        Self::parse(secret_id, &raw)
    }

    pub fn parse(secret_id: &str, raw: &str) -> Result<Self, Error> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(doc)) => Ok(Secrets {
                secret_id: secret_id.to_string(),
                doc,
            }),
            Ok(_) => Err(Error::SecretUnavailable {
                secret_id: secret_id.to_string(),
                reason: "secret is not a JSON object".to_string(),
            }),
            Err(e) => Err(Error::SecretUnavailable {
                secret_id: secret_id.to_string(),
                reason: format!("invalid JSON: {}", e),
            }),
        }
    }

    pub fn yahoo(&self) -> Result<YahooSecret, Error> {
        let section = self.section("yahoo")?;
        Ok(YahooSecret {
            credentials: self.credentials(section, "yahoo")?,
            base_account_id: lookup_str(section, "base_account_id"),
            exclude_search: normalize_ids(lookup(section, "exclude_account_ids_search")),
            exclude_display: normalize_ids(lookup(section, "exclude_account_ids_display")),
        })
    }

    pub fn microsoft(&self) -> Result<MicrosoftSecret, Error> {
        let section = self.section("microsoft")?;
        let environment = lookup_str(section, "environment")
            .or_else(|| lookup_str(section, "env"))
            .map(|e| e.parse::<Environment>())
            .transpose()?
            .unwrap_or_default();

        Ok(MicrosoftSecret {
            credentials: self.credentials(section, "microsoft")?,
            developer_token: self.required(section, "microsoft", "developer_token")?,
            customer_id: lookup_str(section, "customer_id"),
            environment,
            exclude: normalize_ids(lookup(section, "exclude_account_ids")),
        })
    }

    /// Storage settings are optional; CLI flags take precedence over them.
    pub fn storage(&self) -> StorageSecret {
        match self.section("storage") {
            Ok(section) => StorageSecret {
                bucket: lookup_str(section, "bucket"),
                prefix: lookup_str(section, "prefix"),
            },
            Err(_) => StorageSecret::default(),
        }
    }

    fn section(&self, name: &str) -> Result<&Map<String, Value>, Error> {
        match lookup(&self.doc, name) {
            Some(Value::Object(section)) => Ok(section),
            _ => Err(Error::MissingSecretKey {
                secret_id: self.secret_id.clone(),
                section: name.to_string(),
                key: name.to_string(),
            }),
        }
    }

    fn credentials(&self, section: &Map<String, Value>, name: &str) -> Result<Credentials, Error> {
        Ok(Credentials {
            client_id: self.required(section, name, "client_id")?,
            client_secret: self.required(section, name, "client_secret")?,
            refresh_token: self.required(section, name, "refresh_token")?,
        })
    }

    fn required(&self, section: &Map<String, Value>, name: &str, key: &str) -> Result<String, Error> {
        lookup_str(section, key).ok_or_else(|| Error::MissingSecretKey {
            secret_id: self.secret_id.clone(),
            section: name.to_string(),
            key: key.to_string(),
        })
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key)
        .or_else(|| map.get(&key.to_uppercase()))
        .filter(|v| !v.is_null())
}

fn lookup_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    let value = match lookup(map, key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

/// Accepts a JSON array or a comma-separated string of account ids and
/// returns the numeric ones, de-duplicated and in ascending order.
pub fn normalize_ids(value: Option<&Value>) -> Vec<String> {
    let tokens: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(Value::Number(n)) => vec![n.to_string()],
        _ => Vec::new(),
    };

    tokens
        .iter()
        .filter_map(|t| t.trim().parse::<u64>().ok())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|id| id.to_string())
        .collect()
}
