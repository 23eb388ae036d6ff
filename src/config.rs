//! Configuration loader and validator for the Hail sync worker.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::Credentials;

pub const ENV_CLIENT_ID: &str = "HAIL_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "HAIL_CLIENT_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub hail: Hail,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
}

/// Hail API and OAuth settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hail {
    /// Usually left empty in the file and provided through `HAIL_CLIENT_ID`.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Local records older than this are refetched.
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate_seconds: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://hail.to/api/v1/".into()
}

fn default_authorize_url() -> String {
    "https://hail.to/oauth/authorise".into()
}

fn default_token_url() -> String {
    "https://hail.to/api/v1/oauth/access_token".into()
}

fn default_scope() -> String {
    "user.basic content.read".into()
}

fn default_refresh_rate() -> u64 {
    86_400
}

fn default_page_size() -> u32 {
    50
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            client_id: self.hail.client_id.clone(),
            client_secret: self.hail.client_secret.clone(),
        }
    }

    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/hail.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }

    /// Overlay credentials from the environment. Non-empty values win over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(ENV_CLIENT_ID).filter(|v| !v.trim().is_empty()) {
            self.hail.client_id = id;
        }
        if let Some(secret) = lookup(ENV_CLIENT_SECRET).filter(|v| !v.trim().is_empty()) {
            self.hail.client_secret = secret;
        }
    }
}

/// Load configuration from a YAML file, overlay environment credentials and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env(|key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    // Missing credentials are allowed: the worker simply reports that it is
    // not ready to authorise.
    if cfg.hail.redirect_uri.trim().is_empty() {
        return Err(ConfigError::Invalid("hail.redirect_uri must be non-empty"));
    }
    match Url::parse(&cfg.hail.api_base) {
        Ok(url) if url.path().ends_with('/') => {}
        Ok(_) => return Err(ConfigError::Invalid("hail.api_base must end with '/'")),
        Err(_) => return Err(ConfigError::Invalid("hail.api_base must be a valid URL")),
    }
    if Url::parse(&cfg.hail.authorize_url).is_err() {
        return Err(ConfigError::Invalid("hail.authorize_url must be a valid URL"));
    }
    if Url::parse(&cfg.hail.token_url).is_err() {
        return Err(ConfigError::Invalid("hail.token_url must be a valid URL"));
    }
    if cfg.hail.page_size == 0 {
        return Err(ConfigError::Invalid("hail.page_size must be > 0"));
    }
    if cfg.hail.timeout_secs == 0 {
        return Err(ConfigError::Invalid("hail.timeout_secs must be > 0"));
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 5000

hail:
  # Prefer HAIL_CLIENT_ID / HAIL_CLIENT_SECRET in the environment.
  client_id: ""
  client_secret: ""
  redirect_uri: "http://localhost:8080/hail/callback"
  api_base: "https://hail.to/api/v1/"
  authorize_url: "https://hail.to/oauth/authorise"
  token_url: "https://hail.to/api/v1/oauth/access_token"
  scope: "user.basic content.read"
  refresh_rate_seconds: 86400
  page_size: 50
  timeout_secs: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.hail.page_size, 50);
        assert_eq!(cfg.hail.refresh_rate_seconds, 86_400);
    }

    #[test]
    fn defaults_fill_missing_endpoints() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 100
hail:
  redirect_uri: "http://localhost/cb"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.hail.api_base, "https://hail.to/api/v1/");
        assert_eq!(cfg.hail.timeout_secs, 30);
        assert!(cfg.hail.client_id.is_empty());
    }

    #[test]
    fn invalid_poll_interval() {
        let mut cfg = example_cfg();
        cfg.app.poll_interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("poll_interval_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_urls() {
        let mut cfg = example_cfg();
        cfg.hail.api_base = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.hail.api_base = "https://hail.to/api/v1".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("end with")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.hail.token_url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_page_size() {
        let mut cfg = example_cfg();
        cfg.hail.page_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn env_overrides_credentials() {
        let mut cfg = example_cfg();
        cfg.hail.client_id = "from-file".into();
        cfg.apply_env(|key| match key {
            ENV_CLIENT_ID => Some("env-id".into()),
            ENV_CLIENT_SECRET => Some("  ".into()),
            _ => None,
        });
        assert_eq!(cfg.hail.client_id, "env-id");
        assert_eq!(cfg.hail.client_secret, "");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.hail.redirect_uri, "http://localhost:8080/hail/callback");
        assert!(cfg.database_url().ends_with("/hail.db"));
    }
}
