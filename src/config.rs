//! Client configuration.
//!
//! Loaded from an optional JSON file; every field has a default so a missing
//! default file means a dev-server, cookie-authenticated client.
use crate::gateway::http::{HttpSettings, DEV_SERVER, PROD_SERVER};
use crate::gateway::session::{AuthMethod, CredentialSource};
use crate::resubmit::{ApprovalPolicy, DEFAULT_CAMPAIGN_PREFIX};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const CREDENTIAL_PATH_ENV: &str = "PDMV_COOKIE_PATH";
const CONFIG_DIR_NAME: &str = "mcm-cascade";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub schema_version: u32,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    pub auth: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_command: Option<String>,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
    pub page_size: usize,
    pub campaign_prefix: String,
    pub approval_attempts: u32,
    pub approval_poll_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            environment: Environment::Dev,
            server_url: None,
            auth: AuthMethod::Cookie,
            credential_path: None,
            renew_command: None,
            max_attempts: 3,
            retry_backoff_ms: 500,
            timeout_secs: 60,
            page_size: 50,
            campaign_prefix: DEFAULT_CAMPAIGN_PREFIX.to_string(),
            approval_attempts: 10,
            approval_poll_ms: 0,
        }
    }
}

impl ClientConfig {
    /// Server root, ending with `/`.
    pub fn server(&self) -> String {
        match (&self.server_url, self.environment) {
            (Some(url), _) => url.clone(),
            (None, Environment::Dev) => DEV_SERVER.to_string(),
            (None, Environment::Prod) => PROD_SERVER.to_string(),
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            server: self.server(),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            timeout: Duration::from_secs(self.timeout_secs),
            page_size: self.page_size,
        }
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            attempts: self.approval_attempts,
            poll: Duration::from_millis(self.approval_poll_ms),
        }
    }

    /// Credential location and renewal, or `None` for anonymous access.
    pub fn credential_source(&self) -> Option<CredentialSource> {
        if self.auth == AuthMethod::None {
            return None;
        }
        let path = resolve_credential_path(
            self,
            std::env::var(CREDENTIAL_PATH_ENV).ok(),
            dirs::home_dir(),
        );
        Some(CredentialSource {
            method: self.auth,
            path,
            renew_command: self.renew_command.clone(),
        })
    }
}

/// Configured path, then the environment override, then
/// `~/private/mcm-credential-<environment>`.
pub fn resolve_credential_path(
    config: &ClientConfig,
    env_path: Option<String>,
    home: Option<PathBuf>,
) -> PathBuf {
    if let Some(path) = &config.credential_path {
        return path.clone();
    }
    if let Some(path) = env_path.filter(|path| !path.trim().is_empty()) {
        return PathBuf::from(path);
    }
    home.unwrap_or_else(|| PathBuf::from("."))
        .join("private")
        .join(format!("mcm-credential-{}", config.environment.as_str()))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load the config from `path`, or from the default location when it exists.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => read_config(path)?,
        None => match default_config_path().filter(|path| path.is_file()) {
            Some(path) => read_config(&path)?,
            None => {
                tracing::debug!("no config file, using defaults");
                ClientConfig::default()
            }
        },
    };
    validate_config(&config)?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<ClientConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: ClientConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

pub fn validate_config(config: &ClientConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    if let Some(url) = config.server_url.as_deref() {
        let scheme_ok = url.starts_with("https://") || url.starts_with("http://");
        if !scheme_ok || !url.ends_with('/') {
            return Err(anyhow!(
                "server_url must be an http(s) URL ending with '/' (got {url:?})"
            ));
        }
    }
    for (label, value) in [
        ("max_attempts", u64::from(config.max_attempts)),
        ("approval_attempts", u64::from(config.approval_attempts)),
        ("timeout_secs", config.timeout_secs),
        ("page_size", config.page_size as u64),
    ] {
        if value == 0 {
            return Err(anyhow!("{label} must be greater than zero"));
        }
    }
    if config.campaign_prefix.trim().is_empty() {
        return Err(anyhow!("campaign_prefix must be non-empty"));
    }
    if let Some(command) = config.renew_command.as_deref() {
        let argv = shell_words::split(command)
            .with_context(|| format!("parse renew_command {command:?}"))?;
        if argv.is_empty() {
            return Err(anyhow!("renew_command must name a program"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
