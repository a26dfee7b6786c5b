//! Credential supply for the HTTP gateway.
//!
//! Credentials are produced by external tooling (an SSO cookie generator or a
//! token helper) and stored on disk. The session renders them into a request
//! header and, when the service rejects them, optionally runs the configured
//! renewal command before reloading the file.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Placeholder replaced with the credential path in renewal command arguments.
pub const CREDENTIAL_PATH_PLACEHOLDER: &str = "{credential_path}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    Cookie,
    Token,
}

#[derive(Debug, Clone)]
pub struct CredentialSource {
    pub method: AuthMethod,
    pub path: PathBuf,
    pub renew_command: Option<String>,
}

/// Authenticated session state shared by every gateway call.
#[derive(Debug)]
pub struct Session {
    source: Option<CredentialSource>,
    header: RefCell<Option<(&'static str, String)>>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            source: None,
            header: RefCell::new(None),
        }
    }

    /// Build a session; a credential file that does not exist yet is loaded on
    /// the first renewal instead.
    pub fn new(source: CredentialSource) -> Result<Self> {
        if source.method == AuthMethod::None {
            return Ok(Self::anonymous());
        }
        let header = if source.path.is_file() {
            Some(load_header(source.method, &source.path)?)
        } else {
            tracing::warn!(path = %source.path.display(), "credential file missing");
            None
        };
        Ok(Self {
            source: Some(source),
            header: RefCell::new(header),
        })
    }

    pub fn is_anonymous(&self) -> bool {
        self.source.is_none()
    }

    pub fn auth_header(&self) -> Option<(&'static str, String)> {
        self.header.borrow().clone()
    }

    /// Refresh the credential: run the renewal command if any, then reload.
    pub fn renew(&self) -> Result<()> {
        let Some(source) = &self.source else {
            return Err(anyhow!("anonymous session has no credential to renew"));
        };
        if let Some(command) = source.renew_command.as_deref() {
            run_renew_command(command, &source.path)?;
        }
        let header = load_header(source.method, &source.path)?;
        *self.header.borrow_mut() = Some(header);
        tracing::debug!(path = %source.path.display(), "credential reloaded");
        Ok(())
    }
}

/// Whether a response means the credential was rejected or has expired.
///
/// Expired SSO cookies end on the HTML login page rather than a 401, so an
/// HTML success page from a JSON API counts as a rejection too.
pub fn credential_rejected(status: u16, content_type: Option<&str>) -> bool {
    match status {
        401 | 403 => true,
        200..=299 => content_type.is_some_and(|kind| kind.contains("text/html")),
        _ => false,
    }
}

fn load_header(method: AuthMethod, path: &Path) -> Result<(&'static str, String)> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read credential {}", path.display()))?;
    match method {
        AuthMethod::Cookie => Ok(("Cookie", cookie_header_from_jar(&text)?)),
        AuthMethod::Token => Ok(("Authorization", format!("Bearer {}", token_from_file(&text)?))),
        AuthMethod::None => Err(anyhow!("no credential configured")),
    }
}

/// Render a Netscape-format cookie jar into a `Cookie` header value.
pub fn cookie_header_from_jar(text: &str) -> Result<String> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return Err(anyhow!("malformed cookie jar line: {line:?}"));
        }
        pairs.push(format!("{}={}", fields[5], fields[6]));
    }
    if pairs.is_empty() {
        return Err(anyhow!("cookie jar holds no cookies"));
    }
    Ok(pairs.join("; "))
}

/// Accept either a raw token or a JSON token response.
pub fn token_from_file(text: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value =
            serde_json::from_str(trimmed).context("parse token response JSON")?;
        return ["access_token", "id_token"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|token| token.as_str()))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("token response has neither access_token nor id_token"));
    }
    if trimmed.is_empty() {
        return Err(anyhow!("token file is empty"));
    }
    Ok(trimmed.to_string())
}

fn run_renew_command(command: &str, credential_path: &Path) -> Result<()> {
    let argv = shell_words::split(command)
        .with_context(|| format!("parse renew command {command:?}"))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("renew command is empty"))?;
    let program = which::which(program)
        .with_context(|| format!("locate renew command {program:?}"))?;
    let path_text = credential_path.display().to_string();
    let args: Vec<String> = args
        .iter()
        .map(|arg| arg.replace(CREDENTIAL_PATH_PLACEHOLDER, &path_text))
        .collect();
    tracing::info!(program = %program.display(), "renewing credential");
    let status = Command::new(&program)
        .args(&args)
        .status()
        .with_context(|| format!("spawn {}", program.display()))?;
    if !status.success() {
        return Err(anyhow!("renew command exited with {:?}", status.code()));
    }
    Ok(())
}
