//! Remote object gateway consumed by the engines.
//!
//! The gateway owns transport, paging, retry and credential renewal. Each call
//! either returns a definitive envelope or an error; engines never see partial
//! responses. Mutations are observed by re-fetching, never by trusting a local
//! copy across a state-changing call.
use crate::errors::{PreconditionError, TransitionError};
use crate::model::is_truthy;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub mod http;
#[cfg(test)]
pub mod memory;
pub mod session;

/// Named object collections exposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Requests,
    ChainedRequests,
    ChainedCampaigns,
    Campaigns,
    Invalidations,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Requests => "requests",
            ObjectKind::ChainedRequests => "chained_requests",
            ObjectKind::ChainedCampaigns => "chained_campaigns",
            ObjectKind::Campaigns => "campaigns",
            ObjectKind::Invalidations => "invalidations",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{results, message?}` envelope returned by every mutating endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub results: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn success() -> Self {
        Self {
            results: Value::Bool(true),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            results: Value::Bool(false),
            message: Some(message.into()),
            extra: Map::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        is_truthy(&self.results)
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Short description for error messages: the remote message when present,
    /// the compact envelope otherwise.
    pub fn describe(&self) -> String {
        match self.message.as_deref() {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self.results)),
        }
    }
}

/// Typed get/put/update/delete/approve operations against the service.
pub trait ObjectGateway {
    /// Fetch one record; `None` when absent.
    fn get(&self, kind: ObjectKind, prepid: &str) -> Result<Option<Value>>;

    /// Filtered search, paged until exhausted.
    fn search(&self, kind: ObjectKind, query: &str) -> Result<Vec<Value>>;

    /// Send a document to a collection action (`save`, `update`, `announce`...).
    fn put(&self, kind: ObjectKind, method: &str, body: &Value) -> Result<Envelope>;

    /// Full-document replace.
    fn update(&self, kind: ObjectKind, record: &Value) -> Result<Envelope> {
        self.put(kind, "update", record)
    }

    fn delete(&self, kind: ObjectKind, prepid: &str) -> Result<Envelope>;

    fn approve(&self, kind: ObjectKind, prepid: &str) -> Result<Envelope>;

    /// Full reset: clears validation.
    fn reset(&self, prepid: &str) -> Result<Envelope>;

    /// Soft reset: lands the request in approve/approved, keeping validation.
    fn soft_reset(&self, prepid: &str) -> Result<Envelope>;

    fn rewind_to_root(&self, chain_prepid: &str) -> Result<Envelope>;

    fn flow(&self, chain_prepid: &str, force: bool) -> Result<Envelope>;

    /// Instantiate the chain's missing stages up to `target_campaign`.
    fn reserve(&self, chain_prepid: &str, target_campaign: &str) -> Result<Envelope>;
}

pub fn fetch<T: DeserializeOwned>(
    gateway: &dyn ObjectGateway,
    kind: ObjectKind,
    prepid: &str,
) -> Result<Option<T>> {
    let Some(raw) = gateway.get(kind, prepid)? else {
        return Ok(None);
    };
    let record =
        serde_json::from_value(raw).with_context(|| format!("decode {kind} record {prepid}"))?;
    Ok(Some(record))
}

/// Fetch a record that must exist.
pub fn fetch_required<T: DeserializeOwned>(
    gateway: &dyn ObjectGateway,
    kind: ObjectKind,
    prepid: &str,
) -> Result<T> {
    fetch(gateway, kind, prepid)?
        .ok_or_else(|| PreconditionError::new(prepid, format!("{kind} record not found")).into())
}

pub fn search<T: DeserializeOwned>(
    gateway: &dyn ObjectGateway,
    kind: ObjectKind,
    query: &str,
) -> Result<Vec<T>> {
    gateway
        .search(kind, query)?
        .into_iter()
        .map(|raw| serde_json::from_value(raw).with_context(|| format!("decode {kind} record")))
        .collect()
}

/// Write a record back with a full-document update.
pub fn store<T: Serialize>(
    gateway: &dyn ObjectGateway,
    kind: ObjectKind,
    prepid: &str,
    record: &T,
) -> Result<()> {
    let body = serde_json::to_value(record).with_context(|| format!("encode {kind} {prepid}"))?;
    let envelope = gateway.update(kind, &body)?;
    tracing::debug!(%kind, prepid, ok = envelope.succeeded(), "update");
    require(envelope, prepid, "update")?;
    Ok(())
}

/// Turn a falsy envelope into a [`TransitionError`].
pub fn require(envelope: Envelope, prepid: &str, operation: &'static str) -> Result<Envelope> {
    if envelope.succeeded() {
        return Ok(envelope);
    }
    Err(TransitionError::new(prepid, operation, envelope.describe()).into())
}

/// Delete with the idempotent contract: a refused delete of an object that is
/// already gone counts as done.
pub fn delete_object(gateway: &dyn ObjectGateway, kind: ObjectKind, prepid: &str) -> Result<()> {
    let envelope = gateway.delete(kind, prepid)?;
    if envelope.succeeded() {
        tracing::info!(%kind, prepid, "deleted");
        return Ok(());
    }
    if gateway.get(kind, prepid)?.is_none() {
        tracing::debug!(%kind, prepid, "already deleted");
        return Ok(());
    }
    Err(TransitionError::new(prepid, "delete", envelope.describe()).into())
}
