//! Typed views over the records stored by the request service.
//!
//! The service is the single source of truth; these types are transient copies
//! that live for one operation. Every record keeps the fields it does not model
//! in `extra` so that a full-document `update` writes them back untouched.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Request type of a chain root (generation stage).
pub const ROOT_REQUEST_TYPE: &str = "LHE";

/// Two-axis approval state advanced by `approve()` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalState {
    pub approval: String,
    pub status: String,
}

impl ApprovalState {
    pub fn new(approval: &str, status: &str) -> Self {
        Self {
            approval: approval.to_string(),
            status: status.to_string(),
        }
    }

    pub fn approve_approved() -> Self {
        Self::new("approve", "approved")
    }

    pub fn submit_submitted() -> Self {
        Self::new("submit", "submitted")
    }

    pub fn submit_done() -> Self {
        Self::new("submit", "done")
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.approval, self.status)
    }
}

/// A single processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub prepid: String,
    #[serde(rename = "type", default)]
    pub request_type: String,
    #[serde(default)]
    pub approval: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub member_of_chain: Vec<String>,
    #[serde(default)]
    pub member_of_campaign: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_output: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sequences: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    pub fn state(&self) -> ApprovalState {
        ApprovalState::new(&self.approval, &self.status)
    }

    pub fn set_state(&mut self, state: &ApprovalState) {
        self.approval = state.approval.clone();
        self.status = state.status.clone();
    }

    pub fn is_root(&self) -> bool {
        self.request_type == ROOT_REQUEST_TYPE
    }

    /// True when the request carries cached validation results.
    pub fn has_validation_results(&self) -> bool {
        self.validation
            .as_ref()
            .and_then(|validation| validation.get("results"))
            .is_some_and(is_truthy)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionParameters {
    #[serde(default)]
    pub flag: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ordered instance of a chained campaign; `chain[0]` is the root request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedRequest {
    pub prepid: String,
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub step: usize,
    #[serde(default)]
    pub action_parameters: ActionParameters,
    #[serde(default)]
    pub member_of_campaign: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChainedRequest {
    pub fn root(&self) -> Option<&str> {
        self.chain.first().map(String::as_str)
    }

    /// Stages after the root, in chain order.
    pub fn non_root(&self) -> &[String] {
        self.chain.get(1..).unwrap_or(&[])
    }

    pub fn second_stage(&self) -> Option<&str> {
        self.chain.get(1).map(String::as_str)
    }
}

/// Chain template: ordered `[campaign, flow]` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedCampaign {
    pub prepid: String,
    #[serde(default)]
    pub campaigns: Vec<Vec<Option<String>>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChainedCampaign {
    /// Campaign names in template order, skipping empty slots.
    pub fn campaign_names(&self) -> impl Iterator<Item = &str> {
        self.campaigns
            .iter()
            .filter_map(|pair| pair.first().and_then(|name| name.as_deref()))
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub prepid: String,
    #[serde(default)]
    pub sequences: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Pending marker that a produced dataset must be retracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invalidation {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub prepid: String,
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// JSON truthiness as the service uses it for `results` fields.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
