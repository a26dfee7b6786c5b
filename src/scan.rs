//! Campaign/Condition Scanner.
//!
//! Selects campaigns and requests by the condition tag declared in their
//! processing sequences, and maps matched requests to the roots of the chains
//! they belong to.
use crate::chain;
use crate::errors::PreconditionError;
use crate::gateway::{self, ObjectGateway, ObjectKind};
use crate::model::{Campaign, Request};
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

/// Regex over condition tags, keeping or dropping what matches.
#[derive(Debug, Clone)]
pub struct ConditionFilter {
    pattern: Regex,
    include: bool,
}

impl ConditionFilter {
    pub fn new(pattern: &str, include: bool) -> Result<Self> {
        let pattern =
            Regex::new(pattern).with_context(|| format!("compile condition pattern {pattern:?}"))?;
        Ok(Self { pattern, include })
    }

    pub fn include(pattern: &str) -> Result<Self> {
        Self::new(pattern, true)
    }

    pub fn exclude(pattern: &str) -> Result<Self> {
        Self::new(pattern, false)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn includes(&self) -> bool {
        self.include
    }

    /// Include: some bundle matches. Exclude: no bundle matches.
    pub fn accepts<S: AsRef<str>>(&self, conditions: &[S]) -> bool {
        let found = conditions
            .iter()
            .any(|condition| self.pattern.is_match(condition.as_ref()));
        found == self.include
    }
}

/// Condition tag of every sequence bundle of a campaign (`default` variant).
pub fn campaign_conditions(campaign: &Campaign) -> Result<Vec<String>> {
    campaign
        .sequences
        .iter()
        .enumerate()
        .map(|(index, bundle)| {
            condition_of(bundle.get("default").unwrap_or(&Value::Null))
                .ok_or_else(|| missing_conditions(&campaign.prepid, index))
        })
        .collect()
}

/// Condition tag of every sequence of a request.
pub fn request_conditions(request: &Request) -> Result<Vec<String>> {
    request
        .sequences
        .iter()
        .enumerate()
        .map(|(index, sequence)| {
            condition_of(sequence).ok_or_else(|| missing_conditions(&request.prepid, index))
        })
        .collect()
}

fn condition_of(sequence: &Value) -> Option<String> {
    sequence
        .get("conditions")
        .and_then(Value::as_str)
        .filter(|condition| !condition.trim().is_empty())
        .map(str::to_string)
}

fn missing_conditions(prepid: &str, index: usize) -> anyhow::Error {
    PreconditionError::new(prepid, format!("sequence {index} declares no conditions")).into()
}

/// Campaigns selected by a prepid query (`*` wildcards allowed) whose
/// sequences pass `filter`.
pub fn campaigns_matching(
    gateway: &dyn ObjectGateway,
    query: &str,
    filter: &ConditionFilter,
) -> Result<Vec<String>> {
    let campaigns: Vec<Campaign> =
        gateway::search(gateway, ObjectKind::Campaigns, &format!("prepid={query}"))?;
    let mut matched = Vec::new();
    for campaign in &campaigns {
        let conditions = campaign_conditions(campaign)?;
        if filter.accepts(&conditions) {
            matched.push(campaign.prepid.clone());
        }
    }
    tracing::info!(
        query,
        pattern = filter.pattern(),
        include = filter.includes(),
        scanned = campaigns.len(),
        matched = matched.len(),
        "campaigns scanned"
    );
    Ok(matched)
}

/// Requests of `campaign` whose own sequences pass `filter`.
pub fn requests_matching(
    gateway: &dyn ObjectGateway,
    campaign: &str,
    filter: &ConditionFilter,
) -> Result<Vec<String>> {
    let requests: Vec<Request> = gateway::search(
        gateway,
        ObjectKind::Requests,
        &format!("member_of_campaign={campaign}"),
    )?;
    let mut matched = Vec::new();
    for request in &requests {
        let conditions = request_conditions(request)?;
        if filter.accepts(&conditions) {
            matched.push(request.prepid.clone());
        }
    }
    tracing::info!(
        campaign,
        scanned = requests.len(),
        matched = matched.len(),
        "requests scanned"
    );
    Ok(matched)
}

/// Distinct roots (`chain[0]`) of every chain holding one of `requests`, in
/// first-seen order.
pub fn root_candidates(gateway: &dyn ObjectGateway, requests: &[String]) -> Result<Vec<String>> {
    let mut roots = Vec::new();
    for prepid in requests {
        for chain in chain::chains_containing(gateway, prepid)? {
            match chain.root() {
                Some(root) if !roots.iter().any(|known| known == root) => {
                    roots.push(root.to_string())
                }
                Some(_) => {}
                None => tracing::warn!(chain = %chain.prepid, "empty chain ignored"),
            }
        }
    }
    Ok(roots)
}

#[cfg(test)]
#[path = "scan_tests.rs"]
mod tests;
