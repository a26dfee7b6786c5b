//! Chain Model: which chains hold a request, how they are ordered, and which
//! template campaign a chain is reserved up to.
use crate::errors::PreconditionError;
use crate::gateway::{self, ObjectGateway, ObjectKind};
use crate::model::{ChainedCampaign, ChainedRequest};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

/// Every chain whose `chain` array contains `prepid`, in service order.
pub fn chains_containing(gateway: &dyn ObjectGateway, prepid: &str) -> Result<Vec<ChainedRequest>> {
    let chains: Vec<ChainedRequest> = gateway::search(
        gateway,
        ObjectKind::ChainedRequests,
        &format!("contains={prepid}"),
    )?;
    tracing::debug!(prepid, found = chains.len(), "chains containing request");
    Ok(chains)
}

/// Deepest (most advanced) chain first; ties keep a stable prepid order.
pub fn sort_deepest_first(chains: &mut [ChainedRequest]) {
    chains.sort_by(|a, b| b.step.cmp(&a.step).then_with(|| a.prepid.cmp(&b.prepid)));
}

/// The chained campaign a chain was instantiated from.
pub fn template_of(gateway: &dyn ObjectGateway, chain: &ChainedRequest) -> Result<ChainedCampaign> {
    if chain.member_of_campaign.is_empty() {
        return Err(PreconditionError::new(&chain.prepid, "chain has no member_of_campaign").into());
    }
    gateway::fetch_required(gateway, ObjectKind::ChainedCampaigns, &chain.member_of_campaign)
}

/// First campaign in the template that starts with `prefix` and mentions
/// `datatier` (case-insensitive).
pub fn target_campaign_for(
    template: &ChainedCampaign,
    datatier: &str,
    prefix: &str,
) -> Option<String> {
    let wanted = datatier.to_lowercase();
    let found = template
        .campaigns
        .iter()
        .flatten()
        .flatten()
        .find(|name| name.starts_with(prefix) && name.to_lowercase().contains(&wanted))
        .cloned();
    if found.is_none() {
        tracing::debug!(
            template = %template.prepid,
            datatier,
            "no campaign matches the data tier"
        );
    }
    found
}

/// Last campaign of the template, used when a data tier is allowed to fall
/// back to the full chain.
pub fn last_campaign(template: &ChainedCampaign) -> Option<String> {
    template.campaign_names().last().map(str::to_string)
}

/// Snapshot of the many-to-many relation between requests and chains.
#[derive(Debug, Default)]
pub struct ChainMembership {
    chains: BTreeMap<String, ChainedRequest>,
    by_request: BTreeMap<String, BTreeSet<String>>,
}

impl ChainMembership {
    pub fn from_chains(chains: impl IntoIterator<Item = ChainedRequest>) -> Self {
        let mut membership = Self::default();
        for chain in chains {
            for prepid in &chain.chain {
                membership
                    .by_request
                    .entry(prepid.clone())
                    .or_default()
                    .insert(chain.prepid.clone());
            }
            membership.chains.insert(chain.prepid.clone(), chain);
        }
        membership
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Chain ids holding `prepid` at any position.
    pub fn chain_ids_of(&self, prepid: &str) -> Vec<&str> {
        self.by_request
            .get(prepid)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Chains rooted at `root`, split into (root only, root plus stages).
    pub fn partition(&self, root: &str) -> (Vec<&ChainedRequest>, Vec<&ChainedRequest>) {
        self.chain_ids_of(root)
            .into_iter()
            .filter_map(|id| self.chains.get(id))
            .filter(|chain| chain.root() == Some(root))
            .partition(|chain| chain.chain.len() == 1)
    }

    /// Chains that hold `prepid` somewhere other than at index 0.
    pub fn chains_not_rooted_at(&self, prepid: &str) -> Vec<&ChainedRequest> {
        self.chain_ids_of(prepid)
            .into_iter()
            .filter_map(|id| self.chains.get(id))
            .filter(|chain| chain.root() != Some(prepid))
            .collect()
    }

    /// Check that every chain extending `root` shares one second stage.
    ///
    /// Returns that stage, or `None` when no chain goes past the root.
    pub fn shared_second_stage(&self, root: &str) -> Result<Option<String>, PreconditionError> {
        let (_, extended) = self.partition(root);
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for chain in &extended {
            if let Some(second) = chain.second_stage() {
                groups.entry(second).or_default().push(&chain.prepid);
            }
        }
        match groups.len() {
            0 => Ok(None),
            1 => Ok(groups.into_keys().next().map(str::to_string)),
            _ => {
                let detail = groups
                    .iter()
                    .map(|(second, chains)| format!("{second} <- [{}]", chains.join(", ")))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(PreconditionError::new(
                    root,
                    format!("chains disagree on the second stage: {detail}"),
                ))
            }
        }
    }

    /// Chains rooted at `root`, deepest first.
    pub fn operable_chains(&self, root: &str) -> Vec<ChainedRequest> {
        let (root_only, extended) = self.partition(root);
        let mut chains: Vec<ChainedRequest> =
            extended.into_iter().chain(root_only).cloned().collect();
        sort_deepest_first(&mut chains);
        chains
    }
}

#[cfg(test)]
#[path = "chain_tests.rs"]
mod tests;
