//! Invalidation Engine: tear every chain of a root request back down to the
//! root, retract what the removed stages produced, and either re-enable the
//! chains or remove them.
//!
//! Each root id is an independent unit of work. A failure aborts the rest of
//! that root's steps, is recorded under `failed`, and the batch moves on.
use crate::chain::{self, ChainMembership};
use crate::errors::PreconditionError;
use crate::gateway::{self, ObjectGateway, ObjectKind};
use crate::model::{ChainedRequest, Invalidation, Request};
use crate::report::BatchReport;
use crate::util::{dedupe_preserving_order, preview_ids};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// What happens to the root request before its chains are deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChainRemovalReset {
    /// Full reset plus announcement of the root's own invalidation.
    #[default]
    Full,
    /// Leave the root untouched; only valid while the root is kept.
    Skip,
}

#[derive(Debug, Clone, Default)]
pub struct CascadeOptions {
    pub remove_root: bool,
    pub remove_chain: bool,
    pub chain_removal_reset: ChainRemovalReset,
    /// Stop after this many roots were attempted.
    pub limit: Option<usize>,
}

impl CascadeOptions {
    /// Removing the root implies removing its chains with a full reset.
    pub fn effective(&self) -> Self {
        let mut options = self.clone();
        if options.remove_root {
            if !options.remove_chain {
                tracing::warn!("removing the root forces removal of its chains");
            }
            options.remove_chain = true;
            options.chain_removal_reset = ChainRemovalReset::Full;
        }
        options
    }
}

pub struct InvalidationEngine<'a> {
    gateway: &'a dyn ObjectGateway,
}

impl<'a> InvalidationEngine<'a> {
    pub fn new(gateway: &'a dyn ObjectGateway) -> Self {
        Self { gateway }
    }

    /// Cascade-invalidate every root in `requests`.
    pub fn invalidate_delete_cascade(
        &self,
        requests: &[String],
        options: &CascadeOptions,
    ) -> BatchReport {
        let options = options.effective();
        let mut report = BatchReport::default();
        let roots = self.filter_roots(requests, &mut report);
        if !report.filtered.is_empty() {
            tracing::info!(
                count = report.filtered.len(),
                ids = %preview_ids(&report.filtered, 10),
                "not valid root requests, skipped"
            );
        }
        if options.remove_chain {
            match options.chain_removal_reset {
                ChainRemovalReset::Full => tracing::warn!(
                    "root requests will be fully reset and their output invalidated"
                ),
                ChainRemovalReset::Skip => {
                    tracing::warn!("chains will be deleted without resetting their root")
                }
            }
        }

        let total = roots.len();
        let mut attempted = 0;
        for (index, root) in roots.iter().enumerate() {
            if options.limit.is_some_and(|limit| attempted >= limit) {
                tracing::info!(
                    limit = options.limit,
                    remaining = total - index,
                    "limit reached, stopping"
                );
                break;
            }
            attempted += 1;
            tracing::info!(root = %root, "({}/{total}) processing root request", index + 1);
            match self.invalidate_root(root, &options) {
                Ok(()) => report.success.push(root.clone()),
                Err(err) => {
                    tracing::error!(root = %root, error = %format!("{err:#}"), "cascade failed");
                    report.failed.push(root.clone());
                }
            }
        }
        tracing::info!("{}", report.summary_line());
        report
    }

    /// Keep validated root requests; everything else lands in `filtered`,
    /// or in `failed` when it could not even be fetched.
    fn filter_roots(&self, requests: &[String], report: &mut BatchReport) -> Vec<String> {
        let mut roots = Vec::new();
        for prepid in dedupe_preserving_order(requests.iter().map(|id| id.trim().to_string())) {
            if prepid.is_empty() {
                continue;
            }
            match gateway::fetch::<Request>(self.gateway, ObjectKind::Requests, &prepid) {
                Ok(Some(request)) if request.is_root() && request.has_validation_results() => {
                    roots.push(prepid)
                }
                Ok(_) => report.filtered.push(prepid),
                Err(err) => {
                    tracing::error!(
                        prepid = %prepid,
                        error = %format!("{err:#}"),
                        "cannot fetch request"
                    );
                    report.failed.push(prepid);
                }
            }
        }
        roots
    }

    /// Run the full cascade for a single root.
    pub fn invalidate_root(&self, root: &str, options: &CascadeOptions) -> Result<()> {
        let options = options.effective();
        tracing::info!(
            root,
            remove_root = options.remove_root,
            remove_chain = options.remove_chain,
            "invalidating root request"
        );
        let chains = self.discover(root)?;
        tracing::info!(
            root,
            chains = %chains.iter().map(|c| c.prepid.as_str()).collect::<Vec<_>>().join(", "),
            "operating chains (deepest first)"
        );

        for chain in &chains {
            self.set_flag(&chain.prepid, false)?;
        }

        for chain in &chains {
            self.rewind(&chain.prepid)?;
        }
        let stages = dedupe_preserving_order(
            chains
                .iter()
                .flat_map(|chain| chain.non_root().iter().cloned()),
        );
        self.announce_invalidations(&stages)
            .with_context(|| format!("invalidate stages of {root}"))?;
        self.delete_stages(&chains)?;

        if options.remove_chain {
            if options.chain_removal_reset == ChainRemovalReset::Full {
                tracing::warn!(root, "full reset of the root request");
                let envelope = self.gateway.reset(root)?;
                gateway::require(envelope, root, "reset")?;
                self.announce_invalidations(&[root.to_string()])?;
            }
            for chain in &chains {
                gateway::delete_object(self.gateway, ObjectKind::ChainedRequests, &chain.prepid)?;
            }
        } else {
            for chain in &chains {
                self.set_flag(&chain.prepid, true)?;
            }
        }

        if options.remove_root {
            gateway::delete_object(self.gateway, ObjectKind::Requests, root)?;
        }
        Ok(())
    }

    /// Delete the non-root stages of every chain, successors first. Each chain
    /// is walked in reverse; a stage still held by a chain not walked yet is
    /// left for that chain, so branches are removed before the stage they
    /// share.
    fn delete_stages(&self, chains: &[ChainedRequest]) -> Result<()> {
        let mut deleted = BTreeSet::new();
        for (index, chain) in chains.iter().enumerate() {
            let later = &chains[index + 1..];
            for prepid in chain.non_root().iter().rev() {
                if deleted.contains(prepid) {
                    continue;
                }
                if later.iter().any(|other| other.non_root().contains(prepid)) {
                    tracing::debug!(
                        prepid = %prepid,
                        chain = %chain.prepid,
                        "stage shared with a later chain, deferred"
                    );
                    continue;
                }
                gateway::delete_object(self.gateway, ObjectKind::Requests, prepid)
                    .with_context(|| format!("delete stage of {}", chain.prepid))?;
                deleted.insert(prepid.clone());
            }
        }
        Ok(())
    }

    /// Chains rooted at `root`, deepest first, after checking the family is
    /// consistent.
    fn discover(&self, root: &str) -> Result<Vec<ChainedRequest>> {
        let membership =
            ChainMembership::from_chains(chain::chains_containing(self.gateway, root)?);
        let misplaced = membership.chains_not_rooted_at(root);
        if !misplaced.is_empty() {
            let ids: Vec<&str> = misplaced.iter().map(|c| c.prepid.as_str()).collect();
            return Err(PreconditionError::new(
                root,
                format!("root request appears past index 0 in {}", ids.join(", ")),
            )
            .into());
        }
        membership.shared_second_stage(root)?;
        if membership.is_empty() {
            tracing::warn!(root, "no chains contain this root request");
        }
        tracing::debug!(root, chains = membership.len(), "chain family discovered");
        let chains = membership.operable_chains(root);
        for chain in chains.iter().filter(|chain| chain.chain.len() == 1) {
            tracing::warn!(root, chain = %chain.prepid, "chain only holds the root request");
        }
        Ok(chains)
    }

    /// Re-fetch the chain, set its flag explicitly and write it back.
    fn set_flag(&self, chain_prepid: &str, flag: bool) -> Result<()> {
        let mut chain: ChainedRequest =
            gateway::fetch_required(self.gateway, ObjectKind::ChainedRequests, chain_prepid)?;
        chain.action_parameters.flag = flag;
        gateway::store(self.gateway, ObjectKind::ChainedRequests, chain_prepid, &chain)?;
        tracing::info!(chain = chain_prepid, flag, "chain flag set");
        Ok(())
    }

    fn rewind(&self, chain_prepid: &str) -> Result<()> {
        let envelope = self.gateway.rewind_to_root(chain_prepid)?;
        gateway::require(envelope, chain_prepid, "rewind_to_root")?;
        tracing::info!(chain = chain_prepid, "rewound to root");
        Ok(())
    }

    /// Announce every pending invalidation record of `prepids` in one batch.
    /// Returns how many records were announced.
    pub fn announce_invalidations(&self, prepids: &[String]) -> Result<usize> {
        let mut ids = Vec::new();
        for prepid in prepids {
            let pending: Vec<Invalidation> = gateway::search(
                self.gateway,
                ObjectKind::Invalidations,
                &format!("prepid={prepid}&status=new"),
            )?;
            ids.extend(pending.into_iter().filter_map(|record| record.id));
        }
        if ids.is_empty() {
            tracing::debug!(requests = %preview_ids(prepids, 5), "no pending invalidations");
            return Ok(0);
        }
        let body = Value::from(ids.clone());
        let envelope = self.gateway.put(ObjectKind::Invalidations, "announce", &body)?;
        gateway::require(envelope, &prepids.join(","), "announce")?;
        tracing::info!(
            count = ids.len(),
            requests = %preview_ids(prepids, 5),
            "invalidations announced"
        );
        Ok(ids.len())
    }
}

#[cfg(test)]
#[path = "invalidate_tests.rs"]
mod tests;
