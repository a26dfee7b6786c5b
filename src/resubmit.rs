//! Resubmission Engine: rebuild every chain of a root request from its
//! current template and inject it again.
//!
//! Order of work for one root: check it is a root, resolve each chain's
//! reservation target, cascade-invalidate with chains kept, bring the root
//! back to an approvable state, reserve, then inject.
use crate::chain;
use crate::errors::{PreconditionError, TransitionError};
use crate::gateway::{self, ObjectGateway, ObjectKind};
use crate::invalidate::{CascadeOptions, InvalidationEngine};
use crate::model::{ApprovalState, ChainedCampaign, ChainedRequest, Request};
use anyhow::{anyhow, Result};
use std::thread;
use std::time::Duration;

pub const DEFAULT_DATATIER: &str = "nanoaod";
pub const DEFAULT_CAMPAIGN_PREFIX: &str = "Run";

/// Message of the benign race where a root was submitted concurrently.
pub const ILLEGAL_APPROVAL_STEP_5: &str = "Illegal Approval Step: 5";

/// What to do when a chain's template has no campaign for the data tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatatierPolicy {
    #[default]
    Strict,
    /// Reserve up to the template's last campaign instead.
    FallbackToLastCampaign,
}

#[derive(Debug, Clone)]
pub struct ResubmitOptions {
    pub datatier: String,
    pub tracking_tag: Option<String>,
    pub datatier_policy: DatatierPolicy,
}

impl Default for ResubmitOptions {
    fn default() -> Self {
        Self {
            datatier: DEFAULT_DATATIER.to_string(),
            tracking_tag: None,
            datatier_policy: DatatierPolicy::default(),
        }
    }
}

/// Bounds of the approve-until loop.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalPolicy {
    pub attempts: u32,
    /// Pause between attempts; zero re-checks immediately.
    pub poll: Duration,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            poll: Duration::ZERO,
        }
    }
}

/// How the root request was brought back to an approvable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootReset {
    /// Done root whose outputs are all kept; reused as-is.
    KeepsOutput,
    /// Done root reset, invalidated and forced to approve/approved with its
    /// previous validation re-attached.
    FullReset { announced: usize },
    /// Soft reset straight to approve/approved.
    SoftReset,
}

impl RootReset {
    pub fn label(&self) -> &'static str {
        match self {
            RootReset::KeepsOutput => "keeps-output",
            RootReset::FullReset { .. } => "full-reset",
            RootReset::SoftReset => "soft-reset",
        }
    }
}

pub struct Resubmitter<'a> {
    gateway: &'a dyn ObjectGateway,
    invalidator: InvalidationEngine<'a>,
    campaign_prefix: String,
    approval: ApprovalPolicy,
}

impl<'a> Resubmitter<'a> {
    pub fn new(gateway: &'a dyn ObjectGateway) -> Self {
        Self {
            gateway,
            invalidator: InvalidationEngine::new(gateway),
            campaign_prefix: DEFAULT_CAMPAIGN_PREFIX.to_string(),
            approval: ApprovalPolicy::default(),
        }
    }

    pub fn with_campaign_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.campaign_prefix = prefix.into();
        self
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval = policy;
        self
    }

    /// Recreate and reinject every chain containing `root_prepid`.
    pub fn resubmit_chain_request(
        &self,
        root_prepid: &str,
        options: &ResubmitOptions,
    ) -> Result<()> {
        self.ensure_root(root_prepid)?;

        let chains = chain::chains_containing(self.gateway, root_prepid)?;
        let chain_ids: Vec<String> = chains.iter().map(|c| c.prepid.clone()).collect();
        tracing::info!(
            root = root_prepid,
            chains = %chain_ids.join(", "),
            datatier = %options.datatier,
            "resubmitting chained requests"
        );
        for chain in &chains {
            let target = self.resolve_target(chain, options)?;
            tracing::debug!(chain = %chain.prepid, target = %target, "reservation target");
        }

        self.tear_down(root_prepid, &chains)?;

        let reset = self.reset_root_to_approvable(root_prepid)?;
        tracing::info!(root = root_prepid, reset = reset.label(), "root request ready");
        if let Some(tag) = options.tracking_tag.as_deref() {
            self.include_tag(root_prepid, tag)?;
        }

        for chain_prepid in &chain_ids {
            self.reserve(chain_prepid, options)?;
        }
        for chain_prepid in &chain_ids {
            self.inject(chain_prepid, &reset)?;
        }
        tracing::info!(root = root_prepid, chains = chain_ids.len(), "resubmission finished");
        Ok(())
    }

    fn ensure_root(&self, prepid: &str) -> Result<Request> {
        let request: Request = gateway::fetch_required(self.gateway, ObjectKind::Requests, prepid)?;
        if !request.is_root() {
            return Err(PreconditionError::new(
                prepid,
                format!("not a root request (type {:?})", request.request_type),
            )
            .into());
        }
        Ok(request)
    }

    /// Cascade-invalidate with chains kept, surfacing a per-root failure.
    fn tear_down(&self, root_prepid: &str, chains: &[ChainedRequest]) -> Result<()> {
        let report = self
            .invalidator
            .invalidate_delete_cascade(&[root_prepid.to_string()], &CascadeOptions::default());
        if report.failed.iter().any(|id| id == root_prepid) {
            return Err(anyhow!(
                "cascade invalidation failed for {root_prepid}; re-run once the cause is fixed"
            ));
        }
        if report.filtered.iter().any(|id| id == root_prepid) {
            if let Some(extended) = chains.iter().find(|chain| chain.chain.len() > 1) {
                return Err(PreconditionError::new(
                    root_prepid,
                    format!(
                        "root has no validation results but {} still holds {} stages",
                        extended.prepid,
                        extended.chain.len() - 1
                    ),
                )
                .into());
            }
            tracing::info!(root = root_prepid, "no stages to tear down");
        }
        Ok(())
    }

    /// Bring the root to approve/approved (or keep it when its output stays
    /// valid).
    pub fn reset_root_to_approvable(&self, root_prepid: &str) -> Result<RootReset> {
        let request: Request =
            gateway::fetch_required(self.gateway, ObjectKind::Requests, root_prepid)?;
        if request.state() != ApprovalState::submit_done() {
            let envelope = self.gateway.soft_reset(root_prepid)?;
            gateway::require(envelope, root_prepid, "soft_reset")?;
            return Ok(RootReset::SoftReset);
        }

        let keep_output = match request.keep_output.as_deref() {
            Some(flags) if !flags.is_empty() => flags,
            _ => {
                return Err(PreconditionError::new(root_prepid, "keep_output is not defined").into())
            }
        };
        if keep_output.iter().all(|kept| *kept) {
            return Ok(RootReset::KeepsOutput);
        }

        tracing::warn!(
            root = root_prepid,
            "root request is done; resetting it, announcing its invalidation, then approving"
        );
        if !request.has_validation_results() {
            return Err(
                PreconditionError::new(root_prepid, "validation results not available").into(),
            );
        }
        let validation = request.validation.clone();

        let envelope = self.gateway.reset(root_prepid)?;
        gateway::require(envelope, root_prepid, "reset")?;
        let announced = self.invalidator.announce_invalidations(&[root_prepid.to_string()])?;

        let mut request: Request =
            gateway::fetch_required(self.gateway, ObjectKind::Requests, root_prepid)?;
        request.validation = validation;
        request.set_state(&ApprovalState::approve_approved());
        gateway::store(self.gateway, ObjectKind::Requests, root_prepid, &request)?;
        Ok(RootReset::FullReset { announced })
    }

    /// Append `tag` to the request's tags unless it is already there.
    fn include_tag(&self, prepid: &str, tag: &str) -> Result<()> {
        let mut request: Request =
            gateway::fetch_required(self.gateway, ObjectKind::Requests, prepid)?;
        if request.tags.iter().any(|existing| existing == tag) {
            tracing::debug!(prepid, tag, "tracking tag already present");
            return Ok(());
        }
        request.tags.push(tag.to_string());
        gateway::store(self.gateway, ObjectKind::Requests, prepid, &request)?;
        tracing::info!(prepid, tag, "tracking tag added");
        Ok(())
    }

    fn resolve_target(&self, chain: &ChainedRequest, options: &ResubmitOptions) -> Result<String> {
        let template = chain::template_of(self.gateway, chain)?;
        self.target_in(&template, options)
    }

    fn target_in(&self, template: &ChainedCampaign, options: &ResubmitOptions) -> Result<String> {
        if let Some(found) =
            chain::target_campaign_for(template, &options.datatier, &self.campaign_prefix)
        {
            return Ok(found);
        }
        if options.datatier_policy == DatatierPolicy::FallbackToLastCampaign {
            if let Some(last) = chain::last_campaign(template) {
                tracing::warn!(
                    template = %template.prepid,
                    datatier = %options.datatier,
                    campaign = %last,
                    "no campaign for the data tier, reserving the whole template"
                );
                return Ok(last);
            }
        }
        Err(PreconditionError::new(
            &template.prepid,
            format!(
                "no campaign for data tier {:?} (prefix {:?}) to reserve up to",
                options.datatier, self.campaign_prefix
            ),
        )
        .into())
    }

    /// Recreate the chain's stages from its template up to the data tier.
    fn reserve(&self, chain_prepid: &str, options: &ResubmitOptions) -> Result<()> {
        let chain: ChainedRequest =
            gateway::fetch_required(self.gateway, ObjectKind::ChainedRequests, chain_prepid)?;
        let target = self.resolve_target(&chain, options)?;
        tracing::info!(chain = chain_prepid, target = %target, "reserving chained request");
        let envelope = self.gateway.reserve(chain_prepid, &target)?;
        gateway::require(envelope, chain_prepid, "reserve")?;
        Ok(())
    }

    fn inject(&self, chain_prepid: &str, reset: &RootReset) -> Result<()> {
        let chain: ChainedRequest =
            gateway::fetch_required(self.gateway, ObjectKind::ChainedRequests, chain_prepid)?;
        match reset {
            RootReset::KeepsOutput => {
                let envelope = self.gateway.flow(chain_prepid, false)?;
                gateway::require(envelope, chain_prepid, "flow")?;
                tracing::info!(chain = chain_prepid, "flowed on the kept root output");
            }
            RootReset::FullReset { .. } | RootReset::SoftReset => {
                let root = chain
                    .root()
                    .ok_or_else(|| PreconditionError::new(chain_prepid, "chain is empty"))?;
                for prepid in chain.non_root() {
                    self.approve_until(prepid, &ApprovalState::approve_approved())?;
                }
                tracing::info!(chain = chain_prepid, root, "injecting chained request");
                self.approve_until(root, &ApprovalState::submit_submitted())?;
            }
        }
        Ok(())
    }

    /// Call `approve()` until the request reaches `target`.
    pub fn approve_until(&self, prepid: &str, target: &ApprovalState) -> Result<()> {
        let request: Request = gateway::fetch_required(self.gateway, ObjectKind::Requests, prepid)?;
        let is_root = request.is_root();
        let attempts = self.approval.attempts.max(1);
        for attempt in 1..=attempts {
            let request: Request =
                gateway::fetch_required(self.gateway, ObjectKind::Requests, prepid)?;
            let current = request.state();
            if current == *target {
                tracing::debug!(prepid, state = %current, "target state reached");
                return Ok(());
            }
            let envelope = self.gateway.approve(ObjectKind::Requests, prepid)?;
            if !envelope.succeeded() {
                if is_root && envelope.message().contains(ILLEGAL_APPROVAL_STEP_5) {
                    tracing::info!(prepid, "root already advanced concurrently");
                    return Ok(());
                }
                return Err(TransitionError::new(
                    prepid,
                    "approve",
                    format!("at {current}, aiming for {target}: {}", envelope.describe()),
                )
                .into());
            }
            tracing::debug!(prepid, attempt, from = %current, "approved one step");
            if !self.approval.poll.is_zero() {
                thread::sleep(self.approval.poll);
            }
        }
        Err(TransitionError::new(
            prepid,
            "approve",
            format!("{target} not reached after {attempts} attempts"),
        )
        .into())
    }
}

#[cfg(test)]
#[path = "resubmit_tests.rs"]
mod tests;
