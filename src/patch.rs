//! Campaign-wide resubmission after a template fix: scan campaigns and their
//! requests by condition tag, resolve the chain roots behind the matches and
//! resubmit each root with a tracking tag.
use crate::errors::{precondition_failure, transition_failure};
use crate::gateway::{self, ObjectGateway, ObjectKind};
use crate::model::Request;
use crate::report::BatchReport;
use crate::resubmit::{ResubmitOptions, Resubmitter};
use crate::scan::{self, ConditionFilter};
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct PatchPlan {
    /// Campaign prepid query, `*` wildcards allowed.
    pub campaign_query: String,
    pub filter: ConditionFilter,
    pub resubmit: ResubmitOptions,
    pub limit: Option<usize>,
    /// Dry run unless set.
    pub operate: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct PatchOutcome {
    pub campaigns: Vec<String>,
    pub requests: Vec<String>,
    pub roots: Vec<String>,
    pub report: BatchReport,
}

/// Scan, resolve roots and (when operating) resubmit them one by one.
pub fn run_patch(
    gateway: &dyn ObjectGateway,
    resubmitter: &Resubmitter<'_>,
    plan: &PatchPlan,
) -> Result<PatchOutcome> {
    let mut outcome = PatchOutcome {
        campaigns: scan::campaigns_matching(gateway, &plan.campaign_query, &plan.filter)?,
        ..PatchOutcome::default()
    };
    for campaign in &outcome.campaigns {
        let matched = scan::requests_matching(gateway, campaign, &plan.filter)?;
        outcome.requests.extend(matched);
    }
    outcome.roots = scan::root_candidates(gateway, &outcome.requests)?;
    tracing::info!(
        campaigns = outcome.campaigns.len(),
        requests = outcome.requests.len(),
        roots = outcome.roots.len(),
        operate = plan.operate,
        "patch candidates resolved"
    );
    if !plan.operate {
        return Ok(outcome);
    }

    let total = outcome.roots.len();
    let mut attempted = 0;
    for (index, root) in outcome.roots.iter().enumerate() {
        if plan.limit.is_some_and(|limit| attempted >= limit) {
            tracing::info!(
                limit = plan.limit,
                remaining = total - index,
                "limit reached, stopping"
            );
            break;
        }
        match gateway::fetch::<Request>(gateway, ObjectKind::Requests, root) {
            Ok(Some(request)) if request.is_root() => {}
            Ok(_) => {
                tracing::warn!(root = %root, "chain head is not a root request, skipped");
                outcome.report.filtered.push(root.clone());
                continue;
            }
            Err(err) => {
                tracing::error!(root = %root, error = %format!("{err:#}"), "cannot fetch root");
                outcome.report.failed.push(root.clone());
                continue;
            }
        }
        attempted += 1;
        tracing::info!(root = %root, "({}/{total}) patching root request", index + 1);
        match resubmitter.resubmit_chain_request(root, &plan.resubmit) {
            Ok(()) => outcome.report.success.push(root.clone()),
            Err(err) => {
                let kind = if precondition_failure(&err).is_some() {
                    "precondition"
                } else if transition_failure(&err).is_some() {
                    "transition"
                } else {
                    "transport"
                };
                tracing::error!(root = %root, kind, error = %format!("{err:#}"), "patch failed");
                outcome.report.failed.push(root.clone());
            }
        }
    }
    tracing::info!("{}", outcome.report.summary_line());
    Ok(outcome)
}
