//! Command runners: turn parsed arguments plus the loaded client config into
//! engine calls against the live service, print the results and pick the
//! process exit code.
use crate::cli::{
    ConditionArgs, InvalidateArgs, PatchArgs, ReportArgs, ResubmitArgs, ScanCampaignsArgs,
    ScanRequestsArgs,
};
use crate::config::{self, ClientConfig, Environment};
use crate::gateway::http::HttpGateway;
use crate::gateway::session::Session;
use crate::invalidate::{CascadeOptions, ChainRemovalReset, InvalidationEngine};
use crate::patch::{self, PatchPlan};
use crate::report::{self, BatchReport};
use crate::resubmit::{DatatierPolicy, ResubmitOptions, Resubmitter};
use crate::scan::{self, ConditionFilter};
use crate::util::{dedupe_preserving_order, preview_ids, read_id_list};
use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::ExitCode;

/// Exit code when the batch ran but some ids failed.
pub const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Load and validate the config, then apply `--prod`.
pub fn load_client_config(path: Option<&Path>, prod: bool) -> Result<ClientConfig> {
    let mut config = config::load_config(path)?;
    if prod {
        config.environment = Environment::Prod;
    }
    Ok(config)
}

pub fn connect(config: &ClientConfig) -> Result<HttpGateway> {
    let session = match config.credential_source() {
        Some(source) => Session::new(source)?,
        None => Session::anonymous(),
    };
    let gateway = HttpGateway::new(config.http_settings(), session);
    tracing::debug!(server = gateway.server(), "gateway ready");
    Ok(gateway)
}

fn resubmitter<'a>(gateway: &'a HttpGateway, config: &ClientConfig) -> Resubmitter<'a> {
    Resubmitter::new(gateway)
        .with_campaign_prefix(config.campaign_prefix.clone())
        .with_approval_policy(config.approval_policy())
}

fn resubmit_options(
    datatier: &str,
    tracking_tag: Option<String>,
    fallback_to_last_campaign: bool,
) -> ResubmitOptions {
    ResubmitOptions {
        datatier: datatier.to_string(),
        tracking_tag,
        datatier_policy: if fallback_to_last_campaign {
            DatatierPolicy::FallbackToLastCampaign
        } else {
            DatatierPolicy::Strict
        },
    }
}

fn condition_filter(args: &ConditionArgs) -> Result<ConditionFilter> {
    ConditionFilter::new(&args.condition, !args.exclude)
}

fn emit_report(batch: &BatchReport, output: &ReportArgs) -> Result<ExitCode> {
    if output.json {
        println!("{}", report::render_json(batch)?);
    } else {
        print!("{}", report::render_text(batch));
    }
    if let Some(path) = output.report.as_deref() {
        report::write_report(path, batch)?;
    }
    Ok(if batch.has_failures() {
        ExitCode::from(EXIT_PARTIAL_FAILURE)
    } else {
        ExitCode::SUCCESS
    })
}

/// Gather `--request` values and the `--requests-file` list, deduplicated.
pub fn collect_requests(args: &InvalidateArgs) -> Result<Vec<String>> {
    let mut ids = args.requests.clone();
    if let Some(path) = args.requests_file.as_deref() {
        ids.extend(read_id_list(path)?);
    }
    let ids = dedupe_preserving_order(ids);
    if ids.is_empty() {
        return Err(anyhow!(
            "no requests given; pass --request or --requests-file"
        ));
    }
    Ok(ids)
}

pub fn cascade_options(args: &InvalidateArgs) -> CascadeOptions {
    CascadeOptions {
        remove_root: args.remove_root,
        remove_chain: args.remove_chain,
        chain_removal_reset: if args.skip_root_reset {
            ChainRemovalReset::Skip
        } else {
            ChainRemovalReset::Full
        },
        limit: args.limit,
    }
}

pub fn run_invalidate(config: &ClientConfig, args: InvalidateArgs) -> Result<ExitCode> {
    let ids = collect_requests(&args)?;
    let options = cascade_options(&args);
    tracing::info!(
        count = ids.len(),
        ids = %preview_ids(&ids, 5),
        remove_chain = options.remove_chain || options.remove_root,
        remove_root = options.remove_root,
        "invalidating chains"
    );
    let gateway = connect(config)?;
    let batch = InvalidationEngine::new(&gateway).invalidate_delete_cascade(&ids, &options);
    emit_report(&batch, &args.output)
}

pub fn run_resubmit(config: &ClientConfig, args: ResubmitArgs) -> Result<ExitCode> {
    let gateway = connect(config)?;
    let options = resubmit_options(
        &args.datatier,
        args.tracking_tag.clone(),
        args.fallback_to_last_campaign,
    );
    resubmitter(&gateway, config).resubmit_chain_request(&args.request, &options)?;
    println!("resubmitted {}", args.request);
    Ok(ExitCode::SUCCESS)
}

fn print_ids(ids: &[String], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(ids)?);
    } else {
        for id in ids {
            println!("{id}");
        }
    }
    Ok(())
}

pub fn run_scan_campaigns(config: &ClientConfig, args: ScanCampaignsArgs) -> Result<ExitCode> {
    let filter = condition_filter(&args.condition)?;
    let gateway = connect(config)?;
    let campaigns = scan::campaigns_matching(&gateway, &args.query, &filter)?;
    tracing::info!(query = %args.query, matched = campaigns.len(), "campaign scan done");
    print_ids(&campaigns, args.json)?;
    Ok(ExitCode::SUCCESS)
}

pub fn run_scan_requests(config: &ClientConfig, args: ScanRequestsArgs) -> Result<ExitCode> {
    let filter = condition_filter(&args.condition)?;
    let gateway = connect(config)?;
    let mut ids = scan::requests_matching(&gateway, &args.campaign, &filter)?;
    tracing::info!(campaign = %args.campaign, matched = ids.len(), "request scan done");
    if args.roots {
        ids = scan::root_candidates(&gateway, &ids)?;
    }
    print_ids(&ids, args.json)?;
    Ok(ExitCode::SUCCESS)
}

pub fn run_patch(config: &ClientConfig, args: PatchArgs) -> Result<ExitCode> {
    let plan = PatchPlan {
        campaign_query: args.campaigns.clone(),
        filter: condition_filter(&args.condition)?,
        resubmit: resubmit_options(
            &args.datatier,
            args.tracking_tag.clone(),
            args.fallback_to_last_campaign,
        ),
        limit: args.limit,
        operate: args.operate,
    };
    let gateway = connect(config)?;
    let outcome = patch::run_patch(&gateway, &resubmitter(&gateway, config), &plan)?;

    if !plan.operate {
        if args.output.json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            println!(
                "dry run: {} campaigns, {} requests, {} roots (pass --operate to resubmit)",
                outcome.campaigns.len(),
                outcome.requests.len(),
                outcome.roots.len()
            );
            for root in &outcome.roots {
                println!("  {root}");
            }
        }
        return Ok(ExitCode::SUCCESS);
    }
    emit_report(&outcome.report, &args.output)
}
