//! CLI argument parsing for the McM cascade operations.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "mcm-cascade",
    version,
    about = "Invalidate and resubmit McM chained requests",
    after_help = "Commands:\n  invalidate --request <prepid>...   Tear down the chains rooted at each request\n  resubmit --request <prepid>        Rebuild and reinject the chains of one root\n  scan campaigns --query <q>         List campaigns by condition tag\n  scan requests --campaign <c>       List requests of a campaign by condition tag\n  patch --campaigns <q>              Resubmit every root behind matching requests\n\nExamples:\n  mcm-cascade invalidate --requests-file roots.txt --remove-chain --report out/invalidate.txt\n  mcm-cascade resubmit --request PPD-Run3Summer22wmLHEGS-00001 --tracking-tag PPD_OPS_GT\n  mcm-cascade scan campaigns --query 'Run3Summer23*' --condition postBPix --exclude\n  mcm-cascade --prod patch --campaigns 'Run3Summer23BPix*' --condition 'realistic_v14' --operate",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Client config JSON (defaults to the per-user config when present)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Target the production server instead of the configured environment
    #[arg(long, global = true)]
    pub prod: bool,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Invalidate(InvalidateArgs),
    Resubmit(ResubmitArgs),
    /// List campaigns or requests by condition tag
    #[command(subcommand)]
    Scan(ScanCommand),
    Patch(PatchArgs),
}

/// Where batch results go.
#[derive(Args, Debug, Clone, Default)]
pub struct ReportArgs {
    /// Print the batch report as JSON
    #[arg(long)]
    pub json: bool,

    /// Also write the batch report to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Invalidate the chains rooted at the given requests")]
pub struct InvalidateArgs {
    /// Root request prepid (repeatable)
    #[arg(long = "request", value_name = "PREPID")]
    pub requests: Vec<String>,

    /// File with one prepid per line; blank lines and '#' comments ignored
    #[arg(long, value_name = "FILE")]
    pub requests_file: Option<PathBuf>,

    /// Delete the root requests too (implies --remove-chain)
    #[arg(long)]
    pub remove_root: bool,

    /// Delete the chained requests after their stages are gone
    #[arg(long)]
    pub remove_chain: bool,

    /// With --remove-chain, leave the root request untouched
    #[arg(long, requires = "remove_chain", conflicts_with = "remove_root")]
    pub skip_root_reset: bool,

    /// Stop after this many roots have been attempted
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    #[command(flatten)]
    pub output: ReportArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Rebuild and reinject the chains of a root request")]
pub struct ResubmitArgs {
    /// Root request prepid
    #[arg(long, value_name = "PREPID")]
    pub request: String,

    /// Data tier the rebuilt chains must reach
    #[arg(long, value_name = "TIER", default_value = "nanoaod")]
    pub datatier: String,

    /// Tag appended to the root request before reinjection
    #[arg(long, value_name = "TAG")]
    pub tracking_tag: Option<String>,

    /// Use the template's last campaign when no campaign matches the tier
    #[arg(long)]
    pub fallback_to_last_campaign: bool,
}

#[derive(Subcommand, Debug)]
pub enum ScanCommand {
    Campaigns(ScanCampaignsArgs),
    Requests(ScanRequestsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConditionArgs {
    /// Regular expression over condition tags
    #[arg(long, value_name = "REGEX")]
    pub condition: String,

    /// Keep the objects where no condition matches
    #[arg(long)]
    pub exclude: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List campaigns whose sequences match a condition pattern")]
pub struct ScanCampaignsArgs {
    /// Campaign prepid query, '*' wildcards allowed
    #[arg(long, value_name = "QUERY")]
    pub query: String,

    #[command(flatten)]
    pub condition: ConditionArgs,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List requests of a campaign whose sequences match a condition pattern")]
pub struct ScanRequestsArgs {
    /// Campaign prepid
    #[arg(long, value_name = "CAMPAIGN")]
    pub campaign: String,

    #[command(flatten)]
    pub condition: ConditionArgs,

    /// Print the roots of the chains holding the matches instead
    #[arg(long)]
    pub roots: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Resubmit every chain root behind requests matching a condition pattern")]
pub struct PatchArgs {
    /// Campaign prepid query, '*' wildcards allowed
    #[arg(long, value_name = "QUERY")]
    pub campaigns: String,

    #[command(flatten)]
    pub condition: ConditionArgs,

    /// Tag appended to every resubmitted root
    #[arg(long, value_name = "TAG")]
    pub tracking_tag: Option<String>,

    /// Data tier the rebuilt chains must reach
    #[arg(long, value_name = "TIER", default_value = "nanoaod")]
    pub datatier: String,

    /// Use the template's last campaign when no campaign matches the tier
    #[arg(long)]
    pub fallback_to_last_campaign: bool,

    /// Stop after this many roots have been attempted
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Resubmit for real; without it only the candidates are listed
    #[arg(long)]
    pub operate: bool,

    #[command(flatten)]
    pub output: ReportArgs,
}
