//! s3-account-finder
//!
//! Command-line entry point: parse flags, resolve AWS config once, run the
//! probe protocol and print the report.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3_account_finder::aws::sdk::{load_sdk_config, SdkIam, SdkStorage, SdkSts};
use s3_account_finder::config::{
    AwsSettings, FinderConfig, ProbeSettings, RetrySettings, DEFAULT_REGION, DEFAULT_ROLE_NAME,
};
use s3_account_finder::{
    collect_candidates, CandidateSource, ConflictPolicy, FileCandidates, ProbeOutcome,
    ProbeProtocol, ProbeReport, ProbeTarget, ResilientExecutor, StaticCandidates, Verdict,
};

/// Keys printed for a granted listing in the text report
const MAX_LISTED_KEYS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Find the AWS account that owns a public S3 bucket
#[derive(Parser, Debug)]
#[command(name = "s3-account-finder", version, about)]
struct Args {
    /// Target as bucket, bucket/prefix or s3://bucket/prefix
    #[arg(long)]
    path: String,

    /// AWS profile to use
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// AWS region for all clients
    #[arg(long, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// Name of the temporary role created in your account
    #[arg(long, default_value = DEFAULT_ROLE_NAME)]
    role_name: String,

    /// Delete an existing role with the same name before starting
    #[arg(long, default_value = "false")]
    delete_existing_role: bool,

    /// Comma separated candidate account IDs
    #[arg(long)]
    candidates: Option<String>,

    /// File with one candidate account ID per line
    #[arg(long)]
    candidates_file: Option<String>,

    /// Abort after this many inconclusive probes in a row (0 = never)
    #[arg(long, default_value = "3")]
    max_inconclusive: usize,

    /// Seconds to wait for IAM changes to propagate
    #[arg(long, default_value = "10")]
    settle_seconds: u64,

    /// Attempts per AWS call, including the first
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Minimum milliseconds between AWS calls
    #[arg(long, default_value = "100")]
    rate_limit_ms: u64,

    /// Debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Report format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,
}

impl Args {
    fn config(&self) -> FinderConfig {
        let on_conflict = if self.delete_existing_role {
            ConflictPolicy::Replace
        } else {
            ConflictPolicy::Fail
        };

        FinderConfig {
            aws: AwsSettings {
                profile: self.profile.clone(),
                region: self.region.clone(),
            },
            retry: RetrySettings {
                max_attempts: self.max_attempts,
                min_call_spacing: Duration::from_millis(self.rate_limit_ms),
                ..RetrySettings::default()
            },
            probe: ProbeSettings::new(&self.role_name)
                .on_conflict(on_conflict)
                .max_consecutive_inconclusive(self.max_inconclusive)
                .settle_delay(Duration::from_secs(self.settle_seconds)),
        }
    }

    fn candidate_sources(&self) -> Vec<Box<dyn CandidateSource>> {
        let mut sources: Vec<Box<dyn CandidateSource>> = Vec::new();
        if let Some(list) = &self.candidates {
            sources.push(Box::new(StaticCandidates::from_list(list)));
        }
        if let Some(path) = &self.candidates_file {
            sources.push(Box::new(FileCandidates::new(path)));
        }
        sources
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs);

    let target = ProbeTarget::parse(&args.path)?;
    let config = args.config();
    let candidates = collect_candidates(&args.candidate_sources())
        .await
        .context("Failed to load candidate account IDs")?;

    info!(
        target = %target,
        candidates = candidates.len(),
        role = %config.probe.identity_name,
        region = %config.aws.region,
        "Starting account probe"
    );

    let sdk_config = load_sdk_config(&config.aws).await;
    let executor = Arc::new(ResilientExecutor::new(config.retry.clone()));
    let mut protocol = ProbeProtocol::new(
        Arc::new(SdkIam::new(&sdk_config)),
        Arc::new(SdkSts::new(&sdk_config)),
        Arc::new(SdkStorage::new(&sdk_config)),
        executor,
        config.probe.clone(),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up before exit");
            on_interrupt.cancel();
        }
    });

    let report = protocol.run(&target, &candidates, &cancel).await;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report.to_json())?),
        OutputFormat::Text => print_text_report(&report),
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_text_report(report: &ProbeReport) {
    println!("[*] Target: {}", report.target);
    println!("[*] Probed {} candidate(s)", report.attempts.len());

    for attempt in &report.attempts {
        let outcome = match &attempt.outcome {
            ProbeOutcome::Granted { keys } => format!("granted ({} objects)", keys.len()),
            ProbeOutcome::Denied => "denied".to_string(),
            ProbeOutcome::Inconclusive { error } => format!("inconclusive: {error}"),
        };
        println!(
            "    {} {} {}",
            attempt.timestamp.to_rfc3339(),
            attempt.candidate_account_id,
            outcome
        );
    }

    match &report.result {
        Ok(Verdict::Confirmed { account_id }) => {
            println!("\n[+] Bucket owner: {account_id}");
            let keys = report.attempts.iter().find_map(|a| match &a.outcome {
                ProbeOutcome::Granted { keys } => Some(keys),
                _ => None,
            });
            if let Some(keys) = keys {
                for key in keys.iter().take(MAX_LISTED_KEYS) {
                    println!("  - {key}");
                }
                if keys.len() > MAX_LISTED_KEYS {
                    println!("  ... and {} more", keys.len() - MAX_LISTED_KEYS);
                }
            }
        }
        Ok(Verdict::Excluded) => {
            println!("\n[-] None of the supplied candidates owns the bucket");
        }
        Ok(Verdict::Inconclusive {
            inconclusive_attempts,
        }) => {
            println!(
                "\n[!] Run inconclusive: {inconclusive_attempts} probe(s) could not be evaluated"
            );
        }
        Err(e) => {
            println!("\n[!] Run failed: {e}");
        }
    }

    if let Some(warning) = &report.teardown_warning {
        println!("\n[!] Warning: {warning}. Delete it manually.");
    }
}
