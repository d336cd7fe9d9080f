//! `hackscan` command line
//!
//! Submits one repository, follows the job until it finishes and prints the
//! report as JSON on stdout. Logs and progress go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hackscan_core::prelude::*;
use hackscan_core::{GitRepositoryProvider, InMemoryPatternMemory, JobRecord, SandboxProvider};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "hackscan")]
#[command(about = "Score sponsor integrations in hackathon repositories", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a repository and print the report
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Repository URL, or a local path
    repo_url: String,

    /// Team name
    #[arg(long)]
    team: String,

    /// Project name
    #[arg(long)]
    project: String,

    /// Branch to analyze (default branch when omitted)
    #[arg(long)]
    branch: Option<String>,

    /// Team member, repeatable
    #[arg(long = "member", value_name = "NAME[:EMAIL]")]
    members: Vec<String>,

    /// Pipeline configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the project in a local sandbox to verify integrations
    #[arg(long)]
    execute: bool,

    /// Directory for published reports
    #[arg(long, default_value = "reports")]
    out: PathBuf,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
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

fn parse_member(raw: &str) -> TeamMember {
    match raw.split_once(':') {
        Some((name, email)) if !email.trim().is_empty() => TeamMember::new(name.trim()).with_email(email.trim()),
        Some((name, _)) => TeamMember::new(name.trim()),
        None => TeamMember::new(raw.trim()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("encoding report")?;
    let mut stdout = std::io::stdout().lock();
    if let Err(err) = writeln!(stdout, "{text}").and_then(|()| stdout.flush()) {
        if err.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(err.into());
        }
    }
    Ok(())
}

async fn follow(pipeline: &AnalysisPipeline, job_id: JobId) -> Result<JobRecord> {
    let mut last_progress: Option<String> = None;
    loop {
        let record = pipeline.status(&job_id).await?;
        if record.progress != last_progress {
            if let Some(progress) = &record.progress {
                eprintln!("[{}] {progress}", record.status);
            }
            last_progress.clone_from(&record.progress);
        }
        if record.status.is_terminal() {
            return Ok(record);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn analyze(args: AnalyzeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    }
    .apply_env_overrides()?;
    if args.execute {
        config = config.with_execution(true);
    }
    tracing::debug!(?config, "configuration loaded");

    let reasoner = AnthropicReasoner::from_env().context("configuring the reasoning provider")?;
    let local: Arc<dyn SandboxProvider> = Arc::new(LocalSandbox::new());
    let sandbox = FallbackSandbox::new(vec![local]).with_liveness_timeout(config.timeouts.liveness());
    let pipeline = AnalysisPipeline::builder(config)
        .repositories(Arc::new(AutoRepositoryProvider::new(GitRepositoryProvider::new())))
        .reasoner(Arc::new(reasoner))
        .sandbox(Arc::new(sandbox))
        .memory(Arc::new(InMemoryPatternMemory::new()))
        .publisher(Arc::new(JsonFilePublisher::new(&args.out)))
        .build()?;

    let mut request = AnalysisRequest::new(args.repo_url, args.team, args.project);
    if let Some(branch) = args.branch {
        request = request.with_branch(branch);
    }
    for member in &args.members {
        request = request.with_member(parse_member(member));
    }

    match pipeline.submit(request).await? {
        Submission::Cached(result) => {
            eprintln!("served from cache");
            print_json(&result)
        }
        Submission::Queued(job_id) => {
            eprintln!("job {job_id} queued");
            let record = follow(&pipeline, job_id).await?;
            if let Some(warning) = &record.warning {
                eprintln!("warning: {warning}");
            }
            match (record.status, record.result) {
                (JobStatus::Complete, Some(result)) => print_json(&result),
                _ => bail!(
                    "job {job_id} failed: {}",
                    record.error.as_deref().unwrap_or("no error recorded")
                ),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Analyze(args) => analyze(args).await,
    }
}
