use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kira_repo_index::config::{ConfigLoader, ResolvedConfig};
use kira_repo_index::domain::AssignmentMode;
use kira_repo_index::error::KiraError;
use kira_repo_index::filter::PublicationFilter;
use kira_repo_index::identity::IdentityResolver;
use kira_repo_index::idservice::{DonorRegistry, HttpIdentityClient, IdentityService, OfflineIdentity};
use kira_repo_index::output::{JsonOutput, OutputMode, TextOutput};
use kira_repo_index::pipeline::{Pipeline, ProgressSink, RunOptions};
use kira_repo_index::publish::IndexPublisher;
use kira_repo_index::report::{
    EXIT_CONFIG, EXIT_PUBLISH, LogNotifier, Notifier, Notifiers, WebhookNotifier, write_report,
};
use kira_repo_index::search::{ElasticsearchClient, IndexClient, MemoryIndexClient};
use kira_repo_index::source::{Archive, DefaultFetcher};

#[derive(Parser)]
#[command(name = "kira-repo")]
#[command(about = "Reconcile archive file metadata and publish the repository search index")]
#[command(version, author)]
struct Cli {
    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Extract, reconcile and publish a new index generation")]
    Run(RunArgs),
    #[command(about = "List index generations, newest first")]
    Generations,
    #[command(about = "Delete old index generations")]
    Prune(PruneArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Read-only identity assignment and an in-memory index.
    #[arg(long)]
    dry_run: bool,

    /// Only extract these archive codes.
    #[arg(long = "only", value_name = "CODE")]
    only: Vec<String>,

    /// Write the run report to this path.
    #[arg(long)]
    report: Option<String>,
}

#[derive(Args)]
struct PruneArgs {
    /// Generations to keep; defaults to the configured retention.
    #[arg(long)]
    keep: Option<usize>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(kira) = report.downcast_ref::<KiraError>() {
                return ExitCode::from(map_exit_code(kira));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidConfig(_)
        | KiraError::InvalidProvenance(_) => EXIT_CONFIG,
        KiraError::IndexHttp(_) | KiraError::IndexStatus { .. } => EXIT_PUBLISH,
        _ => 1,
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_index(args, resolved, output_mode),
        Commands::Generations => {
            let client = ElasticsearchClient::new(&resolved.index.url)?;
            let publisher = IndexPublisher::new(&client, resolved.index.clone());
            let generations = publisher.list_generations()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_generations(&generations),
                OutputMode::Text => TextOutput::print_generations(&generations),
            }
            .into_diagnostic()?;
            Ok(0)
        }
        Commands::Prune(args) => {
            let client = ElasticsearchClient::new(&resolved.index.url)?;
            let retain = args.keep.unwrap_or(resolved.index.retain);
            let publisher = IndexPublisher::new(&client, resolved.index.clone());
            let outcome = publisher.prune_only(retain)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_prune(&outcome),
                OutputMode::Text => TextOutput::print_prune(&outcome),
            }
            .into_diagnostic()?;
            Ok(if outcome.failures.is_empty() { 0 } else { 1 })
        }
    }
}

fn run_index(args: RunArgs, resolved: ResolvedConfig, output_mode: OutputMode) -> miette::Result<u8> {
    let mode = if args.dry_run {
        AssignmentMode::ReadOnly
    } else {
        resolved.identity.mode
    };
    info!(?mode, dry_run = args.dry_run, sources = resolved.sources.len(), "starting run");

    match resolved.identity.url.as_deref() {
        Some(url) => {
            let client = HttpIdentityClient::new(
                url,
                resolved.identity.barcode_url.as_deref(),
                resolved.identity.token.as_deref(),
            )?;
            let resolver = IdentityResolver::new(client.clone(), client, mode)
                .with_barcode_projects(resolved.identity.barcode_projects.clone());
            run_with_index(args, &resolved, &resolver, output_mode)
        }
        None => {
            let resolver = IdentityResolver::new(OfflineIdentity, OfflineIdentity, mode)
                .with_barcode_projects(resolved.identity.barcode_projects.clone());
            run_with_index(args, &resolved, &resolver, output_mode)
        }
    }
}

fn run_with_index<S: IdentityService, D: DonorRegistry>(
    args: RunArgs,
    resolved: &ResolvedConfig,
    resolver: &IdentityResolver<S, D>,
    output_mode: OutputMode,
) -> miette::Result<u8> {
    if args.dry_run {
        let client = MemoryIndexClient::new();
        execute(args, resolved, resolver, &client, output_mode)
    } else {
        let client = ElasticsearchClient::new(&resolved.index.url)?;
        execute(args, resolved, resolver, &client, output_mode)
    }
}

fn execute<S: IdentityService, D: DonorRegistry, C: IndexClient>(
    args: RunArgs,
    resolved: &ResolvedConfig,
    resolver: &IdentityResolver<S, D>,
    client: &C,
    output_mode: OutputMode,
) -> miette::Result<u8> {
    let fetcher = DefaultFetcher::new()?;
    let archives = resolved.sources.iter().map(Archive::manifest).collect::<Vec<_>>();

    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(url) = &resolved.webhook_url {
        notifiers.push(Box::new(WebhookNotifier::new(url)?));
    }
    let notifier = Notifiers(notifiers);

    let pipeline = Pipeline::new(
        &fetcher,
        resolver,
        PublicationFilter::new(resolved.policy.clone()),
        IndexPublisher::new(client, resolved.index.clone()),
        &notifier,
    );
    let options = RunOptions {
        only: args.only,
        dry_run: args.dry_run,
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TextOutput,
    };
    let report = pipeline.run(&archives, &options, sink);

    let report_path = args
        .report
        .map(camino::Utf8PathBuf::from)
        .or_else(|| resolved.report_path.clone());
    if let Some(path) = report_path {
        write_report(&report, &path)?;
    }

    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report),
        OutputMode::Text => TextOutput::print_report(&report),
    }
    .into_diagnostic()?;
    Ok(report.exit_code())
}
