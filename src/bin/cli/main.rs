//! Binary entry point for the docquery CLI.
//!
//! Loads JSON documents into an in-process partitioned container and runs a
//! query plan over it page by page, printing items, continuation tokens and
//! execution diagnostics.
#![forbid(unsafe_code)]

mod config;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use config::{CliConfig, Profile};
use docquery::memory::{ContainerError, InMemoryContainer, LocalQuery};
use docquery::query::selector::resolve;
use docquery::query::{
    CancelToken, DiagnosticsSnapshot, FeedIterator, PartitionKey, QueryOptions, QueryPlan,
    RetryingFetcher,
};

const DEFAULT_PARTITIONS: usize = 4;
const DEFAULT_PARTITION_KEY_PATH: &str = "pk";

#[derive(Parser, Debug)]
#[command(
    name = "docquery",
    version,
    about = "Run cross-partition queries over a local document set",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "DOCQUERY_CONFIG",
        value_name = "FILE",
        help = "CLI config file with named profiles"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Profile to apply from the config file")]
    profile: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ContainerArgs {
    #[arg(long, value_name = "FILE", help = "Documents as a JSON array or JSON lines")]
    data: PathBuf,

    #[arg(long, value_name = "FILE", help = "Query file: {\"plan\": ..., \"local\": ...}")]
    query: PathBuf,

    #[arg(long, help = "Number of partition ranges")]
    partitions: Option<usize>,

    #[arg(long, value_name = "PATH", help = "Document property holding the partition key")]
    partition_key_path: Option<String>,

    #[arg(long, value_name = "JSON", help = "Restrict the query to one logical partition")]
    partition_key: Option<String>,
}

#[derive(Args, Debug)]
struct RunCmd {
    #[command(flatten)]
    container: ContainerArgs,

    #[arg(long, allow_hyphen_values = true, help = "Items per page (-1 for unbounded)")]
    page_size: Option<i32>,

    #[arg(long, help = "Concurrent range fetches (0 for serial)")]
    max_concurrency: Option<usize>,

    #[arg(long, value_name = "TOKEN", help = "Resume from a continuation token")]
    continuation: Option<String>,

    #[arg(long, help = "Stop after this many pages")]
    pages: Option<usize>,

    #[arg(long, help = "Disable the single-roundtrip path for single-partition queries")]
    no_optimistic: bool,

    #[arg(long, help = "Request index metrics and query advice")]
    index_metrics: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Execute a query and print its pages")]
    Run(RunCmd),

    #[command(about = "Show the pipeline and target ranges a query would use")]
    Explain(ContainerArgs),

    #[command(about = "List profiles from the config file")]
    Profiles,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
struct QueryFile {
    plan: QueryPlan,
    #[serde(default)]
    local: LocalQuery,
}

#[derive(Debug, Serialize)]
struct PageReport {
    items: Vec<Value>,
    continuation: Option<String>,
    request_charge: f64,
    fetch_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    index_metrics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_advice: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    pipeline: Option<String>,
    pages: Vec<PageReport>,
    continuation: Option<String>,
    diagnostics: DiagnosticsSnapshot,
}

#[derive(Debug, Serialize)]
struct ExplainReport {
    pipeline: String,
    targets: Vec<String>,
    ranges: usize,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DOCQUERY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;

    match cli.command {
        Command::Run(cmd) => {
            let profile = config.resolve(cli.profile.as_deref())?;
            let report = run_query(&cmd, profile).await?;
            emit(&cli.format, &report, || print_run_text(&report))?;
        }
        Command::Explain(args) => {
            let profile = config.resolve(cli.profile.as_deref())?;
            let report = explain(&args, profile).await?;
            emit(&cli.format, &report, || print_explain_text(&report))?;
        }
        Command::Profiles => {
            let profiles: Vec<&Profile> = config.profiles().collect();
            emit(&cli.format, &profiles, || {
                if let Some(path) = config.path() {
                    println!("config: {}", path.display());
                }
                for profile in &profiles {
                    let marker = if config.default_profile_name() == Some(profile.name.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {} partitions={} page_size={} max_concurrency={}",
                        profile.name,
                        display_opt(profile.partitions),
                        display_opt(profile.page_size),
                        display_opt(profile.max_concurrency),
                    );
                }
            })?;
        }
    }
    Ok(())
}

fn display_opt<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Input errors raised while preparing a container and query.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Generic error message.
    #[error("{0}")]
    Message(String),
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// File or argument was not valid JSON.
    #[error("{origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    /// Document rejected by the container.
    #[error(transparent)]
    Container(#[from] ContainerError),
}

struct Loaded {
    container: InMemoryContainer,
    plan: QueryPlan,
    local: LocalQuery,
    partition_key: Option<PartitionKey>,
}

fn load(args: &ContainerArgs, profile: Option<&Profile>) -> Result<Loaded, CliError> {
    let partitions = args
        .partitions
        .or_else(|| profile.and_then(|p| p.partitions))
        .unwrap_or(DEFAULT_PARTITIONS);
    if partitions == 0 {
        return Err(CliError::Message("--partitions must be at least 1".into()));
    }
    let key_path = args
        .partition_key_path
        .clone()
        .or_else(|| profile.and_then(|p| p.partition_key_path.clone()))
        .unwrap_or_else(|| DEFAULT_PARTITION_KEY_PATH.to_string());

    let container = InMemoryContainer::new(&key_path, partitions);
    container.extend(read_documents(&args.data)?)?;

    let raw = read_file(&args.query)?;
    let query: QueryFile = serde_json::from_str(&raw).map_err(|source| CliError::Json {
        origin: args.query.display().to_string(),
        source,
    })?;
    let partition_key = args
        .partition_key
        .as_deref()
        .map(|text| serde_json::from_str::<Value>(text).map(PartitionKey))
        .transpose()
        .map_err(|source| CliError::Json {
            origin: "--partition-key".into(),
            source,
        })?;
    Ok(Loaded {
        container,
        plan: query.plan,
        local: query.local,
        partition_key,
    })
}

fn read_file(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_documents(path: &Path) -> Result<Vec<Value>, CliError> {
    let contents = read_file(path)?;
    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(&contents).map_err(|source| CliError::Json {
            origin: path.display().to_string(),
            source,
        });
    }
    let mut documents = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let document = serde_json::from_str(line).map_err(|source| CliError::Json {
            origin: format!("{}:{}", path.display(), line_no + 1),
            source,
        })?;
        documents.push(document);
    }
    Ok(documents)
}

fn build_options(cmd: &RunCmd, profile: Option<&Profile>, partition_key: Option<PartitionKey>) -> QueryOptions {
    let mut options = QueryOptions::default();
    if let Some(size) = cmd.page_size.or_else(|| profile.and_then(|p| p.page_size)) {
        options = options.with_max_item_count(size);
    }
    let concurrency = cmd
        .max_concurrency
        .or_else(|| profile.and_then(|p| p.max_concurrency));
    if concurrency.is_some() {
        options = options.with_max_concurrency(concurrency);
    }
    if let Some(key) = partition_key {
        options = options.with_partition_key(key);
    }
    options.enable_optimistic_direct_execution =
        !cmd.no_optimistic && profile.and_then(|p| p.optimistic).unwrap_or(true);
    options.populate_index_metrics =
        cmd.index_metrics || profile.and_then(|p| p.index_metrics).unwrap_or(false);
    options.with_continuation(cmd.continuation.clone())
}

async fn run_query(cmd: &RunCmd, profile: Option<&Profile>) -> Result<RunReport, Box<dyn Error>> {
    let loaded = load(&cmd.container, profile)?;
    let options = build_options(cmd, profile, loaded.partition_key);
    let fetcher = Arc::new(RetryingFetcher::new(
        loaded.container.query(&loaded.plan, loaded.local),
    ));
    let mut feed = FeedIterator::new(
        loaded.plan,
        options,
        fetcher,
        Arc::new(loaded.container.clone()),
    )?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut pages = Vec::new();
    while feed.has_more_results() && cmd.pages.map_or(true, |limit| pages.len() < limit) {
        let page = feed.read_next_page(&cancel).await?;
        pages.push(PageReport {
            items: page.items,
            continuation: page.continuation,
            request_charge: page.request_charge,
            fetch_count: page.fetch_count,
            index_metrics: page.index_metrics,
            query_advice: page.query_advice,
        });
    }
    watcher.abort();

    Ok(RunReport {
        pipeline: feed.pipeline_kind().map(|kind| kind.to_string()),
        pages,
        continuation: feed.continuation().map(str::to_owned),
        diagnostics: feed.diagnostics().snapshot(),
    })
}

async fn explain(args: &ContainerArgs, profile: Option<&Profile>) -> Result<ExplainReport, Box<dyn Error>> {
    let loaded = load(args, profile)?;
    loaded.plan.validate()?;
    let mut options = QueryOptions::default();
    if let Some(key) = loaded.partition_key {
        options = options.with_partition_key(key);
    }
    options.enable_optimistic_direct_execution = profile.and_then(|p| p.optimistic).unwrap_or(true);
    let resolution = resolve(&loaded.plan, &options, &loaded.container).await?;
    Ok(ExplainReport {
        pipeline: resolution.kind.to_string(),
        targets: resolution
            .targets
            .iter()
            .map(|range| format!("{} {}", range.id, range.span))
            .collect(),
        ranges: loaded.container.ranges().len(),
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_run_text(report: &RunReport) {
    for (index, page) in report.pages.iter().enumerate() {
        for item in &page.items {
            println!("{item}");
        }
        println!(
            "# page {index}: items={} fetches={} charge={:.2}",
            page.items.len(),
            page.fetch_count,
            page.request_charge
        );
        if let Some(advice) = &page.query_advice {
            println!("# advice: {advice}");
        }
    }
    if let Some(pipeline) = &report.pipeline {
        println!("# pipeline: {pipeline}");
    }
    for split in &report.diagnostics.splits {
        println!("# split: {} -> {:?}", split.parent, split.children);
    }
    match &report.continuation {
        Some(token) => println!("# continuation: {token}"),
        None => println!("# done"),
    }
}

fn print_explain_text(report: &ExplainReport) {
    println!("pipeline: {}", report.pipeline);
    println!("targets: {} of {} ranges", report.targets.len(), report.ranges);
    for target in &report.targets {
        println!("  {target}");
    }
}
