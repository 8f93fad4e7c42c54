use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use taxon_enricher::batch::{
    BatchLine, BatchOptions, BatchReport, Pipeline, ProgressSink, ResolveMode, TerminalPolicy,
    backfill_lines, read_batch_file,
};
use taxon_enricher::checkpoint::{Checkpoint, backfill_checkpoint_path};
use taxon_enricher::config::{ConfigLoader, ResolvedConfig};
use taxon_enricher::domain::{BatchEntry, EnrichmentSource, Rank, TaxonId};
use taxon_enricher::enrichers::{
    CommonsClient, DescriptionEnricher, Enricher, EolClient, ImageryEnricher, InatClient,
    IucnClient, OccurrenceEnricher, OccurrenceOptions, StatusEnricher, WikidataClient,
};
use taxon_enricher::error::EnrichError;
use taxon_enricher::fetch::Fetcher;
use taxon_enricher::notify::HttpRevalidator;
use taxon_enricher::output::{JsonOutput, LineProgress, OutputMode, print_summary};
use taxon_enricher::rate_limit::RateLimiter;
use taxon_enricher::store::{SharedStore, SqliteStore, TaxonQuery};
use taxon_enricher::taxonomy::{GbifClient, Resolver};

#[derive(Parser)]
#[command(name = "taxon-enrich")]
#[command(about = "Resolve scientific names and enrich them with status, imagery, text and occurrence data")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// JSON config file (default: ./taxon-enrich.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve names and run every enabled source")]
    Import(ImportArgs),
    #[command(about = "Run a single source against taxa already in the database")]
    Enrich(EnrichArgs),
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ImportTarget {
    #[arg(long)]
    name: Option<String>,

    /// Newline-delimited batch file; `#` starts a comment, `id:<n>` references a stored taxon
    #[arg(long)]
    file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ImportArgs {
    #[command(flatten)]
    target: ImportTarget,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Checkpoint file; always used for --file batches
    #[arg(long)]
    checkpoint: Option<Utf8PathBuf>,

    #[arg(long)]
    skip_status: bool,

    #[arg(long)]
    skip_media: bool,

    #[arg(long)]
    skip_description: bool,

    #[arg(long)]
    skip_occurrence: bool,

    /// Leave permanently failing items out of the checkpoint
    #[arg(long)]
    retry_terminal: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct EnrichTarget {
    #[arg(long)]
    id: Option<TaxonId>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    file: Option<Utf8PathBuf>,

    /// Every stored taxon at --rank
    #[arg(long)]
    all: bool,

    /// Stored taxa at --rank with nothing from this source yet
    #[arg(long)]
    missing: bool,
}

#[derive(Args)]
struct EnrichArgs {
    #[arg(value_enum)]
    source: EnrichmentSource,

    #[command(flatten)]
    target: EnrichTarget,

    /// Rank swept by --all and --missing
    #[arg(long, default_value = "species")]
    rank: Rank,

    /// Maximum taxa taken by --all and --missing
    #[arg(long)]
    limit: Option<usize>,

    /// Taxa skipped before --all and --missing start taking
    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Checkpoint file; defaults to .enrich_<source>_checkpoint.json for --all and --missing
    #[arg(long)]
    checkpoint: Option<Utf8PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Observation pages to fetch (occurrence only)
    #[arg(long)]
    pages: Option<u32>,

    /// Grid cell size in degrees (occurrence only)
    #[arg(long)]
    cell_size: Option<f64>,

    /// Upper bound on collected points (occurrence only)
    #[arg(long)]
    max_points: Option<usize>,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<EnrichError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &EnrichError) -> u8 {
    match error {
        EnrichError::InvalidBatchEntry(_)
        | EnrichError::InvalidRank(_)
        | EnrichError::InvalidTaxonId(_)
        | EnrichError::ConfigRead(_)
        | EnrichError::ConfigParse(_)
        | EnrichError::NoMatch(_)
        | EnrichError::TaxonNotFound(_) => 2,
        EnrichError::Upstream { .. } | EnrichError::Payload { .. } => 3,
        _ => 1,
    }
}

/// Returns false when at least one item failed.
fn run() -> miette::Result<bool> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        resolved.database = db;
    }
    let store: SharedStore = Arc::new(SqliteStore::open(&resolved.database)?);
    let fetcher = build_fetcher(&resolved)?;

    let report = match cli.command {
        Commands::Import(args) => run_import(args, &resolved, fetcher, store, output_mode)?,
        Commands::Enrich(args) => run_enrich(args, resolved, fetcher, store, output_mode)?,
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Interactive => print_summary(&report),
    }
    Ok(!report.has_failures())
}

fn build_fetcher(resolved: &ResolvedConfig) -> Result<Fetcher, EnrichError> {
    let fetcher = Fetcher::http(resolved.timeout, resolved.retry)?;
    Ok(match resolved.rate_limit {
        Some(limit) => {
            fetcher.with_limiter(Arc::new(RateLimiter::new(limit.per_second, limit.burst)?))
        }
        None => fetcher,
    })
}

fn build_enricher(
    source: EnrichmentSource,
    resolved: &ResolvedConfig,
    occurrence: OccurrenceOptions,
    fetcher: &Fetcher,
    store: &SharedStore,
) -> Box<dyn Enricher> {
    let endpoints = &resolved.endpoints;
    match source {
        EnrichmentSource::Status => Box::new(StatusEnricher::new(
            IucnClient::new(
                fetcher.clone(),
                endpoints.iucn.clone(),
                resolved.iucn_token.clone(),
            ),
            store.clone(),
        )),
        EnrichmentSource::Media => Box::new(ImageryEnricher::new(
            CommonsClient::new(fetcher.clone(), endpoints.commons.clone()),
            WikidataClient::new(fetcher.clone(), endpoints.wikidata.clone()),
            store.clone(),
        )),
        EnrichmentSource::Description => Box::new(DescriptionEnricher::new(
            EolClient::new(fetcher.clone(), endpoints.eol.clone()),
            store.clone(),
        )),
        EnrichmentSource::Occurrence => Box::new(OccurrenceEnricher::new(
            InatClient::new(fetcher.clone(), endpoints.inat.clone()),
            store.clone(),
            occurrence,
        )),
    }
}

fn build_pipeline(
    resolved: &ResolvedConfig,
    options: BatchOptions,
    fetcher: &Fetcher,
    store: &SharedStore,
) -> Pipeline<GbifClient> {
    let resolver = Resolver::new(
        GbifClient::new(fetcher.clone(), resolved.endpoints.gbif.clone()),
        store.clone(),
    )
    .with_common_names(resolved.common_names);
    let pipeline = Pipeline::new(resolver, options);
    match &resolved.revalidate {
        Some(target) => pipeline.with_invalidator(Box::new(HttpRevalidator::new(
            fetcher.clone(),
            &target.site_url,
            target.token.clone(),
        ))),
        None => pipeline,
    }
}

fn progress_sink(output_mode: OutputMode) -> Box<dyn ProgressSink> {
    match output_mode {
        OutputMode::NonInteractive => Box::new(JsonOutput),
        OutputMode::Interactive => Box::new(LineProgress),
    }
}

fn run_import(
    args: ImportArgs,
    resolved: &ResolvedConfig,
    fetcher: Fetcher,
    store: SharedStore,
    output_mode: OutputMode,
) -> Result<BatchReport, EnrichError> {
    let (entries, checkpoint_path) = match (args.target.name, args.target.file) {
        (Some(name), _) => (vec![BatchLine::from(name.parse::<BatchEntry>()?)], args.checkpoint),
        (None, Some(file)) => (
            read_batch_file(&file)?,
            Some(args.checkpoint.unwrap_or_else(|| resolved.checkpoint.clone())),
        ),
        (None, None) => return Err(EnrichError::InvalidBatchEntry("no target".to_string())),
    };
    let checkpoint = checkpoint_path.map(Checkpoint::load).transpose()?;
    if let Some(checkpoint) = &checkpoint {
        tracing::info!(path = %checkpoint.path(), done = checkpoint.len(), "checkpoint loaded");
    }

    let options = BatchOptions {
        concurrency: args.concurrency.unwrap_or(resolved.concurrency).max(1),
        terminal_policy: if args.retry_terminal {
            TerminalPolicy::Retry
        } else {
            TerminalPolicy::MarkDone
        },
        failure_delay: resolved.failure_delay,
        resolve_mode: ResolveMode::Authority,
    };

    let skipped = [
        (EnrichmentSource::Status, args.skip_status),
        (EnrichmentSource::Media, args.skip_media),
        (EnrichmentSource::Description, args.skip_description),
        (EnrichmentSource::Occurrence, args.skip_occurrence),
    ];
    let mut pipeline = build_pipeline(resolved, options, &fetcher, &store);
    for (source, skip) in skipped {
        if !skip {
            pipeline = pipeline.with_enricher(build_enricher(
                source,
                resolved,
                resolved.occurrence,
                &fetcher,
                &store,
            ));
        }
    }

    let sink = progress_sink(output_mode);
    Ok(pipeline.run(&entries, checkpoint.as_ref(), sink.as_ref()))
}

fn run_enrich(
    args: EnrichArgs,
    resolved: ResolvedConfig,
    fetcher: Fetcher,
    store: SharedStore,
    output_mode: OutputMode,
) -> Result<BatchReport, EnrichError> {
    let target = args.target;
    let sweep = target.all || target.missing;
    let entries = if sweep {
        let query = TaxonQuery {
            rank: Some(args.rank),
            missing: target.missing.then_some(args.source),
            limit: args.limit,
            offset: args.offset,
        };
        let lines = backfill_lines(store.as_ref(), &query)?;
        tracing::info!(source = %args.source, rank = %args.rank, count = lines.len(), "taxa selected");
        lines
    } else {
        match (target.id, target.name, target.file) {
            (Some(id), _, _) => vec![BatchEntry::Id(id).into()],
            (None, Some(name), _) => vec![name.parse::<BatchEntry>()?.into()],
            (None, None, Some(file)) => read_batch_file(&file)?,
            (None, None, None) => {
                return Err(EnrichError::InvalidBatchEntry("no target".to_string()));
            }
        }
    };
    let checkpoint_path = match args.checkpoint {
        Some(path) => Some(path),
        None if sweep => Some(backfill_checkpoint_path(args.source)),
        None => None,
    };
    let checkpoint = checkpoint_path.map(Checkpoint::load).transpose()?;
    if let Some(checkpoint) = &checkpoint {
        tracing::info!(path = %checkpoint.path(), done = checkpoint.len(), "checkpoint loaded");
    }

    let mut occurrence = resolved.occurrence;
    if let Some(pages) = args.pages {
        occurrence.pages = pages;
    }
    if let Some(cell_size) = args.cell_size {
        occurrence.cell_size = cell_size;
    }
    if let Some(max_points) = args.max_points {
        occurrence.max_points = max_points;
    }

    let options = BatchOptions {
        concurrency: args.concurrency.unwrap_or(resolved.concurrency).max(1),
        terminal_policy: TerminalPolicy::Retry,
        failure_delay: resolved.failure_delay,
        resolve_mode: ResolveMode::StoredOnly,
    };
    let enricher = build_enricher(args.source, &resolved, occurrence, &fetcher, &store);
    let pipeline = build_pipeline(&resolved, options, &fetcher, &store).with_enricher(enricher);

    let sink = progress_sink(output_mode);
    Ok(pipeline.run(&entries, checkpoint.as_ref(), sink.as_ref()))
}
