use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

use devgraph::config::Config;
use devgraph::config::ConfigLayer;
use devgraph::errors::EngineError;
use devgraph::errors::EngineResult;
use devgraph::http;
use devgraph::orchestrator::BootstrapOptions;
use devgraph::orchestrator::CancelToken;
use devgraph::orchestrator::Engine;
use devgraph::orchestrator::JobRegistry;

/// Ingest a git repository's history, file tree, docs and source into a temporal
/// semantic dev-graph, and serve it back through a windowed query layer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all eight stages once against `repo_path`
    Bootstrap(BootstrapArgs),
    /// Start the HTTP/RPC shell over an in-process orchestrator
    Serve(ServeArgs),
    /// Run only the Relationship Deriver against whatever the store already holds
    Derive(DeriveArgs),
    /// Check the graph store's schema, temporal and relationship invariants
    Validate(ValidateArgs),
}

#[derive(clap::Args, Debug)]
struct BootstrapArgs {
    /// Working copy root
    #[arg(long)]
    repo_path: PathBuf,

    /// Wipe the graph store before ingesting
    #[arg(long)]
    reset_graph: bool,

    /// Ceiling on commits walked by the Temporal Engine
    #[arg(long)]
    commit_limit: Option<usize>,

    /// Skip the Relationship Deriver after ingestion
    #[arg(long)]
    no_derive_relationships: bool,

    /// Limit chunking and symbol extraction to a sub-directory
    #[arg(long)]
    subpath: Option<String>,

    /// Worker threads for history walking and chunking
    #[arg(long)]
    max_workers: Option<usize>,

    /// Glob pattern to exclude from discovery; may be repeated
    #[arg(long = "exclude")]
    exclude_patterns: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Working copy root
    #[arg(long)]
    repo_path: PathBuf,

    /// Address the HTTP shell binds to
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

#[derive(clap::Args, Debug)]
struct DeriveArgs {
    /// Working copy root
    #[arg(long)]
    repo_path: PathBuf,

    /// Roll back every write at the end of the run
    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    /// Working copy root
    #[arg(long)]
    repo_path: PathBuf,
}

impl From<&BootstrapArgs> for ConfigLayer {
    fn from(args: &BootstrapArgs) -> Self {
        ConfigLayer {
            repo_path: Some(args.repo_path.clone()),
            reset_graph: Some(args.reset_graph),
            commit_limit: args.commit_limit,
            derive_relationships: Some(!args.no_derive_relationships),
            subpath: args.subpath.clone(),
            max_workers: args.max_workers,
            exclude_patterns: if args.exclude_patterns.is_empty() {
                None
            } else {
                Some(args.exclude_patterns.clone())
            },
            ..Default::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logger = env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init().unwrap();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(command: Command) -> EngineResult<()> {
    match command {
        Command::Bootstrap(args) => run_bootstrap(args),
        Command::Serve(args) => run_serve(args),
        Command::Derive(args) => run_derive(args),
        Command::Validate(args) => run_validate(args),
    }
}

fn run_bootstrap(args: BootstrapArgs) -> EngineResult<()> {
    let config = Config::resolve(ConfigLayer::from(&args))?;
    let engine = Engine::open(config)?;
    let registry = JobRegistry::new();
    let cancel = CancelToken::new();

    log::info!("bootstrapping {}", args.repo_path.display());
    let job_id = engine.bootstrap(&registry, &cancel, &BootstrapOptions::default())?;

    let job = registry.get(job_id).expect("job just finished under this registry");
    match job.derive_report {
        Some(report) => log::info!(
            "done: {} implements, {} evolves_from, {} depends_on, {} mentions, {} relates_to, {} co_occurs_with ({}ms)",
            report.implements,
            report.evolves_from,
            report.depends_on,
            report.mentions,
            report.relates_to,
            report.co_occurs_with,
            report.elapsed_ms,
        ),
        None => log::info!("done (relationship derivation skipped)"),
    }
    Ok(())
}

fn run_serve(args: ServeArgs) -> EngineResult<()> {
    let config = Config::resolve(ConfigLayer { repo_path: Some(args.repo_path), ..Default::default() })?;
    let engine = Engine::open(config)?;
    let state = http::AppState::new(engine);
    let router = http::router(state);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Other(e.into()))?;

    runtime.block_on(async move {
        log::info!("listening on {}", args.bind);
        let listener =
            tokio::net::TcpListener::bind(args.bind).await.map_err(|e| EngineError::Other(e.into()))?;
        axum::serve(listener, router).await.map_err(|e| EngineError::Other(e.into()))
    })
}

fn run_derive(args: DeriveArgs) -> EngineResult<()> {
    let config = Config::resolve(ConfigLayer { repo_path: Some(args.repo_path), ..Default::default() })?;
    let engine = Engine::open(config)?;
    let run_id = uuid::Uuid::new_v4().to_string();
    let report = engine.derive_relationships_only(&run_id, args.dry_run)?;

    log::info!(
        "{} implements, {} evolves_from, {} depends_on, {} mentions, {} relates_to, {} co_occurs_with ({}ms)",
        report.counts.implements,
        report.counts.evolves_from,
        report.counts.depends_on,
        report.counts.mentions,
        report.counts.relates_to,
        report.counts.co_occurs_with,
        report.elapsed_ms,
    );
    Ok(())
}

fn run_validate(args: ValidateArgs) -> EngineResult<()> {
    let config = Config::resolve(ConfigLayer { repo_path: Some(args.repo_path), ..Default::default() })?;
    let engine = Engine::open(config)?;

    let mut ok = true;
    for (name, report) in [
        ("schema", engine.validate_schema()?),
        ("temporal", engine.validate_temporal()?),
        ("relationships", engine.validate_relationships()?),
    ] {
        if report.ok {
            log::info!("{name}: ok");
        } else {
            ok = false;
            for violation in &report.violations {
                log::error!("{name}: {violation}");
            }
        }
    }

    if ok {
        Ok(())
    } else {
        Err(EngineError::Derivation { family: "validate".into(), source: anyhow::anyhow!("invariant violations found") })
    }
}
