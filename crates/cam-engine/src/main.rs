use anyhow::{bail, Context, Result};
use cam_core::{
    FileRegistry, InMemoryLockCoordinator, InvocationMode, MigrationConfig, ProgressRegistry,
    ProgressTracker, ShutdownSignal,
};
use cam_engine::memory::{
    MemoryAddressTable, MemoryBlobStore, MemoryRelationalStore, MemoryTreeStore,
};
use cam_engine::test_harness::{run_simulator, SimulatorConfig};
use cam_engine::MigrationSequencer;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new("cam-migrate")
        .version(cam_engine::VERSION)
        .about("Content address migration engine")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("demo")
                .about("Migrate a seeded in-memory system, recording progress to a file")
                .arg(
                    Arg::new("registry")
                        .long("registry")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Progress file to create; must not exist yet"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML migration configuration"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .value_parser(value_parser!(InvocationMode))
                        .help("tick or one-shot; defaults to the configured mode"),
                )
                .arg(
                    Arg::new("rows")
                        .long("rows")
                        .default_value("5000")
                        .value_parser(value_parser!(i64))
                        .help("Legacy rows in the relational store"),
                )
                .arg(
                    Arg::new("tree-nodes")
                        .long("tree-nodes")
                        .default_value("2000")
                        .value_parser(value_parser!(i64))
                        .help("Legacy entries in the tree store"),
                )
                .arg(
                    Arg::new("orphans")
                        .long("orphans")
                        .default_value("100")
                        .value_parser(value_parser!(usize))
                        .help("Blobs nobody references"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Print per-phase progress from a progress file")
                .arg(
                    Arg::new("registry")
                        .long("registry")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a TOML configuration and print the effective values")
                .arg(
                    Arg::new("config")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded end-to-end simulation with fault injection")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("rows")
                        .long("rows")
                        .default_value("2500")
                        .value_parser(value_parser!(i64)),
                )
                .arg(
                    Arg::new("tree-nodes")
                        .long("tree-nodes")
                        .default_value("1200")
                        .value_parser(value_parser!(i64)),
                )
                .arg(
                    Arg::new("orphans")
                        .long("orphans")
                        .default_value("40")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Probability that a relational range fails"),
                )
                .arg(
                    Arg::new("max-ticks")
                        .long("max-ticks")
                        .default_value("500")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        );

    let matches = cli.get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("demo", args)) => demo(args).await,
        Some(("status", args)) => status(args).await,
        Some(("check-config", args)) => check_config(args),
        Some(("simulate", args)) => simulate(args).await,
        _ => Ok(()),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn arg<T: Clone + Send + Sync + 'static>(args: &ArgMatches, name: &str) -> Result<T> {
    args.get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing --{name}"))
}

fn load_config(args: &ArgMatches) -> Result<MigrationConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => MigrationConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(MigrationConfig::default()),
    }
}

async fn demo(args: &ArgMatches) -> Result<()> {
    let registry_path: PathBuf = arg(args, "registry")?;
    if registry_path.exists() {
        bail!(
            "{} already exists; the demo seeds fresh stores and needs a fresh progress file",
            registry_path.display()
        );
    }
    let config = load_config(args)?;
    let mode = args
        .get_one::<InvocationMode>("mode")
        .copied()
        .unwrap_or_else(|| config.default_mode());

    let table = MemoryAddressTable::new();
    let relational = Arc::new(MemoryRelationalStore::new(table.clone()));
    let tree = Arc::new(MemoryTreeStore::new(table.clone()));
    let blobs = Arc::new(MemoryBlobStore::new());
    for id in 0..arg::<i64>(args, "rows")? {
        let url = format!("store://rel/{id:08}");
        blobs.put(url.as_str(), 1_024);
        relational.insert_legacy(id, url);
    }
    for id in 0..arg::<i64>(args, "tree-nodes")? {
        let url = format!("store://tree/{id:08}");
        blobs.put(url.as_str(), 2_048);
        tree.insert_legacy(id, url);
    }
    for n in 0..arg::<usize>(args, "orphans")? {
        blobs.put(format!("store://orphan/{n:08}"), 512);
    }

    let registry: Arc<dyn ProgressRegistry> = Arc::new(FileRegistry::open(&registry_path)?);
    let shutdown = ShutdownSignal::new();
    let sequencer = MigrationSequencer::standard(
        config,
        Arc::new(InMemoryLockCoordinator::new()),
        registry,
        relational.clone(),
        tree.clone(),
        blobs,
        Arc::new(table.clone()),
        shutdown.clone(),
    )?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.request();
        }
    });

    let mut status = sequencer.run(mode).await;
    if mode == InvocationMode::ScheduledTick {
        while matches!(status, cam_engine::MigrationStatus::InProgress { .. }) {
            status = sequencer.run(mode).await;
        }
    }

    println!("{status}");
    for record in sequencer.tracker().load_all().await? {
        println!("  {record}");
    }
    println!(
        "  legacy rows left: {}, legacy tree entries left: {}, orphans registered: {}",
        relational.legacy_count(),
        tree.legacy_count(),
        table.orphans().len()
    );

    if status.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

async fn status(args: &ArgMatches) -> Result<()> {
    let path: PathBuf = arg(args, "registry")?;
    if !path.exists() {
        bail!("no progress file at {}", path.display());
    }
    let tracker = ProgressTracker::new(Arc::new(FileRegistry::open(&path)?));
    let records = tracker.load_all().await?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for record in &records {
        match record.remaining() {
            Some(remaining) if !record.done => println!("{record} ({remaining} ids left)"),
            _ => println!("{record}"),
        }
    }
    if let Some(address) = tracker.last_address().await? {
        println!("reconciliation resumes after {address}");
    }
    Ok(())
}

fn check_config(args: &ArgMatches) -> Result<()> {
    let path: PathBuf = arg(args, "config")?;
    let config = MigrationConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    println!("{}: ok", path.display());
    println!("  batch_size: {}", config.batch_size);
    println!("  thread_count: {}", config.thread_count);
    println!("  ranges_per_thread: {}", config.ranges_per_thread);
    println!("  ranges per batch: {}", config.ranges_per_batch());
    println!("  lock_resource: {}", config.lock_resource);
    println!("  lock ttl: {:?}", config.lock_ttl());
    println!("  reconciliation checkpoint: every {} addresses", config.checkpoint_interval());
    println!("  conflict_retries: {}", config.conflict_retries);
    println!("  mode: {}", config.default_mode());
    Ok(())
}

async fn simulate(args: &ArgMatches) -> Result<()> {
    let config = SimulatorConfig {
        seed: arg(args, "seed")?,
        relational_rows: arg(args, "rows")?,
        tree_entries: arg(args, "tree-nodes")?,
        orphans: arg(args, "orphans")?,
        failure_rate: arg(args, "failure-rate")?,
        max_ticks: arg(args, "max-ticks")?,
        ..SimulatorConfig::default()
    };
    tracing::info!(seed = config.seed, "running simulation");

    let report = run_simulator(config).await?;
    if args.get_flag("json") {
        let json = serde_json::json!({
            "seed": report.config.seed,
            "passed": report.passed(),
            "final_status": report.final_status.to_string(),
            "stats": report.stats,
            "violations": report.violations,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("{}", report.generate_text());
    }

    if !report.passed() {
        std::process::exit(1);
    }
    Ok(())
}
