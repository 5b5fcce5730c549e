//! Binary entry point for the keyclaim administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use keyclaim::{
    config::KeyclaimConfig,
    ids::{
        ConsistentKeyIdAuthority, IdAuthority, IdBlock, PartitionValue, PlacementElement,
        PropertyMap,
    },
    locking::{ConsistentKeyLocker, MediatorRegistry},
    primitives::time::{ManualTimestamps, Timestamp, TimestampProvider},
    storage::{InMemoryStoreManager, StoreManager},
    types::{ClaimError, KeyColumn, Rid, TxId},
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "keyclaim",
    version,
    about = "Exercise claim-based locking and id allocation against an in-memory store",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "KEYCLAIM_CONFIG",
        help = "Configuration file (defaults to the user config directory)"
    )]
    config: Option<PathBuf>,

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

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the effective configuration")]
    Config,

    #[command(about = "Allocate id blocks from several instances and check they are disjoint")]
    Allocate {
        #[arg(long, default_value_t = 3, help = "Number of competing instances")]
        instances: usize,
        #[arg(long, default_value_t = 4, help = "Blocks each instance allocates")]
        blocks: usize,
        #[arg(long, default_value_t = 0)]
        partition: u32,
        #[arg(long, default_value_t = 0)]
        namespace: u32,
    },

    #[command(about = "Claim one key column from several instances at the same instant")]
    Contend {
        #[arg(long, default_value_t = 3, help = "Number of competing instances")]
        instances: usize,
        #[arg(long, default_value = "key")]
        key: String,
        #[arg(long, default_value = "column")]
        column: String,
    },

    #[command(about = "Run the configured placement strategy")]
    Place {
        #[arg(long, default_value_t = 10, help = "Number of elements to place")]
        count: usize,
        #[arg(long, help = "Partition key value carried by every element")]
        value: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct AllocatedBlock {
    instance: String,
    start: u64,
    len: u64,
}

#[derive(Serialize)]
struct AllocateReport {
    partition: u32,
    namespace: u32,
    blocks: Vec<AllocatedBlock>,
    disjoint: bool,
}

#[derive(Serialize)]
struct ContendOutcome {
    instance: String,
    held: bool,
    error: Option<String>,
}

#[derive(Serialize)]
struct ContendReport {
    key: String,
    column: String,
    outcomes: Vec<ContendOutcome>,
    winner: Option<String>,
}

#[derive(Serialize)]
struct PlaceReport {
    partitions: Vec<u32>,
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when a command ran but found a violated guarantee.
fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Config => {
            if cli.format == OutputFormat::Json {
                emit(&cli.format, &config, |_| {})?;
            } else {
                print!("{}", config.to_toml_string()?);
            }
            Ok(true)
        }
        Command::Allocate {
            instances,
            blocks,
            partition,
            namespace,
        } => {
            let report = run_allocate(&config, instances, blocks, partition, namespace)?;
            emit(&cli.format, &report, |_| print_allocate_text(&report))?;
            Ok(report.disjoint)
        }
        Command::Contend {
            instances,
            key,
            column,
        } => {
            let report = run_contend(&config, instances, key, column)?;
            emit(&cli.format, &report, |_| print_contend_text(&report))?;
            Ok(report.outcomes.iter().filter(|o| o.held).count() <= 1)
        }
        Command::Place { count, value } => {
            let report = run_place(&config, count, value)?;
            emit(&cli.format, &report, |_| {
                let joined: Vec<String> = report.partitions.iter().map(u32::to_string).collect();
                println!("{}", joined.join(" "));
            })?;
            Ok(true)
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("keyclaim").join("config.toml"))
}

fn load_config(explicit: Option<PathBuf>) -> Result<KeyclaimConfig, ClaimError> {
    match explicit {
        Some(path) => KeyclaimConfig::load(&path),
        None => match default_config_path() {
            Some(path) if path.exists() => KeyclaimConfig::load(&path),
            _ => Ok(KeyclaimConfig::default()),
        },
    }
}

fn run_allocate(
    config: &KeyclaimConfig,
    instances: usize,
    blocks: usize,
    partition: u32,
    namespace: u32,
) -> Result<AllocateReport, ClaimError> {
    if instances == 0 {
        return Err(ClaimError::Invalid("--instances must be at least 1"));
    }
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let times = config.timestamps();
    let timeout = config.id_pool_options().renew_timeout;

    let mut authorities = Vec::with_capacity(instances);
    for i in 0..instances {
        // one registry per instance so instances only meet in the store
        let registry = MediatorRegistry::new(times.clone());
        let rid = Rid::new(format!("instance-{i}"))?;
        authorities.push(Arc::new(ConsistentKeyIdAuthority::open(
            manager.clone(),
            times.clone(),
            &registry,
            config.locker_options(rid),
            config.block_sizer()?,
            config.id_authority_options(),
        )?));
    }

    let handles: Vec<_> = authorities
        .into_iter()
        .map(|authority| {
            thread::spawn(move || -> Result<Vec<(String, IdBlock)>, ClaimError> {
                let name = authority.rid().to_string();
                let mut out = Vec::with_capacity(blocks);
                for _ in 0..blocks {
                    match authority.get_id_block(partition, namespace, timeout) {
                        Ok(block) => out.push((name.clone(), block)),
                        Err(err) if err.is_exhausted() => break,
                        Err(err) => return Err(err),
                    }
                }
                Ok(out)
            })
        })
        .collect();

    let mut allocated = Vec::new();
    for handle in handles {
        let blocks = handle
            .join()
            .map_err(|_| ClaimError::Invalid("allocation thread panicked"))??;
        allocated.extend(blocks);
    }
    allocated.sort_by_key(|(_, block)| block.start());
    let disjoint = allocated
        .windows(2)
        .all(|pair| !pair[0].1.overlaps(&pair[1].1));
    Ok(AllocateReport {
        partition,
        namespace,
        blocks: allocated
            .into_iter()
            .map(|(instance, block)| AllocatedBlock {
                instance,
                start: block.start(),
                len: block.len(),
            })
            .collect(),
        disjoint,
    })
}

fn run_contend(
    config: &KeyclaimConfig,
    instances: usize,
    key: String,
    column: String,
) -> Result<ContendReport, ClaimError> {
    if instances == 0 {
        return Err(ClaimError::Invalid("--instances must be at least 1"));
    }
    let manager = InMemoryStoreManager::new();
    let clock = Arc::new(ManualTimestamps::new(Timestamp::from_nanos(1_000_000_000)));
    let times: Arc<dyn TimestampProvider> = clock.clone();
    let kc = KeyColumn::new(
        Bytes::from(key.clone().into_bytes()),
        Bytes::from(column.clone().into_bytes()),
    );

    let mut lockers = Vec::with_capacity(instances);
    for i in 0..instances {
        let registry = MediatorRegistry::new(times.clone());
        let rid = Rid::new(format!("instance-{i}"))?;
        let locker = ConsistentKeyLocker::open(
            &manager,
            "contend",
            times.clone(),
            &registry,
            config.locker_options(rid),
        )?;
        lockers.push((locker, TxId::next()));
    }

    // every claim is written before the clock moves, so all share one timestamp
    for (locker, tx) in &lockers {
        locker.write_lock(&kc, *tx)?;
    }
    let mut outcomes = Vec::with_capacity(instances);
    for (locker, tx) in &lockers {
        let result = locker.check_locks(*tx);
        outcomes.push(ContendOutcome {
            instance: locker.rid().to_string(),
            held: result.is_ok(),
            error: result.err().map(|err| err.to_string()),
        });
    }
    for (locker, tx) in &lockers {
        locker.delete_locks(*tx);
    }
    let winner = outcomes
        .iter()
        .find(|o| o.held)
        .map(|o| o.instance.clone());
    Ok(ContendReport {
        key,
        column,
        outcomes,
        winner,
    })
}

fn run_place(
    config: &KeyclaimConfig,
    count: usize,
    value: Option<String>,
) -> Result<PlaceReport, ClaimError> {
    let strategy = config.placement_strategy()?;
    let mut element = PropertyMap::new();
    if let (Some(key), Some(value)) = (&config.placement.partition_key, value) {
        element.insert(key.clone(), PartitionValue::from(value));
    }
    let element: &dyn PlacementElement = &element;
    let partitions = (0..count)
        .map(|_| strategy.get_partition(element))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PlaceReport { partitions })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_allocate_text(report: &AllocateReport) {
    println!(
        "partition={} namespace={} blocks={}",
        report.partition,
        report.namespace,
        report.blocks.len()
    );
    for block in &report.blocks {
        println!(
            "  [{},{}) {}",
            block.start,
            block.start + block.len,
            block.instance
        );
    }
    println!("disjoint={}", report.disjoint);
}

fn print_contend_text(report: &ContendReport) {
    println!("claim {}/{}", report.key, report.column);
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("  {} held", outcome.instance),
            Some(err) => println!("  {} lost: {err}", outcome.instance),
        }
    }
    match &report.winner {
        Some(winner) => println!("winner={winner}"),
        None => println!("winner=none"),
    }
}
