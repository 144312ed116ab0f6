//! Binary entry point for the strata command line tool.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use strata::{
    logging::init_logging,
    tree::{Bytewise, Delimited, StrataStatsSnapshot},
    FileStorage, Order, Storage, Strata, StrataOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "stratify",
    version,
    about = "Edit and inspect a strata tree stored in a directory",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "DIR", help = "Directory holding the tree")]
    directory: PathBuf,

    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "STRATA_LOG",
        default_value = "warn",
        help = "Tracing filter directive"
    )]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, value_name = "FILE", help = "TOML file with tree options")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the maximum records per leaf")]
    leaf_size: Option<usize>,

    #[arg(long, help = "Override the maximum children per branch")]
    branch_size: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create an empty tree")]
    Init,
    #[command(about = "Insert key=value records")]
    Put {
        #[arg(value_name = "RECORD", required = true)]
        records: Vec<String>,
        #[arg(long, help = "Leave balancing to a later command")]
        no_balance: bool,
    },
    #[command(about = "Print the record stored under a key")]
    Get {
        #[arg(value_name = "KEY")]
        key: String,
    },
    #[command(about = "Remove records by key")]
    Del {
        #[arg(value_name = "KEY", required = true)]
        keys: Vec<String>,
        #[arg(long, help = "Leave balancing to a later command")]
        no_balance: bool,
    },
    #[command(about = "Print every record in key order")]
    List,
    #[command(about = "Run balance passes until the tree is settled")]
    Balance,
    #[command(about = "Verify the tree structure")]
    Check,
}

#[derive(Serialize)]
struct ChangeReport {
    changed: usize,
    balance_passes: usize,
}

#[derive(Serialize)]
struct CheckReport {
    depth: usize,
    branches: usize,
    leaves: usize,
    records: usize,
    ghosts: usize,
    stats: StrataStatsSnapshot,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;
    let options = load_options(&cli.open)?;
    let order = Order::new(Arc::new(Bytewise), Arc::new(Delimited(b'=')));
    fs::create_dir_all(&cli.directory)?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&cli.directory)?);

    let tree = match cli.command {
        Command::Init => {
            Strata::create(storage, order, options)?;
            println!("created {}", cli.directory.display());
            return Ok(());
        }
        _ => Strata::open(storage, order, options)?,
    };

    match cli.command {
        // Returned after creating the tree above.
        Command::Init => {}
        Command::Put {
            records,
            no_balance,
        } => {
            let mut changed = 0;
            for record in records {
                if !record.contains('=') {
                    return Err(format!("record {record:?} is not key=value").into());
                }
                tree.insert(record.into_bytes())?;
                changed += 1;
            }
            let report = settle(&tree, changed, no_balance)?;
            emit(cli.format, &report, || {
                println!("stored {} record(s)", report.changed)
            })?;
        }
        Command::Get { key } => match tree.get(key.as_bytes())? {
            Some(record) => println!("{}", String::from_utf8_lossy(&record)),
            None => {
                eprintln!("not found: {key}");
                std::process::exit(2);
            }
        },
        Command::Del { keys, no_balance } => {
            let mut changed = 0;
            for key in keys {
                if tree.remove(key.as_bytes())?.is_some() {
                    changed += 1;
                }
            }
            let report = settle(&tree, changed, no_balance)?;
            emit(cli.format, &report, || {
                println!("removed {} record(s)", report.changed)
            })?;
        }
        Command::List => {
            let records: Vec<String> = tree
                .records()?
                .iter()
                .map(|record| String::from_utf8_lossy(record).into_owned())
                .collect();
            emit(cli.format, &records, || {
                for record in &records {
                    println!("{record}");
                }
            })?;
        }
        Command::Balance => {
            let report = settle(&tree, 0, false)?;
            emit(cli.format, &report, || {
                println!("balanced in {} pass(es)", report.balance_passes)
            })?;
        }
        Command::Check => {
            let shape = tree.check()?;
            let report = CheckReport {
                depth: shape.depth,
                branches: shape.branches,
                leaves: shape.leaves.len(),
                records: shape.records(),
                ghosts: shape.ghosts.iter().sum(),
                stats: tree.stats(),
            };
            emit(cli.format, &report, || {
                println!(
                    "ok: depth={} branches={} leaves={} records={} ghosts={}",
                    report.depth, report.branches, report.leaves, report.records, report.ghosts
                )
            })?;
        }
    }
    tree.emit_stats();
    Ok(())
}

fn load_options(args: &OpenArgs) -> Result<StrataOptions, Box<dyn Error>> {
    let mut options = match &args.config {
        Some(path) => read_options(path)?,
        None => StrataOptions::default(),
    };
    if let Some(leaf_size) = args.leaf_size {
        options.leaf_size = leaf_size;
    }
    if let Some(branch_size) = args.branch_size {
        options.branch_size = branch_size;
    }
    options.validate()?;
    Ok(options)
}

fn read_options(path: &Path) -> Result<StrataOptions, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    Ok(StrataOptions::from_toml_str(&text)?)
}

/// Balances unless told not to, so every command leaves a settled tree.
fn settle(tree: &Strata, changed: usize, skip: bool) -> Result<ChangeReport, Box<dyn Error>> {
    let balance_passes = if skip { 0 } else { tree.balance_fully()? };
    Ok(ChangeReport {
        changed,
        balance_passes,
    })
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
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
