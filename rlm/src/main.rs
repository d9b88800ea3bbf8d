//! `rlm` command-line entry point.
//!
//! Inspection and setup commands around the symbolic loop: build and search
//! context stores, verify an alignment ledger, write a default config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rlm::core::budget::Budgets;
use rlm::core::chunking::ChunkStrategy;
use rlm::exit_codes;
use rlm::io::config::{ContextConfig, RlmConfig, write_config};
use rlm::io::context_store::{ContextSource, ContextStore};
use rlm::io::ledger::verify_chain;

#[derive(Parser)]
#[command(
    name = "rlm",
    version,
    about = "Symbolic execution loop over pointer-addressed context"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build or query a context store.
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },
    /// Inspect an alignment ledger.
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Manage `rlm.toml`.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Chunk FILE into `<out>/context/<digest>/` and print the object id.
    Build {
        file: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        target_bytes: Option<usize>,
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },
    /// Search a built context directory; prints hits as JSON lines.
    Search {
        dir: PathBuf,
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Re-fold the hash chain of `<run_dir>/alignment/ledger.jsonl`.
    Verify { run_dir: PathBuf },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default configuration to PATH.
    Init {
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Byte,
    Newline,
}

impl From<StrategyArg> for ChunkStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Byte => ChunkStrategy::Byte,
            StrategyArg::Newline => ChunkStrategy::Newline,
        }
    }
}

fn main() {
    rlm::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::CLI_FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Context {
            command:
                ContextCommand::Build {
                    file,
                    out,
                    target_bytes,
                    strategy,
                },
        } => cmd_context_build(&file, &out, target_bytes, strategy),
        Command::Context {
            command: ContextCommand::Search { dir, query, top_k },
        } => cmd_context_search(&dir, &query, top_k),
        Command::Ledger {
            command: LedgerCommand::Verify { run_dir },
        } => cmd_ledger_verify(&run_dir),
        Command::Config {
            command: ConfigCommand::Init { path, force },
        } => cmd_config_init(&path, force),
    }
}

fn cmd_context_build(
    file: &Path,
    out: &Path,
    target_bytes: Option<usize>,
    strategy: Option<StrategyArg>,
) -> Result<i32> {
    let defaults = ContextConfig::default();
    let cfg = ContextConfig {
        chunk_target_bytes: target_bytes.unwrap_or(defaults.chunk_target_bytes),
        strategy: strategy.map(Into::into).unwrap_or(defaults.strategy),
    };
    if cfg.chunk_target_bytes == 0 {
        bail!("--target-bytes must be > 0");
    }
    let store = ContextStore::build(out, ContextSource::File(file), &cfg)?;
    println!("{}", store.object_id());
    println!("chunks: {}", store.chunks().len());
    println!("dir: {}", store.dir().display());
    Ok(exit_codes::PASSED)
}

fn cmd_context_search(dir: &Path, query: &str, top_k: Option<usize>) -> Result<i32> {
    let store = ContextStore::open(dir)?;
    let budgets = Budgets::default();
    let results = store.search(query, top_k.unwrap_or(budgets.search_top_k), &budgets);
    for hit in &results.hits {
        println!("{}", serde_json::to_string(hit).context("serialize hit")?);
    }
    if results.clamped_top_k {
        eprintln!("top_k clamped to {}", budgets.search_top_k);
    }
    Ok(exit_codes::PASSED)
}

fn cmd_ledger_verify(run_dir: &Path) -> Result<i32> {
    let report = verify_chain(run_dir)?;
    match &report.first_break {
        None => {
            println!("ok: {} records, tail {}", report.records, report.hash_tail);
            Ok(exit_codes::PASSED)
        }
        Some(broken) => {
            println!(
                "broken at line {} ({}): {}",
                broken.line,
                broken.event_id.as_deref().unwrap_or("unparsed"),
                broken.reason
            );
            Ok(exit_codes::CLI_FAILURE)
        }
    }
}

fn cmd_config_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RlmConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::PASSED)
}
