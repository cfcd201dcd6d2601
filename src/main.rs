//! clean-db-structure CLI
//!
//! Entry point for the command-line tool.
//!
//! Exit codes:
//! - 0: Dump cleaned (or already clean)
//! - 1: `--check` found a dump that cleaning would change
//! - 2: Tool error (config error, I/O error, inconsistent edit, etc.)

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use clean_db_structure::pipeline::available_passes;
use clean_db_structure::{CleanPipeline, Config, MigrationsOrder};

/// Default config file name used when --config is not explicitly provided.
const DEFAULT_CONFIG_FILE: &str = "clean-db-structure.toml";

#[derive(Parser, Debug)]
#[command(name = "clean-db-structure", version)]
#[command(about = "Normalizes PostgreSQL schema dumps so repeated dumps diff cleanly", long_about = None)]
struct Args {
    /// Schema dump to clean (defaults to [dump] path from the config)
    dump: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override ordering of the schema_migrations block (off, ascending, jumbled)
    #[arg(long, value_name = "MODE")]
    order_schema_migrations_values: Option<MigrationsOrder>,

    /// Move CREATE INDEX statements directly after their CREATE TABLE
    #[arg(long, overrides_with = "no_indexes_after_tables")]
    indexes_after_tables: bool,

    /// Leave CREATE INDEX statements where the dump put them
    #[arg(long, overrides_with = "indexes_after_tables")]
    no_indexes_after_tables: bool,

    /// Write the cleaned dump here instead of overwriting the input
    #[arg(short, long, conflicts_with = "stdout")]
    output: Option<PathBuf>,

    /// Print the cleaned dump to stdout instead of writing a file
    #[arg(long)]
    stdout: bool,

    /// Do not write anything; exit 1 if the dump is not clean
    #[arg(long, conflicts_with_all = ["output", "stdout"])]
    check: bool,

    /// List the available passes and exit
    #[arg(long)]
    list_passes: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(dirty) => {
            if dirty {
                std::process::exit(1);
            }
            // exit 0 is implicit
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(2);
        }
    }
}

/// Clean the dump.
///
/// Returns `Ok(true)` only in `--check` mode when the dump is not clean,
/// `Ok(false)` otherwise, or `Err` on tool errors.
fn run(args: Args) -> Result<bool> {
    if args.list_passes {
        for pass in available_passes() {
            println!("{:<32} {}", pass.name(), pass.description());
        }
        return Ok(false);
    }

    let mut config = load_config(&args.config)?;

    // Command-line flags win over the config file.
    if let Some(order) = args.order_schema_migrations_values {
        config.clean.order_schema_migrations_values = order;
    }
    if args.indexes_after_tables {
        config.clean.indexes_after_tables = true;
    }
    if args.no_indexes_after_tables {
        config.clean.indexes_after_tables = false;
    }

    let dump_path = args.dump.clone().unwrap_or_else(|| config.dump.path.clone());
    let source = std::fs::read_to_string(&dump_path)
        .with_context(|| format!("Failed to read dump {}", dump_path.display()))?;

    let pipeline = CleanPipeline::new(&config.clean);
    if pipeline.pass_names().is_empty() {
        warn!("No passes enabled; the dump will not change");
    }

    let outcome = pipeline
        .run(&source)
        .with_context(|| format!("Failed to clean {}", dump_path.display()))?;

    for report in &outcome.passes {
        info!(
            pass = report.pass,
            edits = report.edits,
            changed = report.changed,
            "pass applied"
        );
    }

    if args.check {
        if outcome.changed() {
            eprintln!("clean-db-structure: {} is not clean", dump_path.display());
            return Ok(true);
        }
        eprintln!("clean-db-structure: {} is clean", dump_path.display());
        return Ok(false);
    }

    if args.stdout {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(outcome.text.as_bytes())
            .context("Failed to write to stdout")?;
        return Ok(false);
    }

    let target = args.output.unwrap_or(dump_path);
    write_if_changed(&target, &outcome.text)?;
    Ok(false)
}

/// Load configuration from file.
///
/// If `config_path` is `Some`, the user explicitly passed `--config` and the file
/// must exist (error if not found). If `None`, the default config path is used;
/// a missing default config file is not an error (falls back to defaults with a warning).
fn load_config(config_path: &Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::from_file(path).context("Failed to load configuration")
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                Config::from_file(&default_path).context("Failed to load configuration")
            } else {
                warn!(
                    "Config file {} not found, using defaults",
                    default_path.display()
                );
                Ok(Config::default())
            }
        }
    }
}

/// Write `text` to `path` unless the file already holds exactly that text.
fn write_if_changed(path: &Path, text: &str) -> Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path)
        && existing == text
    {
        info!(path = %path.display(), "already clean, not rewriting");
        return Ok(());
    }
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}
