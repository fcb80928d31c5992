use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::Planner;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::storage;

pub mod commands;

use self::commands::{NoteArgs, RunArgs, TaskArgs};

#[derive(Parser, Debug)]
#[command(
    name = "planner",
    version,
    about = "Local task planner with recurring reminders and notes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over PLANNER_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over PLANNER_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, edit and list tasks
    Task(TaskArgs),
    /// Create, search and organise notes
    Note(NoteArgs),
    /// Stay in the foreground delivering reminders (default)
    Run(RunArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(loader.paths(), &config.storage)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let command = cli.command.unwrap_or(Commands::Run(RunArgs::default()));
    match command {
        Commands::Task(args) => {
            let planner = Planner::new(storage, clock, &config)?;
            commands::handle_task_command(&planner, &config, args)
        }
        Commands::Note(args) => commands::handle_note_command(&config, &storage, args),
        Commands::Run(args) => commands::run_reminders(&config, storage, clock, args),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
