//! Command-line interface for BoardHub.

mod console;
mod serve;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use boardhub_core::{HubConfig, LoggingConfig};
use boardhub_storage::{
    open_database, Board, BoardRepository, FirmwareStore, RedbBoardStore, ReplyStream,
};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// BoardHub - command coordination for MQTT-connected boards.
#[derive(Parser, Debug)]
#[command(name = "boardhub")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reply listener, reconciler and operator console.
    Serve {
        /// Do not read operator commands from stdin.
        #[arg(long)]
        no_console: bool,
    },
    /// Board registry.
    Board {
        #[command(subcommand)]
        board_cmd: BoardCommand,
    },
    /// Firmware files.
    Firmware {
        #[command(subcommand)]
        firmware_cmd: FirmwareCommand,
    },
    /// Reply stream.
    Stream {
        #[command(subcommand)]
        stream_cmd: StreamCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BoardCommand {
    /// Register a board. Its command topic is `{common_topic}/{mac_address}`.
    Add {
        /// Board MAC address.
        mac_address: String,
    },
    /// List registered boards.
    List,
    /// Remove a board.
    Remove { mac_address: String },
}

#[derive(Subcommand, Debug)]
enum FirmwareCommand {
    /// Record a firmware binary already placed under the media root.
    Add {
        /// Firmware version reported to boards.
        version: String,
        /// Path relative to the media root.
        path: String,
    },
    /// List firmware files, newest first.
    List,
    /// Remove a firmware record and its binary.
    Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum StreamCommand {
    /// Show stream length and consumer group state.
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        HubConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = init_logging(&config.logging, args.verbose)?;

    match args.command {
        Command::Serve { no_console } => serve::run(config, !no_console).await,
        Command::Board { board_cmd } => run_board_cmd(&config, board_cmd).await,
        Command::Firmware { firmware_cmd } => run_firmware_cmd(&config, firmware_cmd).await,
        Command::Stream { stream_cmd } => run_stream_cmd(&config, stream_cmd).await,
    }
}

/// Console logging on stderr, compact or JSON, plus an optional daily log
/// file. The returned guard flushes the file writer on drop.
fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter = if verbose {
            "boardhub=debug"
        } else {
            config.filter.as_str()
        };
        EnvFilter::new(filter)
    });

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "boardhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);
    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
    Ok(guard)
}

async fn run_board_cmd(config: &HubConfig, cmd: BoardCommand) -> Result<()> {
    let db = open_database(config.storage.database_path())?;
    let boards = RedbBoardStore::new(db);

    match cmd {
        BoardCommand::Add { mac_address } => {
            let topic = config.mqtt.device_topic(&mac_address);
            let board = boards.create(Board::new(mac_address, topic)).await?;
            println!("Registered {} on {}", board.mac_address, board.topic);
        }
        BoardCommand::List => serve::print_boards(&boards.list().await?),
        BoardCommand::Remove { mac_address } => {
            if !boards.delete(&mac_address).await? {
                anyhow::bail!("board not found: {}", mac_address);
            }
            println!("Removed {}", mac_address);
        }
    }
    Ok(())
}

async fn run_firmware_cmd(config: &HubConfig, cmd: FirmwareCommand) -> Result<()> {
    let db = open_database(config.storage.database_path())?;
    let firmware = FirmwareStore::new(db);
    let media_root = config.storage.media_root.as_path();

    match cmd {
        FirmwareCommand::Add { version, path } => {
            ensure_on_disk(media_root, &path)?;
            let file = firmware.create(&version, &path).await?;
            println!("{}  {}  {}", file.id, file.version, file.path);
        }
        FirmwareCommand::List => {
            let files = firmware.list().await?;
            if files.is_empty() {
                println!("no firmware files");
            }
            for file in files {
                println!(
                    "{}  {}  {}  {}",
                    file.id,
                    file.version,
                    file.path,
                    file.uploaded_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        FirmwareCommand::Remove { id } => match firmware.remove(&id, media_root).await? {
            Some(file) => println!("Removed {} ({})", file.id, file.path),
            None => anyhow::bail!("firmware file not found: {}", id),
        },
    }
    Ok(())
}

fn ensure_on_disk(media_root: &Path, path: &str) -> Result<()> {
    let disk_path = media_root.join(path);
    if !disk_path.is_file() {
        anyhow::bail!("firmware binary not found at {}", disk_path.display());
    }
    Ok(())
}

async fn run_stream_cmd(config: &HubConfig, cmd: StreamCommand) -> Result<()> {
    let db = open_database(config.storage.database_path())?;
    let stream = ReplyStream::new(db);
    let group = config.reconciler.group.as_str();

    match cmd {
        StreamCommand::Info => {
            let info = stream.info(group).await?;
            println!("length:         {}", info.length);
            println!("last id:        {}", info.last_id);
            match info.last_delivered_id {
                Some(id) => {
                    println!("group:          {}", group);
                    println!("last delivered: {}", id);
                    println!("pending:        {}", info.pending);
                }
                None => println!("group:          {} (not created)", group),
            }
        }
    }
    Ok(())
}
