//! `boardhub serve`: the long-running coordinator.
//!
//! Wires the reply listener, the reconciler, watchdog recovery, the event
//! log and the operator console around one database and one cancellation
//! token, then waits for a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use boardhub_commands::{CommandApi, Dispatcher, Reconciler, Watchdog};
use boardhub_core::{
    notify_logged, now_ms, BoardEvent, EventBus, EventBusReceiver, HubConfig, MqttConfig,
    Notifier, BOARDS_CHANNEL,
};
use boardhub_devices::{MqttPublisher, ReplyIngestor, ReplyListener};
use boardhub_storage::{
    open_database, Board, BoardRepository, FirmwareStore, LockStore, RedbBoardStore,
    RedbLockStore, ReplyStream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::console::{self, ConsoleCommand, HELP};

/// How long shutdown waits for tasks to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles the console needs to act on commands.
struct Console {
    api: CommandApi,
    boards: Arc<RedbBoardStore>,
    locks: Arc<RedbLockStore>,
    bus: EventBus,
    mqtt: MqttConfig,
}

pub async fn run(config: HubConfig, with_console: bool) -> Result<()> {
    let db = open_database(config.storage.database_path())?;
    tracing::info!(path = %config.storage.database_path().display(), "database opened");

    let locks = Arc::new(RedbLockStore::new(db.clone()));
    let boards = Arc::new(RedbBoardStore::new(db.clone()));
    let firmware = FirmwareStore::new(db.clone());
    let stream = ReplyStream::new(db);
    stream.create_group(&config.reconciler.group).await?;

    let bus = EventBus::new();
    let notifier: Arc<dyn Notifier> = Arc::new(bus.clone());
    let cancel = CancellationToken::new();

    let watchdog = Watchdog::new(
        locks.clone(),
        notifier.clone(),
        config.commands.clone(),
        cancel.clone(),
    );
    let recovered = watchdog.recover().await?;
    if recovered > 0 {
        tracing::info!(count = recovered, "re-armed watchdogs for in-flight operations");
    }

    let publisher = Arc::new(MqttPublisher::new(config.mqtt.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        locks.clone(),
        publisher,
        watchdog.clone(),
        config.mqtt.clone(),
        config.commands.clone(),
    ));
    let api = CommandApi::new(
        dispatcher,
        boards.clone(),
        firmware,
        config.storage.clone(),
    );
    let reconciler = Arc::new(Reconciler::new(
        stream.clone(),
        locks.clone(),
        boards.clone(),
        notifier,
        config.reconciler.clone(),
    ));
    let listener = ReplyListener::new(config.mqtt.clone(), ReplyIngestor::new(stream));

    let tracker = TaskTracker::new();
    tracker.spawn(print_events(bus.subscribe(), cancel.clone()));
    tracker.spawn(listener.run(cancel.clone()));
    let reconciler_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = reconciler.run(reconciler_cancel).await {
            tracing::error!(error = %e, "reconciler failed");
        }
    });
    tracker.close();

    tracing::info!(
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        reply_topic = %config.mqtt.reply_topic,
        workers = config.reconciler.workers,
        "boardhub running"
    );

    if with_console {
        let console = Console {
            api,
            boards,
            locks,
            bus,
            mqtt: config.mqtt.clone(),
        };
        println!("Type 'help' for commands.");
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = console.run() => tracing::info!("console requested shutdown"),
        }
    } else {
        shutdown_signal().await;
    }

    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        tracker.wait().await;
        watchdog.wait().await;
    })
    .await;
    match drained {
        Ok(()) => tracing::info!("shutdown complete"),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "shutdown timed out, exiting anyway"
        ),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// Print every board event as one JSON line on stdout.
async fn print_events(mut rx: EventBusReceiver, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };
        let Some((event, _)) = received else { break };
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to encode event"),
        }
    }
}

/// Forward stdin lines from a plain thread; a blocking read cannot be
/// cancelled and would otherwise hold up runtime shutdown.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.blocking_send(line.clone()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

impl Console {
    /// Run until `quit`. End of input leaves the server running.
    async fn run(self) {
        let mut lines = stdin_lines();
        while let Some(line) = lines.recv().await {
            match console::parse(&line) {
                Ok(Some(ConsoleCommand::Quit)) => return,
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => {}
                Err(e) => println!("{}", e),
            }
        }
        tracing::debug!("console input closed");
        std::future::pending::<()>().await
    }

    async fn execute(&self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::State { mac_address, value } => {
                match self.api.set_state(&mac_address, value).await {
                    Ok(job_id) => println!("state sent to {} (job {})", mac_address, job_id),
                    Err(e) => println!("error {}: {}", e.status_code(), e),
                }
            }
            ConsoleCommand::Flash {
                mac_address,
                file_id,
            } => match self.api.flash_single(&mac_address, &file_id).await {
                Ok(job_id) => println!("flash sent to {} (job {})", mac_address, job_id),
                Err(e) => println!("error {}: {}", e.status_code(), e),
            },
            ConsoleCommand::FlashAll { file_id } => match self.api.flash_all(&file_id).await {
                Ok(outcome) => {
                    println!(
                        "flash broadcast: {} locked, {} busy, {} failed",
                        outcome.accepted.len(),
                        outcome.conflicts.len(),
                        outcome.failed.len()
                    );
                    for mac in &outcome.conflicts {
                        println!("  busy: {}", mac);
                    }
                }
                Err(e) => println!("error {}: {}", e.status_code(), e),
            },
            ConsoleCommand::Add { mac_address } => {
                let board = Board::new(mac_address.as_str(), self.mqtt.device_topic(&mac_address));
                match self.boards.create(board).await {
                    Ok(board) => {
                        println!("registered {} on {}", board.mac_address, board.topic);
                        notify_logged(
                            &self.bus,
                            BoardEvent::created(board.mac_address, board.topic),
                            BOARDS_CHANNEL,
                        )
                        .await;
                    }
                    Err(e) => println!("error: {}", e),
                }
            }
            ConsoleCommand::Boards => match self.boards.list().await {
                Ok(boards) => print_boards(&boards),
                Err(e) => println!("error: {}", e),
            },
            ConsoleCommand::Locks => match self.locks.list().await {
                Ok(locks) if locks.is_empty() => println!("no operations in flight"),
                Ok(locks) => {
                    let now = now_ms();
                    for lock in locks {
                        let state = if lock.is_expired(now) { "expired" } else { "held" };
                        println!(
                            "{}  {}  deadline in {}s",
                            lock.key(),
                            state,
                            lock.remaining_until_deadline(now).as_secs()
                        );
                    }
                }
                Err(e) => println!("error: {}", e),
            },
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
    }
}

pub fn print_boards(boards: &[Board]) {
    if boards.is_empty() {
        println!("no boards registered");
        return;
    }
    for board in boards {
        println!(
            "{}  {}  {}  firmware {}",
            board.mac_address,
            if board.is_active { "on " } else { "off" },
            board.topic,
            board.file_version.as_deref().unwrap_or("-")
        );
    }
}
