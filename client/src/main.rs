use clap::Parser;
use client::settings::{AppConfig, WatcherSettings};
use client::sink::{shared, FnSink};
use client::Session;
use log::{debug, error, info, warn};
use procwatch::{Schedule, Scheduler, Watcher, WatcherOutput};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

/// Scheduled commands waiting for the RCON link
const COMMAND_QUEUE: usize = 64;

const ANNOUNCEMENT: &str = "say -1 RCON admin Connected";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// RCON address (ip:port), overrides the configuration file
    #[arg(short, long)]
    address: Option<String>,

    /// RCON password, overrides the configuration file
    #[arg(short, long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mut settings = AppConfig::from_path(&args.config)?;
    if let Some(address) = &args.address {
        settings.arma.set_address(address)?;
    }
    if let Some(password) = args.password {
        settings.arma.password = password;
    }

    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let (commands_tx, commands_rx) = mpsc::channel::<String>(COMMAND_QUEUE);

    let watcher = if settings.watcher.enabled {
        let watcher = Watcher::new(settings.watcher.watcher_config());
        info!(
            "Watching {} {:?}",
            settings.watcher.path.display(),
            settings.watcher.params
        );
        watcher.start()?;
        if let Some(output) = watcher.take_output() {
            forward_output(output, &settings.watcher).await?;
        }
        Some(watcher)
    } else {
        info!("Watcher is disabled");
        None
    };

    let scheduler = if settings.scheduler.enabled {
        let schedule = Schedule::from_path(&settings.scheduler.path)?;
        let restarts = watcher.as_ref().map(Watcher::restart_handle);
        Some(Scheduler::spawn(
            &schedule,
            commands_tx.clone(),
            restarts,
            shutdown_rx.clone(),
        ))
    } else {
        info!("Scheduler is disabled");
        None
    };
    drop(commands_tx);

    let session = if settings.arma.enabled {
        let config = settings.arma.client_config()?;
        info!("RCON config: {:?}", config);
        let session = Session::new(config);

        if settings.arma.show_chat {
            session
                .set_chat_writer(shared(FnSink(|line: String| info!(target: "chat", "{}", line))))
                .await;
        }
        if settings.arma.show_events {
            session
                .set_event_writer(shared(FnSink(|line: String| {
                    info!(target: "events", "{}", line)
                })))
                .await;
        }

        session.watcher_loop().await?;
        tokio::spawn(pipe_commands(Arc::clone(&session), commands_rx));

        if let Err(e) = session.run_command(ANNOUNCEMENT, None).await {
            warn!("Failed to announce: {}", e);
        }
        Some(session)
    } else {
        info!("RCON is disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    shutdown.send_replace(true);

    if let Some(scheduler) = scheduler {
        scheduler.join().await;
    }
    if let Some(session) = &session {
        session.shutdown().await;
    }
    if let Some(watcher) = &watcher {
        watcher.shutdown().await;
    }

    Ok(())
}

/// Feeds scheduled commands into the session until the queue closes.
async fn pipe_commands(session: Arc<Session>, mut commands: mpsc::Receiver<String>) {
    while let Some(command) = commands.recv().await {
        if command.is_empty() {
            continue;
        }
        match session.run_command(&command, None).await {
            Ok(sequence) => debug!("Scheduled command {:?} sent as {}", command, sequence),
            Err(e) => warn!("Scheduled command {:?} not sent: {}", command, e),
        }
    }
    debug!("Command queue closed");
}

/// Sends server output to the log and/or a log file.
async fn forward_output(
    output: WatcherOutput,
    settings: &WatcherSettings,
) -> Result<(), std::io::Error> {
    let file = if settings.log_to_file {
        fs::create_dir_all(&settings.log_folder).await?;
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let path = settings
            .log_folder
            .join(format!("server_log_{}.log", started));
        info!("Writing server output to {}", path.display());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Some(Arc::new(Mutex::new(file)))
    } else {
        None
    };

    let console = settings.log_to_console;
    tokio::spawn(copy_lines(output.stdout, "stdout", console, file.clone()));
    tokio::spawn(copy_lines(output.stderr, "stderr", console, file));
    Ok(())
}

async fn copy_lines(
    mut lines: mpsc::Receiver<String>,
    stream: &'static str,
    console: bool,
    file: Option<Arc<Mutex<File>>>,
) {
    while let Some(line) = lines.recv().await {
        if console {
            info!(target: "server", "{}", line);
        }
        if let Some(file) = &file {
            let mut file = file.lock().await;
            if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                error!("Failed to write server {} to log file: {}", stream, e);
            }
        }
    }
}
