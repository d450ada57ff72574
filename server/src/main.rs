use clap::{Parser, ValueEnum};
use log::{info, warn};
use server::{Behavior, Responder, ResponderConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Normal,
    Silent,
    RejectLogin,
    SilentAfterLogin,
}

impl From<Mode> for Behavior {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => Behavior::Normal,
            Mode::Silent => Behavior::Silent,
            Mode::RejectLogin => Behavior::RejectLogin,
            Mode::SilentAfterLogin => Behavior::SilentAfterLogin,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:2302")]
    bind: String,

    /// RCON password clients must present
    #[arg(short, long)]
    password: String,

    /// How to react to clients
    #[arg(short, long, value_enum, default_value = "normal")]
    mode: Mode,

    /// Largest response payload before splitting into parts
    #[arg(long, default_value = "1024")]
    max_payload: usize,

    /// Broadcast a fake chat line every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    chatter: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ResponderConfig::new(args.password)
        .with_behavior(args.mode.into())
        .with_max_payload(args.max_payload);
    let responder = Arc::new(Responder::bind(&args.bind, config).await?);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let server_handle = {
        let responder = Arc::clone(&responder);
        tokio::spawn(async move { responder.run(shutdown_rx).await })
    };

    if args.chatter > 0 {
        let responder = Arc::clone(&responder);
        let period = Duration::from_secs(args.chatter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut line = 0u64;
            loop {
                ticker.tick().await;
                line += 1;
                if let Err(e) = responder
                    .broadcast(&format!("(Global) Server: chatter line {}", line))
                    .await
                {
                    warn!("Broadcast failed: {}", e);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    shutdown.send_replace(true);
    server_handle.await?;

    let stats = responder.stats();
    info!(
        "Served {} logins, {} commands, {} keepalives",
        stats.logins,
        stats.commands.len(),
        stats.keep_alives
    );

    Ok(())
}
