use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use mailq::config::{Config, DEFAULT_CONFIG_PATH, TransportConfig, TransportKind};
use mailq::gmail::GmailTransport;
use mailq::message::RecipientPolicy;
use mailq::transport::DropDirTransport;
use mailq::{Database, Dispatcher, Purger, QueueStore, Transport, auth, logging};
use tracing::{error, info};

const USAGE: &str = "Usage: mailq [--config <path>] [--debug] <dispatch|purge|run|reset-token>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Dispatch,
    Purge,
    Run,
    ResetToken,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    command: Command,
    config: PathBuf,
    debug: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut command = None;
        let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut debug = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--debug" => debug = true,
                "--config" => {
                    config = args
                        .next()
                        .map(PathBuf::from)
                        .context("--config needs a path")?;
                }
                "dispatch" | "purge" | "run" | "reset-token" if command.is_some() => {
                    bail!("More than one command given");
                }
                "dispatch" => command = Some(Command::Dispatch),
                "purge" => command = Some(Command::Purge),
                "run" => command = Some(Command::Run),
                "reset-token" => command = Some(Command::ResetToken),
                other => bail!("Unknown argument {other:?}"),
            }
        }

        Ok(Self {
            command: command.context("No command given")?,
            config,
            debug,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(2);
        }
    };
    logging::init(args.debug);

    if args.command == Command::ResetToken {
        auth::RingStorage.clear_token().await?;
        println!("Token cleared. The next run will ask for authorization again.");
        return Ok(());
    }

    let config = Config::load(&args.config);
    let db = Database::new(&config.database.url).await?;
    db.run_migrations().await?;
    let store: Arc<dyn QueueStore> = Arc::new(db);

    let purger = Purger::new(store.clone(), config.purge.clone());
    if args.command == Command::Purge {
        let deleted = purger.purge().await;
        println!("Purged {deleted} emails");
        return Ok(());
    }

    let dispatcher = Dispatcher::new(
        store,
        transport(&config.transport).await?,
        config.dispatch.clone(),
        RecipientPolicy::new(&config.delivery),
    );

    if args.command == Command::Dispatch {
        match dispatcher.run_batch().await {
            Ok(Some(report)) => println!(
                "Selected {}, sent {}, failed {}, exhausted {}, suppressed {}, skipped {}",
                report.selected,
                report.sent,
                report.failed,
                report.exhausted,
                report.suppressed,
                report.skipped
            ),
            Ok(None) => println!("Another dispatch is already running"),
            Err(e) => {
                eprintln!("Dispatch failed: {e}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let interval = config.dispatch.interval();
    info!(interval_secs = interval.as_secs(), "Running queue");
    loop {
        if let Err(e) = dispatcher.run_batch().await {
            error!(error = %e, "Dispatch pass failed");
        }
        purger.purge().await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.kind {
        TransportKind::Gmail => Arc::new(GmailTransport::connect(&config.credentials).await?),
        TransportKind::DropDir => Arc::new(DropDirTransport::new(&config.drop_dir)),
    };
    Ok(transport)
}
