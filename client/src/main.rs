use std::error::Error;
use std::fs;
use std::io::{self, ErrorKind};
use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use recstore::connection::Connection;
use recstore::packets::ClientLogEntry;
use recstore::signals::Closing;
use recstore::{ClientConfig, Detached, RecStoreError, RecordStore, Registry, SemaphoreBank};

mod app;
mod display;

/// Slot group guarding this machine's client log.
const LOG_GROUP: usize = 0;
/// Slot group guarding the process table.
const REGISTRY_GROUP: usize = 1;
const GROUPS: usize = 2;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "recstore-client.toml")]
    config: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ClientConfig = confy::load_path(&opts.config)?;
    tracing::debug!(?cfg, "loaded client config");
    let closing = Closing::install()?;

    fs::create_dir_all(&cfg.log_dir)?;
    let log_path = cfg.log_file()?;

    let conn = match Connection::connect((cfg.server_host.as_str(), cfg.port)) {
        Ok(conn) => conn,
        Err(RecStoreError::Io(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            println!("Server is not online.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    info!(server = %conn.peer()?, "connected");

    let bank = SemaphoreBank::create_or_attach(cfg.semaphore_key(), GROUPS)?;
    let log: RecordStore<ClientLogEntry> = RecordStore::open_or_create(&log_path, bank.group(LOG_GROUP)?)?;
    let pid = process::id() as i32;
    let registry = match Registry::attach(&cfg.registry, pid, bank.group(REGISTRY_GROUP)?) {
        Ok(registry) => registry,
        Err(RecStoreError::RegistryFull { capacity }) => {
            error!(capacity, "process table full");
            println!("Max client capacity reached. Try again later.");
            process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    info!(pid, slot = registry.acquired_index(), log = %log_path.display(), "client ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let result = app::App::new(stdin.lock(), stdout.lock(), conn, &log, &registry)
        .watch(closing)
        .run();
    if let Err(e) = &result {
        error!(error = %e, "client stopped");
    }

    match registry.detach()? {
        Detached::Remaining(n) => info!(remaining = n, "detached"),
        Detached::Destroyed => info!("last client out, shared state removed"),
    }
    result?;
    Ok(())
}
