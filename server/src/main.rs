use std::error::Error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use recstore::ServerConfig;

mod acceptor;
mod session;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "recstore-server.toml")]
    config: String,
    /// Shut down on the first interrupt without asking.
    #[clap(short = 'q', long = "quick-exit")]
    quick_exit: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: ServerConfig = confy::load_path(&opts.config)?;
    if opts.quick_exit {
        cfg.quick_exit = true;
    }
    tracing::debug!(?cfg, "loaded server config");
    acceptor::run(&cfg)?;
    Ok(())
}
