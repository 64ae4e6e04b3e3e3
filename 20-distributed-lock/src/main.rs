use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use distributed_lock::{
    broker::{self, Broker},
    cli::{Cli, Command, ServerArgs},
    client,
    config::ServerConfig,
    lock::LockManager,
    store::{FileStore, MemoryStore, PayloadStore},
};

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => {
            init_tracing("warn");
            client::run(args).await?
        }
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    init_tracing(&config.log_level);

    let store: Arc<dyn PayloadStore> = if config.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::new(&config.data_dir))
    };
    let manager = Arc::new(LockManager::new(store));

    let listener = broker::bind(config.listen, config.backlog)
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let broker = Broker::new(listener, manager);
    let addr = broker.local_addr()?;
    info!("broker listening on {}", addr);

    if let Err(err) = broker.run_until_ctrl_c().await {
        warn!("broker exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
