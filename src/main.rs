use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use synxpo::client::{
    expand_tilde, ClientConfig, Connection, DirWatcher, DirectoryEntry, SyncEngine,
};
use synxpo::meta::{MetadataStore, SqliteMetadataStore};
use synxpo::server::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "synxpo", about = "Directory synchronization over a long-lived stream")]
struct Cli {
    /// Path to the client configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the synchronization server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:50051")]
        addr: String,
        /// Root directory for blobs and metadata
        #[arg(long, default_value = "server_storage")]
        storage_root: PathBuf,
    },
    /// Run the client sync engine (default)
    Sync,
    /// Register a new local directory for synchronization
    DirLink {
        /// Local directory to synchronize
        path: PathBuf,
    },
    /// Attach an existing server directory
    DirPull {
        /// Server directory id
        id: String,
        /// Where to place the local replica
        #[arg(long)]
        path: Option<PathBuf>,
        /// Directory name under the storage path when --path is absent
        #[arg(long)]
        name: Option<String>,
    },
    /// Inspect or edit configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Set a configuration value
    Set { key: String, value: String },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("synxpo={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(ClientConfig::default_path);

    match cli.command.unwrap_or(Command::Sync) {
        Command::Serve { addr, storage_root } => {
            init_logging("info");
            run_server(addr, storage_root).await
        }
        Command::Sync => {
            let config = ClientConfig::load(&config_path)?;
            init_logging(&config.log_level);
            run_sync(config_path, config).await
        }
        Command::DirLink { path } => {
            let mut config = ClientConfig::load(&config_path)?;
            dir_link(&mut config, path)?;
            config.save(&config_path)
        }
        Command::DirPull { id, path, name } => {
            let mut config = ClientConfig::load(&config_path)?;
            dir_pull(&mut config, id, path, name)?;
            config.save(&config_path)
        }
        Command::Config { command } => {
            let ConfigCommand::Set { key, value } = command;
            let mut config = ClientConfig::load(&config_path)?;
            config.set(&key, &value)?;
            config.save(&config_path)?;
            println!("{key} = {value}");
            Ok(())
        }
    }
}

async fn run_server(addr: String, storage_root: PathBuf) -> Result<()> {
    let storage_root = expand_tilde(&storage_root);
    let meta: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::open(&storage_root.join("metadata.db"))?);

    let config = ServerConfig {
        bind_addr: addr,
        storage_root,
        ..Default::default()
    };

    let server = SyncServer::bind(config, meta).await?;
    server.run().await
}

async fn run_sync(config_path: PathBuf, config: ClientConfig) -> Result<()> {
    if config.directories.is_empty() {
        bail!("no directories configured; add one with `synxpo dir-link <path>`");
    }

    let storage_path = expand_tilde(&config.storage_path);
    let meta: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::open(&storage_path.join("metadata.db"))?);

    let (conn, callbacks) = Connection::connect(&config.server_address)
        .await
        .with_context(|| format!("failed to connect to {}", config.server_address))?;
    let conn = Arc::new(conn);

    // The watcher feeds raw events; the engine debounces them
    let (watch_tx, watch_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = DirWatcher::new(watch_tx)?;
    for entry in config.directories.iter().filter(|d| d.enabled) {
        let path = expand_tilde(&entry.local_path);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        watcher.watch(&path)?;
    }

    let engine = SyncEngine::new(config_path, config, meta, conn);
    engine.start(callbacks, watch_rx).await?;

    info!("auto-sync running, press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                if !engine.is_running() {
                    bail!("connection to server lost");
                }
            }
        }
    }

    engine.stop();
    Ok(())
}

fn dir_link(config: &mut ClientConfig, path: PathBuf) -> Result<()> {
    let path = expand_tilde(&path);
    if config.directories.iter().any(|d| d.local_path == path) {
        bail!("{} is already configured", path.display());
    }
    std::fs::create_dir_all(&path)?;
    config.add_directory(DirectoryEntry {
        directory_id: None,
        local_path: path.clone(),
        enabled: true,
    });
    println!("linked {} (id assigned on first sync)", path.display());
    Ok(())
}

fn dir_pull(
    config: &mut ClientConfig,
    id: String,
    path: Option<PathBuf>,
    name: Option<String>,
) -> Result<()> {
    if config
        .directories
        .iter()
        .any(|d| d.directory_id.as_deref() == Some(id.as_str()))
    {
        bail!("directory {id} is already configured");
    }

    let local_path = match path {
        Some(path) => expand_tilde(&path),
        None => {
            let name = name.unwrap_or_else(|| id.clone());
            expand_tilde(&config.storage_path).join(name)
        }
    };

    std::fs::create_dir_all(&local_path)?;
    config.add_directory(DirectoryEntry {
        directory_id: Some(id.clone()),
        local_path: local_path.clone(),
        enabled: true,
    });
    println!("pulling {id} into {}", local_path.display());
    Ok(())
}
