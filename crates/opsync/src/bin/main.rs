use clap::Parser;
use opsync::config::{Config, NetConfig, ReplicaConfig, StorageConfig};
use opsync::{
    CalendarClock, Connector, Listener, Replica, ReplicaOptions, SqliteStorage, Word, channel,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated-object synchronization server", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Address to accept downstream replicas on
    #[arg(long)]
    listen: Option<String>,

    /// Upstream replica to connect to
    #[arg(long)]
    connect: Option<String>,

    /// Pre-assigned origin token (otherwise granted by the upstream)
    #[arg(long)]
    ssn_id: Option<String>,

    /// Database id: the root object name
    #[arg(long)]
    db_id: Option<String>,

    /// SQLite database path
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn default_config() -> Config {
    Config {
        replica: ReplicaConfig {
            db_id: "db".to_string(),
            ssn_id: None,
            scheme: "0262".to_string(),
            compact_threshold: 64,
        },
        net: NetConfig::default(),
        storage: StorageConfig {
            db_path: PathBuf::from("opsync.db"),
            sqlite_cache_size: 1000,
            sqlite_busy_timeout: 5000,
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => default_config(),
    };
    if args.listen.is_some() {
        config.net.listen = args.listen;
    }
    if args.connect.is_some() {
        config.net.connect = args.connect;
    }
    if args.ssn_id.is_some() {
        config.replica.ssn_id = args.ssn_id;
    }
    if let Some(db_id) = args.db_id {
        config.replica.db_id = db_id;
    }
    if let Some(db_path) = args.db_path {
        config.storage.db_path = db_path;
    }

    info!("starting opsync server for db '{}'", config.replica.db_id);

    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!("opening database at {:?}", config.storage.db_path);
    let storage = Arc::new(SqliteStorage::open(&config.storage.db_path, &config.storage)?);

    let origin = match &config.replica.ssn_id {
        Some(token) => token.parse()?,
        // without a pre-assigned id, the upstream grants one on handshake
        None if config.net.connect.is_some() => Word::ZERO,
        None => Word::from_token("1"),
    };
    let options = ReplicaOptions {
        scheme: config.replica.scheme.parse()?,
        compact_threshold: config.replica.compact_threshold,
        ..ReplicaOptions::default()
    };
    let mailbox = options.mailbox_capacity;
    let replica = Replica::new(
        &config.replica.db_id,
        Box::new(CalendarClock::new(origin)),
        storage,
        options,
    )?;
    info!("replica initialized with origin {}", replica.origin());

    let (handle, rx) = channel(mailbox);
    let mut tasks = vec![tokio::spawn(replica.run(rx))];

    if let Some(addr) = config.net.listen.clone() {
        let listener = Listener::new(handle.clone(), addr.clone(), config.net.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                tracing::error!("listener error: {}", e);
            }
        }));
        info!("accepting downstream replicas on {}", addr);
    }

    if let Some(addr) = config.net.connect.clone() {
        let connector = Connector::new(handle.clone(), addr.clone(), config.net.clone());
        tasks.push(tokio::spawn(async move {
            connector.run().await;
        }));
        info!("syncing upstream with {}", addr);
    }

    for task in tasks {
        task.await?;
    }

    Ok(())
}
