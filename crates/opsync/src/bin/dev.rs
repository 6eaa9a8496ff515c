use clap::Parser;
use opsync::config::{NetConfig, StorageConfig};
use opsync::{
    CalendarClock, Connector, Listener, Replica, ReplicaOptions, SqliteStorage, Word, channel,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a local chain of opsync replicas for development", long_about = None)]
struct Args {
    /// Number of replicas to start
    #[arg(short, long, default_value = "3")]
    nodes: u16,

    /// Data directory root (each replica gets a subdirectory)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Database id served by the chain
    #[arg(long, default_value = "devdb")]
    db_id: String,

    /// Base TCP port; replica i listens on base + i
    #[arg(long, default_value = "8800")]
    base_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // keep temp dirs alive for the whole run
    let mut temp_dirs: Vec<TempDir> = Vec::new();
    let mut tasks = Vec::new();

    for i in 0..args.nodes {
        let listen = format!("127.0.0.1:{}", args.base_port + i);
        let connect = (i > 0).then(|| format!("127.0.0.1:{}", args.base_port + i - 1));

        let db_path = match &args.data_dir {
            Some(base) => {
                let dir = base.join(format!("{}", i + 1));
                std::fs::create_dir_all(&dir)?;
                dir.join("replica.db")
            }
            None => {
                let temp = TempDir::new()?;
                let path = temp.path().join("replica.db");
                temp_dirs.push(temp);
                path
            }
        };

        let storage_config = StorageConfig {
            db_path: db_path.clone(),
            sqlite_cache_size: 1000,
            sqlite_busy_timeout: 5000,
        };
        let storage = Arc::new(SqliteStorage::open(&db_path, &storage_config)?);

        // the chain head owns origin "1"; everyone else asks for a session
        let origin = if i == 0 { Word::from_token("1") } else { Word::ZERO };
        let replica = Replica::new(
            &args.db_id,
            Box::new(CalendarClock::new(origin)),
            storage,
            ReplicaOptions::default(),
        )?;
        let (handle, rx) = channel(256);
        tasks.push(tokio::spawn(replica.run(rx)));

        let net = NetConfig {
            listen: Some(listen.clone()),
            connect: connect.clone(),
            ..NetConfig::default()
        };

        info!("replica {} listening on {}", i + 1, listen);
        let listener = Listener::new(handle.clone(), listen, net.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!("listener error: {}", e);
            }
        }));

        if let Some(addr) = connect {
            let connector = Connector::new(handle.clone(), addr, net);
            tasks.push(tokio::spawn(async move {
                connector.run().await;
            }));
        }
    }

    info!("{} replicas running; press ctrl-c to stop", args.nodes);
    tokio::signal::ctrl_c().await?;
    drop(tasks);

    Ok(())
}
