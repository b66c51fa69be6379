//! Replio Target - storage node daemon
//!
//! Serves the streaming object transport and the async bucket-task
//! dispatcher over one listener.

mod dispatch;
mod ingest;

use anyhow::Result;
use clap::Parser;
use dispatch::TargetState;
use ingest::ObjectIngest;
use replio_common::{Bprops, BucketRegistry, CksumType, MdWritePolicy, MirrorConf};
use replio_fs::MountpathRegistry;
use replio_lom::{LomPool, Node};
use replio_task::{TaskCtx, XactRegistry};
use replio_transport::{Registry, NETWORK_PUBLIC};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "replio-target")]
#[command(about = "Replio storage target")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/replio/target.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Mountpath roots to use for storage (repeatable)
    #[arg(long = "mountpath")]
    mountpaths: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    target: TargetConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    buckets: Vec<BucketConfig>,
}

#[derive(Debug, Deserialize)]
struct TargetConfig {
    #[serde(default = "default_listen")]
    listen: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfig {
    #[serde(default)]
    mountpaths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Deserialize)]
struct BucketConfig {
    name: String,
    #[serde(default)]
    mirror: MirrorConf,
    #[serde(default)]
    md_write: MdWritePolicy,
    #[serde(default)]
    cksum: CksumType,
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // load config file if it exists; CLI takes precedence
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    let listen = args.listen.unwrap_or(config.target.listen);
    let mountpaths = if args.mountpaths.is_empty() {
        config.storage.mountpaths
    } else {
        args.mountpaths
    };
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Replio target");
    info!("Config file: {}", args.config);
    info!("Mountpaths: {:?}", mountpaths);

    if mountpaths.is_empty() {
        error!("No mountpaths specified. Use --mountpath or configure in {}", args.config);
        std::process::exit(1);
    }

    let fs = Arc::new(MountpathRegistry::new());
    for mpath in &mountpaths {
        let mi = fs.add(mpath)?;
        info!("Mountpath {} (fsid {})", mi.path, mi.fsid);
    }

    let buckets = Arc::new(BucketRegistry::new());
    if config.buckets.is_empty() {
        info!("No buckets configured; adding bucket \"default\"");
        buckets.add("default", Bprops::default());
    }
    for bc in &config.buckets {
        let bck = buckets.add(
            &bc.name,
            Bprops { mirror: bc.mirror, md_write: bc.md_write, cksum_ty: bc.cksum },
        );
        info!(
            "Bucket {} (bid {}, mirror: {}x{})",
            bck.name, bck.bid, bc.mirror.enabled, bc.mirror.copies
        );
    }

    let node = Node::new(Arc::clone(&fs), Arc::clone(&buckets));
    let pool = Arc::new(LomPool::new());

    let transport = Arc::new(Registry::new());
    transport.set_mux(NETWORK_PUBLIC);
    let path = transport.register(
        NETWORK_PUBLIC,
        "obj",
        Arc::new(ObjectIngest::new(Arc::clone(&node), Arc::clone(&pool))),
    )?;
    info!("Transport endpoint at {path}");

    let xreg = Arc::new(XactRegistry::new());
    let tasks = TaskCtx { fs: Arc::clone(&fs), buckets: Arc::clone(&buckets) };
    let state = TargetState {
        node,
        pool,
        xreg,
        tasks,
        transport: Arc::clone(&transport),
    };

    let app = replio_transport::router(transport, NETWORK_PUBLIC).merge(dispatch::router(state));

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {listen}: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Target shut down gracefully");
    Ok(())
}
