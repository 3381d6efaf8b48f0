#![warn(missing_docs)]

//! Metadata server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pdc_meta::{MetadataRequest, Server, ServerConfig};
use pdc_transport::{channel, LocalTransport, PeerAddr};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line options.
#[derive(Parser, Debug)]
#[command(name = "pdc-server", about = "Object metadata server")]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads for offloaded handlers, overriding PDC_SERVER_NTHREAD
    /// (values below 2 are raised to 2)
    #[arg(long)]
    nthreads: Option<String>,

    /// Rank of this server
    #[arg(long)]
    server_id: Option<u32>,

    /// Number of servers in the group
    #[arg(long)]
    num_servers: Option<u32>,

    /// Address to publish
    #[arg(long)]
    listen: Option<String>,

    /// Directory for the address file
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Run handlers on the progress loop instead of the worker pool
    #[arg(long)]
    no_offload: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        config.apply_env();
        if let Some(n) = &self.nthreads {
            config.apply_nthreads(n);
        }
        if let Some(id) = self.server_id {
            config.server_id = id;
        }
        if let Some(n) = self.num_servers {
            config.num_servers = n;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(dir) = self.tmp_dir {
            config.tmp_dir = dir;
        }
        if self.no_offload {
            config.offload = false;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().into_config()?;
    let addr = PeerAddr::new(config.listen_addr.clone());
    let transport = Arc::new(LocalTransport::new(addr.clone()));
    let (client, endpoint) = channel(addr, config.queue_depth);

    let server = Server::init(config, transport, endpoint)?;
    let closer = client.with_origin(PeerAddr::new("local://signal"));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, closing server");
            if let Err(e) = closer.call(MetadataRequest::CloseServer).await {
                tracing::error!("close request failed: {}", e);
            }
        }
    });

    let summary = server.serve().await?;
    tracing::info!(?summary, "exit");
    drop(client);
    Ok(())
}
