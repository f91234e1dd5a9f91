use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use nimbus_chunk_server::{ChunkManager, ChunkServerConfig};
use nimbus_logging::LogConfig;
use nimbus_stubs::MockMetaServerStub;

/// NimbusFS chunk server
#[derive(Parser, Debug)]
#[command(name = "nimbus-chunk-server", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "chunk-server.toml")]
    config: String,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        println!("{}", toml::to_string_pretty(&ChunkServerConfig::default())?);
        return Ok(());
    }

    let _log_guard = nimbus_logging::init_logging(&LogConfig::default());
    tracing::info!(config = %args.config, "starting chunk server");

    let config = ChunkServerConfig::load(&args.config)?;
    // TODO: swap the mock for the real meta-server client once the RPC
    // layer lands in this workspace.
    let meta = MockMetaServerStub::new().into_arc();
    let manager = ChunkManager::new(config, meta)?;
    manager.start().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let checker = manager.dir_checker();
    let checker_task = tokio::spawn(checker.run(shutdown_rx.clone()));

    let tick_manager = Arc::clone(&manager);
    let mut tick_shutdown = shutdown_rx;
    let tick_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => tick_manager.timeout().await,
                _ = tick_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tick_task.await;
    let _ = checker_task.await;
    manager.shutdown().await;

    Ok(())
}
