use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use bsv20_indexer::feed::Feed;
use bsv20_indexer::{IndexerConfig, Indexer, IndexerError, JsonLinesFeed, RedisStore, Shutdown};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    match run().await {
        Ok(shutdown) => {
            info!("Exiting: {:?}", shutdown);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<Shutdown, IndexerError> {
    let config = IndexerConfig::from_env()?;
    info!(
        "Indexer {} with {} workers, feed {}",
        config.indexer, config.threads, config.feed_path
    );

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let mut feed = JsonLinesFeed::with_path(&config.feed_path);
    let mut indexer = Indexer::new(config, store);

    tokio::select! {
        outcome = indexer.run(&mut feed) => outcome,
        _ = shutdown_signal() => {
            feed.unsubscribe().await;
            Ok(Shutdown::Signal)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
