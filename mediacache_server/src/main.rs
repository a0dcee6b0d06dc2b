use std::path::PathBuf;

use clap::Parser;
use mediacache_core::config::Config;
use mediacache_core::manager::DownloadManager;

mod server;

use server::AppState;

/// `mediacachectl` — HTTP caching/prefetching proxy for seekable media.
#[derive(Parser, Debug)]
#[command(name = "mediacachectl", version, about)]
struct Args {
    /// Address to bind the HTTP proxy to.
    #[arg(long, env = "MEDIACACHE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the HTTP proxy to.
    #[arg(long, env = "MEDIACACHE_PORT", default_value_t = 8680)]
    port: u16,

    /// Directory under which per-media cache subdirectories are created.
    /// Defaults to the user's cache directory.
    #[arg(long, env = "MEDIACACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Maximum total bytes the cache is allowed to grow to before the
    /// automatic cleanup pass starts reclaiming space.
    #[arg(long, env = "MEDIACACHE_MAX_CACHE_SIZE")]
    max_cache_size: Option<u64>,

    /// How often the automatic cache cleanup pass runs, in seconds.
    #[arg(long, env = "MEDIACACHE_CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    cleanup_interval_secs: u64,
}

fn default_cache_root() -> PathBuf {
    dirs_next::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mediacachectl")
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let cache_root = args.cache_root.unwrap_or_else(default_cache_root);
    let mut config = Config::default();
    if let Some(max_cache_size) = args.max_cache_size {
        config.max_cache_size = max_cache_size;
    }

    let manager = DownloadManager::new(cache_root.clone(), config)
        .expect("failed to construct download manager");
    manager.spawn_auto_cleanup(std::time::Duration::from_secs(args.cleanup_interval_secs));

    let state = AppState::new(manager.clone());
    let app = server::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    log::info!(
        "mediacachectl listening on http://{}  (cache_root={:?})",
        addr, cache_root
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .expect("server error");
}

async fn shutdown_signal(manager: std::sync::Arc<DownloadManager>) {
    tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    log::info!(
        "mediacachectl shutting down, {} task(s) still tracked",
        manager.task_count().await
    );
}
