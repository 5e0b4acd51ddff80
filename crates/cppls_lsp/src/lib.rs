//! The cppls language server.
//!
//! Transport, dispatch, lifecycle, document scheduling, and project
//! indexing over the machinery in the `cppls` core crate.

pub mod features;
pub mod indexer;
pub mod plugin;
pub mod proto;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod transport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::Arc;

use cppls::frontend::FrontEnd;

/// Serve one client over stdin/stdout.
pub async fn run_pipe(frontend: Arc<dyn FrontEnd>) -> i32 {
    let server = server::Server::new(frontend);
    tracing::info!("server started in pipe mode");
    server.run(tokio::io::stdin(), tokio::io::stdout()).await
}

/// Bind `host:port` and serve the first connection.
pub async fn run_socket(frontend: Arc<dyn FrontEnd>, host: &str, port: u16) -> i32 {
    let listener = match tokio::net::TcpListener::bind((host, port)).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, host, port, "failed to bind");
            return 1;
        }
    };
    tracing::info!(host, port, "server started in socket mode");
    let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(error) => {
            tracing::error!(%error, "failed to accept connection");
            return 1;
        }
    };
    tracing::info!(%peer, "connection accepted");
    let (reader, writer) = stream.into_split();
    let server = server::Server::new(frontend);
    server.run(reader, writer).await
}

/// Batch-index the workspace's compile database and exit.
pub async fn run_indexer(frontend: Arc<dyn FrontEnd>, workspace: std::path::PathBuf) -> i32 {
    use cppls::config::Config;

    let server = server::Server::new(frontend);
    let ctx = server.ctx.clone();
    {
        let mut config = Config::load_or_default(&workspace);
        config.substitute_workspace(&workspace);
        let mut world = ctx.world.lock().await;
        world.workspace = workspace.clone();
        world.db.set_workspace(&workspace);
        world.db.load_rules(&config.rules);
        ctx.store.set_dir(Some(std::path::PathBuf::from(&config.index.dir)));
        let dirs = config.server.compile_commands_dirs.clone();
        if !world.db.load_compile_database(&dirs, &workspace) {
            tracing::error!("no compile database found");
            return 1;
        }
        world.config = config;
        world.phase = state::Phase::Ready;
    }

    let runner = tokio::spawn(indexer::run(ctx.clone()));
    indexer::schedule_project(&ctx).await;
    ctx.indexer.wait_idle().await;
    ctx.trigger_exit();
    let _ = runner.await;
    tracing::info!("project indexing complete");
    0
}
