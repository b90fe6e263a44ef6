use std::sync::Arc;
use std::time;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use tagger_common::metrics::setup_metrics_routes;
use tagger_common::producer::Producer;
use tagger_common::queue::TaskQueue;
use tagger_common::store::TaskStore;

use crate::handlers::AppState;
use crate::probe::VideoProbe;

mod config;
mod handlers;
mod probe;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = TaskStore::connect(&config.database_url, config.max_db_connections)
        .await
        .expect("failed to connect to the task store");

    // One queue adapter per routing prefix; submissions pick theirs through
    // the platform routing table.
    let queues = vec![
        TaskQueue::new("rpa", &config.redis_url).expect("failed to initialize rpa queue"),
        TaskQueue::new("miaobi", &config.redis_url).expect("failed to initialize miaobi queue"),
    ];

    let probe = VideoProbe::new(
        config.max_video_size_mb,
        config.allowed_video_formats.0.clone(),
        time::Duration::from_millis(config.probe_timeout_ms),
    )
    .expect("failed to construct the video probe client");

    let state = AppState {
        producer: Arc::new(Producer::new(store.clone(), queues)),
        store: Arc::new(store),
        probe: Arc::new(probe),
    };

    let app = handlers::add_routes(Router::new(), state);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start tagger-api http server, {}", e),
    }
}
