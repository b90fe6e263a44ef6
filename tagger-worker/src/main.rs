//! Drain a platform queue and drive the per-dimension tagging fan-out.
use std::future::ready;
use std::path::Path;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use tagger_common::health::HealthRegistry;
use tagger_common::metrics::{serve, setup_metrics_routes};
use tagger_common::queue::TaskQueue;
use tagger_common::store::TaskStore;

use tagger_worker::config::Config;
use tagger_worker::download::Downloader;
use tagger_worker::index::IndexClient;
use tagger_worker::limiter::RateLimiter;
use tagger_worker::prompts::PromptStore;
use tagger_worker::provider::ModelProvider;
use tagger_worker::worker::PlatformWorker;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let queue = TaskQueue::new(&config.queue_prefix, &config.redis_url)
        .expect("failed to initialize queue");

    let store = TaskStore::connect(&config.database_url, config.max_db_connections)
        .await
        .expect("failed to connect to the task store");

    let downloader = Downloader::new(
        &config.download_dir,
        config.max_video_size_mb,
        config.allowed_video_formats.0.clone(),
        config.request_timeout.0,
    )
    .expect("failed to construct the download client");

    let prompts =
        PromptStore::load(Path::new(&config.prompt_dir)).expect("failed to load prompts");

    let provider = ModelProvider::new(
        &config.provider_base_url,
        &config.api_key,
        &config.model,
        prompts,
        config.request_timeout.0,
        std::time::Duration::from_secs(config.upload_wait_secs),
    )
    .expect("failed to construct the model provider client");

    let limiter = match (config.max_requests_per_minute, config.max_tokens_per_minute) {
        (Some(max_requests), Some(max_tokens)) => Some(
            RateLimiter::new(&config.redis_url, max_requests, max_tokens)
                .expect("failed to construct the rate limiter"),
        ),
        _ => None,
    };

    let index = config.index_url.as_ref().map(|url| {
        IndexClient::new(url, config.request_timeout.0)
            .expect("failed to construct the index client")
    });

    let worker = PlatformWorker::new(
        &config.worker_name,
        queue,
        store,
        downloader,
        provider,
        limiter,
        index,
        config.poll_interval.0,
        std::time::Duration::from_secs(config.lock_timeout_secs),
        config.max_retries,
        config.tokens_per_generate,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index_page))
        .route("/_readiness", get(index_page))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await;
}

pub async fn index_page() -> &'static str {
    "vision-tagger worker"
}
