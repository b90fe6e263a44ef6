use std::sync::Arc;

use axum::{routing, Router};

use tagger_common::producer::Producer;
use tagger_common::store::TaskStore;

use crate::probe::VideoProbe;

mod task;

#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<Producer>,
    pub store: Arc<TaskStore>,
    pub probe: Arc<VideoProbe>,
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/task/create",
            routing::post(task::create).with_state(state.clone()),
        )
        .route(
            "/task/get/:task_id",
            routing::get(task::lookup).with_state(state),
        )
}

pub async fn index() -> &'static str {
    "vision-tagger api"
}
