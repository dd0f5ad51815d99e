use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use runbox::config::types::RunboxConfig;
use runbox::error::Result;
use runbox::wrap::WrapperChain;

use crate::execute;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RunboxConfig>,
    pub chain: Arc<WrapperChain>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<RunboxConfig>) -> Result<Self> {
        // The wrapper chain is fixed at startup; every request wraps its
        // own clone of its command.
        let chain = Arc::new(WrapperChain::from_config(&config.execution)?);
        Ok(Self {
            config,
            chain,
            http: reqwest::Client::new(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_bytes;
    Router::new()
        .route("/exec/{route}", post(execute::exec_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
