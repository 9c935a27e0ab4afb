//! OpenAI-compatible HTTP surface
//!
//! Every route is mounted both under `/v1` and at the root, so clients
//! configured with either base URL work.

pub mod handlers;
pub mod types;

use crate::{Herd, Result};

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub fn router(herd: Arc<Herd>) -> Router {
    let routes = Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/embeddings", post(handlers::embeddings))
        .route("/models", get(handlers::list_models));

    Router::new()
        .nest("/v1", routes.clone())
        .merge(routes)
        .with_state(herd)
}

/// Bind the configured address and serve until the process exits
pub async fn serve(herd: Herd) -> Result<()> {
    let listener = TcpListener::bind(herd.config().bind_addr()).await?;
    serve_with_listener(listener, herd).await
}

pub async fn serve_with_listener(listener: TcpListener, herd: Herd) -> Result<()> {
    let addr = listener.local_addr()?;
    match &herd.config().model_path {
        Some(path) => info!("Herd listening on http://{} (model {})", addr, path.display()),
        None => info!("Herd listening on http://{} (model from bearer token)", addr),
    }

    axum::serve(listener, router(Arc::new(herd))).await?;
    Ok(())
}
