//! REST endpoints over the document collection.
pub mod documents;
pub mod errors;
pub mod metrics_defs;

use crate::metrics_defs::REQUEST_DURATION;
use axum::{
    Router,
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use documents::DocumentService;
use shared::histogram;
use std::future::Future;
use std::time::Instant;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum DocApiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn router(service: DocumentService) -> Router {
    Router::new()
        .route(
            "/api/documents",
            get(documents::list_documents).post(documents::create_document),
        )
        .route(
            "/api/documents/{id}",
            get(documents::get_document)
                .put(documents::upsert_document)
                .delete(documents::delete_document),
        )
        .route_layer(middleware::from_fn(record_request))
        .with_state(service)
}

pub async fn serve(
    host: &str,
    port: u16,
    service: DocumentService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DocApiError> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "document api listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn record_request(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_default();
    let method = request.method().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    histogram!(
        REQUEST_DURATION,
        "route" => route,
        "method" => method,
        "status" => response.status().as_u16().to_string()
    )
    .record(started.elapsed().as_secs_f64());
    response
}
