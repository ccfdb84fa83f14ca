use crate::http::{make_boxed_error_response, make_boxed_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot reported by the readiness probe.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AdminStatus {
    pub ready: bool,
    pub generation: u64,
}

/// Serves `/health` (liveness, always ok) and `/ready` (readiness, driven by
/// the status closure).
pub struct AdminService<F> {
    status: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> AdminStatus,
{
    pub fn new(status: F) -> Self {
        Self { status }
    }
}

impl<F> Service<Request<Incoming>> for AdminService<F>
where
    F: Fn() -> AdminStatus + Send + Sync + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = AdminError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let status = (self.status)();

        Box::pin(async move { Ok(route(req.uri().path(), status)) })
    }
}

fn route(path: &str, status: AdminStatus) -> Response<BoxBody<Bytes, Infallible>> {
    match path {
        "/health" => make_boxed_response(StatusCode::OK, Bytes::from("ok\n")),
        "/ready" => {
            let code = if status.ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&status) {
                Ok(body) => make_boxed_response(code, Bytes::from(body)),
                Err(_) => make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR),
            }
        }
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}
