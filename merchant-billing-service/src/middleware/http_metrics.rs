//! Per-request HTTP counter.

use axum::{extract::Request, middleware::Next, response::Response};

use crate::services::record_http_request;

pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let response = next.run(request).await;
    record_http_request(&method, response.status().as_str());
    response
}
