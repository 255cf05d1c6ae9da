use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Preserve an incoming `X-Request-Id` or assign a fresh one, and echo it on
/// the response. The value is also stored in request extensions for tracing.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    if let Some(value) = &req_id_value {
        req.extensions_mut().insert(value.clone());
    }

    let mut res = next.run(req).await;

    if let Some(value) = req_id_value {
        res.headers_mut().insert(header_name, value);
    }
    res
}
