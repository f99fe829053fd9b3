use axum::{
    extract::Request,
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    middleware::Next,
    response::Response,
};

/// Older peers post JSON without a content type; treat such bodies as JSON.
pub async fn normalize_content_type(mut request: Request, next: Next) -> Response {
    if request.method() == Method::POST && !request.headers().contains_key(CONTENT_TYPE) {
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    next.run(request).await
}
