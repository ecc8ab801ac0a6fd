use axum::{
    Router,
    http::{HeaderName, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    AppState,
    middleware::{BATCH_ID_HEADER, REQUEST_ID_HEADER, request_id_middleware},
};

pub mod artifacts;
pub mod providers;
pub mod sessions;

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub fn router(state: AppState) -> Router {
    let base_routes = Router::new()
        .route("/health", get(health_check))
        .merge(providers::router())
        .merge(artifacts::router())
        .merge(sessions::router())
        .with_state(state);

    // Browser clients read the batch id off streaming responses
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(BATCH_ID_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ]);

    Router::new()
        .nest("/api", base_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
}
