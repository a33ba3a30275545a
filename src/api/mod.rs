pub mod error;
pub mod response;
pub mod v1;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{app::AppState, config::Config};

pub fn router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        .nest("/api/v1", v1::router(state, cfg))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(feature = "metrics")]
pub fn with_metrics(app: Router) -> Router {
    use axum_prometheus::PrometheusMetricLayer;
    let (layer, handle) = PrometheusMetricLayer::pair();
    app.layer(layer).route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}
