pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::{ApiError, ApiState, CallError};

/// The full route table: agent channel at `/ws`, everything else under `/api`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/device/list", post(handlers::handle_device_list))
        .route("/device/exec", post(handlers::handle_exec))
        .route("/device/screenshot/get", post(handlers::handle_screenshot))
        .route("/device/file/upload", post(handlers::handle_file_upload))
        .route("/device/{act}", post(handlers::handle_power))
        .route(
            "/bridge/push",
            put(handlers::handle_bridge_push).post(handlers::handle_bridge_push),
        )
        .route(
            "/bridge/pull",
            get(handlers::handle_bridge_pull).post(handlers::handle_bridge_pull),
        )
        .with_state(state.clone());

    Router::new()
        .route(
            "/ws",
            get(handlers::handle_channel)
                .post(handlers::handle_fallback)
                .layer(DefaultBodyLimit::max(state.fallback_body_limit)),
        )
        .with_state(state)
        .nest("/api", api_routes)
        .layer(cors)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "control plane listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
