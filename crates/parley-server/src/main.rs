use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::chats;
use parley_api::middleware::require_auth;
use parley_db::Database;
use parley_hub::{Hub, Session};
use parley_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    hub: Hub,
    db: Arc<Database>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "8081".into())
        .parse()?;

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);

    // The hub worker owns the live-session registry for the whole process.
    let hub = Hub::spawn();

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret,
    });

    let server_state = ServerState { hub, db };

    // Routes
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/chats", get(chats::get_chats))
        .route("/chats/{chat_id}/messages", get(chats::get_messages))
        .route("/chats/{chat_id}/members", get(chats::get_members))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    // The session joins the hub only after this layer has accepted the
    // upgrade, so every registered session carries verified claims.
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn(require_auth))
        .with_state(server_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "up" }))
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    Extension(claims): Extension<Claims>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (session, handle) = Session::new(
            claims.sub.to_string(),
            claims.username,
            socket,
            state.hub.clone(),
            state.db,
        );
        // Only an authenticated, upgraded connection ever reaches the hub.
        state.hub.join(handle).await;
        session.run().await;
    })
}
