use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use atrium_api::middleware::require_auth;
use atrium_api::{AppState, AppStateInner, conversations, messages, notifications};
use atrium_gateway::connection;
use atrium_gateway::verifier::TokenVerifier;
use atrium_gateway::Gateway;

#[derive(Clone)]
struct ServerState {
    gateway: Gateway,
    verifier: TokenVerifier,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atrium=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("ATRIUM_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("ATRIUM_DB_PATH").unwrap_or_else(|_| "atrium.db".into());
    let host = std::env::var("ATRIUM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ATRIUM_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(atrium_store::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let gateway = Gateway::new(db.clone());
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        gateway: gateway.clone(),
    });

    let server_state = ServerState {
        gateway,
        verifier: TokenVerifier::new(jwt_secret),
    };

    // Routes
    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/direct", post(conversations::create_direct))
        .route("/conversations/group", post(conversations::create_group))
        .route("/conversations/{id}", get(conversations::get_conversation))
        .route("/conversations/{id}", delete(conversations::delete_conversation))
        .route(
            "/conversations/{id}/participants",
            post(conversations::add_participant),
        )
        .route(
            "/conversations/{id}/participants/{identity}",
            delete(conversations::remove_participant),
        )
        .route("/conversations/{id}/read-all", put(conversations::read_all))
        .route("/messages", post(messages::send_message))
        .route("/messages/{conversation_id}", get(messages::get_history))
        .route("/messages/{id}/read", put(messages::mark_read))
        .route("/messages/{id}/edit", put(messages::edit_message))
        .route("/messages/{id}", delete(messages::delete_message))
        .route(
            "/notifications/{identity}",
            get(notifications::get_notifications),
        )
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(server_state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Atrium messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct GatewayQuery {
    token: String,
}

/// Token is checked before the upgrade completes; a bad one is rejected at
/// the HTTP layer instead of after a socket handshake.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let who = state
        .verifier
        .verify(&query.token)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, state.gateway, who)))
}
