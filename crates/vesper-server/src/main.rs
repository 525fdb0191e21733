use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use vesper_api::auth::{self, AppState, AppStateInner};
use vesper_api::middleware::require_auth;
use vesper_api::{attachments, conversations, messages, reactions, social};
use vesper_bus::DeliveryBus;
use vesper_engine::{
    ConversationDirectory, DbRelationshipOracle, FsAttachmentStore, LogNotifier, MessageGateway,
    PermissionEvaluator, RateLimiter,
};

mod ws;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vesper=debug,tower_http=debug".into()),
        )
        .init();

    let jwt_secret =
        std::env::var("VESPER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("VESPER_DB_PATH").unwrap_or_else(|_| "vesper.db".into());
    let attachment_dir =
        std::env::var("VESPER_ATTACHMENT_DIR").unwrap_or_else(|_| "attachments".into());
    let host = std::env::var("VESPER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("VESPER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let db = Arc::new(vesper_db::Database::open(&PathBuf::from(&db_path))?);
    let oracle = Arc::new(DbRelationshipOracle::new(db.clone()));
    let permissions = Arc::new(PermissionEvaluator::new(oracle.clone()));
    let bus = DeliveryBus::new();
    let gateway = Arc::new(MessageGateway::new(
        db.clone(),
        permissions,
        RateLimiter::default(),
        bus.clone(),
        Arc::new(LogNotifier),
    ));
    let directory = Arc::new(ConversationDirectory::new(db.clone(), oracle));
    let attachment_store = Arc::new(FsAttachmentStore::new(PathBuf::from(attachment_dir)).await?);

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        gateway,
        directory,
        bus,
        attachments: attachment_store,
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        app: app_state.clone(),
        jwt_secret,
    };

    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/users/{user_id}/follow", post(social::follow))
        .route("/users/{user_id}/follow", delete(social::unfollow))
        .route("/users/{user_id}/block", post(social::block))
        .route("/users/{user_id}/block", delete(social::unblock))
        .route("/users/me/privacy", put(social::set_privacy))
        .route("/conversations", get(conversations::list))
        .route("/conversations/with/{user_id}", post(conversations::open))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::history).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}",
            delete(messages::delete_message),
        )
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/reactions",
            post(reactions::add_reaction).delete(reactions::remove_reaction),
        )
        .route("/attachments", post(attachments::upload))
        .route("/attachments/{digest}", get(attachments::download))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("vesper server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_connection(socket, state.app, state.jwt_secret))
}
