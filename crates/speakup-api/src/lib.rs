pub mod auth;
pub mod directory;
pub mod error;
pub mod ice;
pub mod likes;
pub mod middleware;
pub mod notifications;
pub mod rooms;
pub mod schedule;

use std::sync::Arc;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};

use speakup_db::Database;
use speakup_gateway::Gateway;

use crate::error::ApiError;
use crate::ice::IceConfig;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    pub ice: IceConfig,
}

impl AppStateInner {
    pub fn new(gateway: Gateway, ice: IceConfig) -> AppState {
        Arc::new(Self { gateway, ice })
    }
}

/// Every REST route. `/auth/*` is public; the rest require a bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/like", get(likes::like_status).post(likes::toggle_like))
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/{id}/read", post(notifications::mark_read))
        .route(
            "/schedule",
            get(schedule::list_sessions).post(schedule::create_session),
        )
        .route("/schedule/{id}/cancel", post(schedule::cancel_session))
        .route("/schedule/{id}/complete", post(schedule::complete_session))
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/{code}", get(rooms::get_room))
        .route("/rooms/{code}/join", post(rooms::join_room))
        .route("/rooms/{code}/leave", post(rooms::leave_room))
        .route("/directory", get(directory::list_directory))
        .route("/call/ice-servers", get(ice::ice_servers))
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

/// Run a DB closure on the blocking pool; failures become a 500.
pub(crate) async fn db<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(speakup_gateway::blocking(&state.gateway.db, f).await?)
}
