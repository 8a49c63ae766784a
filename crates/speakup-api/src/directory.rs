use axum::{
    Json,
    extract::{Query, State},
};

use speakup_types::api::{DirectoryPage, DirectoryQuery};

use crate::AppState;
use crate::error::ApiError;

/// Online users first, then most recently active.
pub async fn list_directory(
    State(state): State<AppState>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<DirectoryPage>, ApiError> {
    let page = state
        .gateway
        .presence
        .fetch_page(query.page, query.page_size)
        .await?;
    Ok(Json(page))
}
