//! Pack endpoints. Responses are never cached (see `no_store`).

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use super::{current_user, require_user, AppError, AppState, Session};
use crate::models::PackOpenRecord;
use crate::packs::{self, Collection, CollectionQuery, LedgerEntry, PackOpening, SetSummary};

const HISTORY_LIMIT: i64 = 20;

#[derive(Serialize)]
pub(super) struct SetsResponse {
    sets: Vec<SetSummary>,
    star_points: i64,
}

pub(super) async fn list_sets(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<SetsResponse>, AppError> {
    let data = session.data.lock().await;
    let user = current_user(&state, &data).await?;
    let sets = packs::list_sets(&state.pool, &state.config.packs, user.as_ref()).await?;
    Ok(Json(SetsResponse {
        sets,
        star_points: user.map(|u| u.star_points).unwrap_or(0),
    }))
}

pub(super) async fn open(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(set): Path<String>,
) -> Result<Json<PackOpening>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let opening = packs::open_pack(&state.pool, &state.config.packs, &user, &set).await?;
    Ok(Json(opening))
}

pub(super) async fn collection(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<CollectionQuery>,
) -> Result<Json<Collection>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    Ok(Json(packs::collection(&state.pool, user.id, &query).await?))
}

pub(super) async fn clear_collection(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let removed = packs::clear_collection(&state.pool, user.id).await?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Serialize)]
pub(super) struct HistoryResponse {
    opens: Vec<PackOpenRecord>,
    ledger: Vec<LedgerEntry>,
    star_points: i64,
}

pub(super) async fn history(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<HistoryResponse>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    Ok(Json(HistoryResponse {
        opens: packs::history(&state.pool, user.id, HISTORY_LIMIT).await?,
        ledger: packs::ledger(&state.pool, user.id).await?,
        star_points: user.star_points,
    }))
}
