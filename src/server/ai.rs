//! Semantic search, question answering and the chat session.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AppError, AppState, Session};
use crate::assistant::{Answer, AskMode, ChatHealth, RenderedTurn};
use crate::models::ScoredProduct;
use crate::search::SearchFilters;

#[derive(Deserialize)]
pub(super) struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, rename = "type")]
    poke_type: Option<String>,
}

pub(super) async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<ScoredProduct>>, AppError> {
    let filters = SearchFilters {
        category: params.category,
        poke_type: params.poke_type,
    };
    Ok(Json(state.assistant.search(&params.q, &filters).await?))
}

#[derive(Deserialize)]
pub(super) struct AskForm {
    question: String,
    #[serde(default)]
    mode: AskMode,
}

pub(super) async fn ask(
    State(state): State<AppState>,
    Json(form): Json<AskForm>,
) -> Result<Json<Answer>, AppError> {
    Ok(Json(state.assistant.ask(&form.question, form.mode).await?))
}

#[derive(Deserialize)]
pub(super) struct ProductQuestion {
    question: String,
}

pub(super) async fn ask_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(form): Json<ProductQuestion>,
) -> Result<Json<Value>, AppError> {
    let answer = state.assistant.ask_about_product(id, &form.question).await?;
    Ok(Json(json!({ "answer": answer })))
}

// ============ Chat session ============

#[derive(Serialize)]
pub(super) struct ChatResponse {
    reply: Option<RenderedTurn>,
    history: Vec<RenderedTurn>,
}

pub(super) async fn chat_history(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<ChatResponse>, AppError> {
    let data = session.data.lock().await;
    let history = state.assistant.render_history(&data.chat).await?;
    Ok(Json(ChatResponse {
        reply: None,
        history,
    }))
}

#[derive(Deserialize)]
pub(super) struct ChatForm {
    message: String,
}

pub(super) async fn chat_send(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(form): Json<ChatForm>,
) -> Result<Json<ChatResponse>, AppError> {
    let mut data = session.data.lock().await;
    let reply = state.assistant.send(&mut data.chat, &form.message).await?;
    let reply = state
        .assistant
        .render_history(std::slice::from_ref(&reply))
        .await?
        .into_iter()
        .next();
    let history = state.assistant.render_history(&data.chat).await?;
    Ok(Json(ChatResponse { reply, history }))
}

pub(super) async fn chat_reset(Extension(session): Extension<Session>) -> Json<ChatResponse> {
    session.data.lock().await.chat.clear();
    Json(ChatResponse {
        reply: None,
        history: Vec::new(),
    })
}

pub(super) async fn chat_health(State(state): State<AppState>) -> Json<ChatHealth> {
    Json(state.assistant.chat_health().await)
}
