//! HTTP JSON API.
//!
//! Every storefront operation is exposed as a JSON endpoint on one axum
//! router. Browser state lives server-side: a session middleware loads the
//! session row named by the session cookie, hands it to handlers through a
//! request extension and persists it afterwards when a handler changed it.
//! Anonymous requests that change nothing never get a row or a cookie, and
//! signing in or out moves the session to a fresh id.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/auth/register`, `/auth/login`, `/auth/logout` | Accounts |
//! | `GET`  | `/auth/me` | Signed-in user and cart size |
//! | `PUT`  | `/auth/favorites` | Favorite types used for pricing |
//! | `GET`  | `/products`, `/products/{id}`, `/facets` | Catalog |
//! | `POST`/`DELETE` | `/products/{id}/review` | Reviews |
//! | `GET`  | `/wishlist`; `POST`/`DELETE` `/wishlist/{id}` | Wishlist |
//! | `GET`/`PUT`/`DELETE` | `/cart`; `POST` `/cart/items`; `DELETE` `/cart/items/{id}` | Cart |
//! | `POST` | `/checkout`; `GET` `/orders` | Orders |
//! | `GET`  | `/ai/search` | Semantic search |
//! | `POST` | `/ai/ask`, `/ai/products/{id}/ask` | Assistant |
//! | `GET`/`POST`/`DELETE` | `/ai/chat`; `GET` `/ai/chat/health` | Chat session |
//! | `GET`  | `/packs`, `/packs/collection`, `/packs/history` | Packs |
//! | `POST` | `/packs/{set}/open`; `DELETE` `/packs/collection` | Packs |
//! | `*`    | `/admin/...` | Products, promos and pack rules (admins only) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "out_of_stock", "message": "not enough stock for ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` and `invalid_credentials`
//! (401), `forbidden` (403), `not_found` (404), `conflict`, `out_of_stock`
//! and `pack_unavailable` (409), `internal` (500).

mod admin;
mod ai;
mod packs;
mod shop;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::assistant::Assistant;
use crate::auth;
use crate::catalog::FacetsCache;
use crate::chat::{create_chat_model, ChatModel};
use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::error::ShopError;
use crate::migrate;
use crate::models::User;
use crate::session::{self, SessionData};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub facets: Arc<FacetsCache>,
    pub embedder: Arc<Embedder>,
    pub assistant: Assistant,
}

impl AppState {
    /// Wire the services together. `chat` overrides the configured chat
    /// model; pass `None` to use `[chat]` from the config.
    pub fn new(
        config: Config,
        pool: SqlitePool,
        chat: Option<Arc<dyn ChatModel>>,
    ) -> anyhow::Result<Self> {
        let chat = match chat {
            Some(chat) => Some(chat),
            None => create_chat_model(&config.chat)?,
        };
        let embedder = Arc::new(Embedder::new(&config.embedding)?);
        let assistant = Assistant::new(
            pool.clone(),
            embedder.clone(),
            chat,
            config.assistant.clone(),
        );
        Ok(Self {
            facets: Arc::new(FacetsCache::new(Duration::from_secs(
                config.catalog.facets_ttl_secs,
            ))),
            config: Arc::new(config),
            pool,
            embedder,
            assistant,
        })
    }
}

/// Starts the HTTP server.
///
/// Opens (and migrates) the database, binds to `[server].bind` and serves
/// until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    std::fs::create_dir_all(&config.server.upload_dir)?;
    let ttl_secs = config.server.session_ttl_days.saturating_mul(86_400);
    let pruned = session::prune(&pool, ttl_secs).await?;
    if pruned > 0 {
        info!(pruned, "expired sessions removed");
    }

    let bind_addr = config.server.bind.clone();
    let state = AppState::new(config.clone(), pool, None)?;
    let chat_enabled = state.assistant.chat_enabled();
    let app = build_router(state);

    println!("PokeShop listening on http://{}", bind_addr);
    info!(bind = %bind_addr, chat_enabled, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let upload_dir = state.config.server.upload_dir.clone();
    let upload_limit = state.config.server.max_upload_bytes + 64 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let packs = Router::new()
        .route("/packs", get(packs::list_sets))
        .route("/packs/{set}/open", post(packs::open))
        .route(
            "/packs/collection",
            get(packs::collection).delete(packs::clear_collection),
        )
        .route("/packs/history", get(packs::history))
        .layer(middleware::map_response(no_store));

    let api = Router::new()
        // accounts
        .route("/auth/register", post(shop::register))
        .route("/auth/login", post(shop::login))
        .route("/auth/logout", post(shop::logout))
        .route("/auth/me", get(shop::me))
        .route("/auth/favorites", put(shop::set_favorites))
        // catalog
        .route("/products", get(shop::list_products))
        .route("/products/{id}", get(shop::product_detail))
        .route(
            "/products/{id}/review",
            post(shop::post_review).delete(shop::delete_review),
        )
        .route("/facets", get(shop::facets))
        .route("/wishlist", get(shop::wishlist))
        .route(
            "/wishlist/{id}",
            post(shop::wishlist_add).delete(shop::wishlist_remove),
        )
        // cart & orders
        .route(
            "/cart",
            get(shop::cart_view)
                .put(shop::cart_update)
                .delete(shop::cart_clear),
        )
        .route("/cart/items", post(shop::cart_add))
        .route("/cart/items/{id}", delete(shop::cart_remove))
        .route("/checkout", post(shop::checkout))
        .route("/orders", get(shop::orders))
        // assistant
        .route("/ai/search", get(ai::search))
        .route("/ai/ask", post(ai::ask))
        .route("/ai/products/{id}/ask", post(ai::ask_product))
        .route(
            "/ai/chat",
            get(ai::chat_history)
                .post(ai::chat_send)
                .delete(ai::chat_reset),
        )
        .route("/ai/chat/health", get(ai::chat_health))
        // admin
        .route(
            "/admin/products",
            get(admin::list_products).post(admin::create_product),
        )
        .route("/admin/products/{id}", patch(admin::update_product))
        .route(
            "/admin/products/{id}/image",
            post(admin::upload_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/admin/promos",
            get(admin::list_promos).post(admin::create_promo),
        )
        .route("/admin/packs/{set}", put(admin::upsert_pack_rule))
        .route("/admin/packs/{set}/tokens", post(admin::grant_tokens))
        .merge(packs)
        .layer(middleware::from_fn_with_state(state.clone(), session_layer));

    Router::new()
        .route("/health", get(handle_health))
        .merge(api)
        .nest_service("/uploads", ServeDir::new(upload_dir))
        .layer(cors)
        .with_state(state)
}

// ============ Sessions ============

/// The request's session, shared between the middleware and the handler.
#[derive(Clone)]
pub struct Session {
    pub data: Arc<Mutex<SessionData>>,
}

async fn session_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let cookie_name = state.config.server.session_cookie.clone();
    let presented = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| session::cookie_value(h, &cookie_name))
        .map(str::to_string);

    let existing = match presented {
        Some(id) => match session::load(&state.pool, &id).await {
            Ok(Some(data)) => Some((id, data)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "discarding unreadable session");
                None
            }
        },
        None => None,
    };

    let (id, before) = match existing {
        Some((id, data)) => (Some(id), data),
        None => (None, SessionData::default()),
    };

    let handle = Session {
        data: Arc::new(Mutex::new(before.clone())),
    };
    req.extensions_mut().insert(handle.clone());

    let mut response = next.run(req).await;

    let after = handle.data.lock().await.clone();
    if after == before {
        return Ok(response);
    }

    match id {
        Some(id) if after.user_id == before.user_id => {
            session::save(&state.pool, &id, &after).await?;
        }
        old => {
            if let Some(old) = old {
                session::delete(&state.pool, &old).await?;
                debug!("session id rotated");
            }
            let cookie = if after == SessionData::default() {
                session::expired_cookie_header(&cookie_name)
            } else {
                let new_id = session::create(&state.pool, &after).await?;
                session::set_cookie_header(&cookie_name, &new_id)
            };
            let cookie = HeaderValue::from_str(&cookie).map_err(anyhow::Error::from)?;
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }

    Ok(response)
}

async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// The signed-in user of a session, if any.
async fn current_user(state: &AppState, data: &SessionData) -> Result<Option<User>, AppError> {
    match data.user_id {
        Some(id) => Ok(auth::get_user(&state.pool, id).await?),
        None => Ok(None),
    }
}

async fn require_user(state: &AppState, data: &SessionData) -> Result<User, AppError> {
    current_user(state, data)
        .await?
        .ok_or_else(|| AppError::from(ShopError::Unauthorized))
}

async fn require_admin(state: &AppState, data: &SessionData) -> Result<User, AppError> {
    let user = require_user(state, data).await?;
    if !user.is_admin {
        return Err(ShopError::Forbidden.into());
    }
    Ok(user)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn status_for(err: &ShopError) -> StatusCode {
    match err {
        ShopError::NotFound(_) => StatusCode::NOT_FOUND,
        ShopError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ShopError::Unauthorized | ShopError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        ShopError::Forbidden => StatusCode::FORBIDDEN,
        ShopError::Conflict(_) | ShopError::OutOfStock { .. } | ShopError::PackUnavailable(_) => {
            StatusCode::CONFLICT
        }
    }
}

/// Domain errors keep their status; anything else is logged and hidden
/// behind a 500.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        if let Some(shop) = err.downcast_ref::<ShopError>() {
            return AppError {
                status: status_for(shop),
                code: shop.code().to_string(),
                message: shop.to_string(),
            };
        }
        error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: "internal server error".to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_keep_status() {
        let err = AppError::from(anyhow::Error::from(ShopError::OutOfStock {
            name: "Pikachu".to_string(),
            available: 1,
            requested: 2,
        }));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "out_of_stock");

        let err = AppError::from(ShopError::InvalidCredentials);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_context_wrapped_domain_error() {
        use anyhow::Context;
        let res: anyhow::Result<()> = Err(ShopError::NotFound("product 9".to_string()))
            .context("loading product page");
        let err = AppError::from(res.unwrap_err());
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err = AppError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal server error");
    }
}
