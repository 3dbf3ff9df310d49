//! Admin-only endpoints: products, promo codes and pack rules.

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use tracing::warn;

use super::{bad_request, require_admin, AppError, AppState, Session};
use crate::auth;
use crate::catalog::{self, ProductUpdate};
use crate::checkout::{self, NewPromo};
use crate::embed_cmd;
use crate::error::ShopError;
use crate::models::{NewProduct, PackAllowance, PackRule, Product, PromoCode};
use crate::packs::{self, RuleUpdate};

/// Drop cached facets and refresh the product's vector after a write.
async fn after_product_write(state: &AppState, product: &Product) {
    state.facets.invalidate().await;
    if let Err(e) = embed_cmd::upsert_product_embedding(&state.pool, &state.embedder, product).await
    {
        warn!(product_id = product.id, error = %e, "failed to refresh product embedding");
    }
}

pub(super) async fn list_products(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<Product>>, AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    Ok(Json(catalog::list_products_admin(&state.pool).await?))
}

pub(super) async fn create_product(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(input): Json<NewProduct>,
) -> Result<(StatusCode, Json<Product>), AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    let product = catalog::create_product(&state.pool, &input).await?;
    after_product_write(&state, &product).await;
    Ok((StatusCode::CREATED, Json(product)))
}

pub(super) async fn update_product(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
    Json(update): Json<ProductUpdate>,
) -> Result<Json<Product>, AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    let product = catalog::update_product(&state.pool, id, &update).await?;
    after_product_write(&state, &product).await;
    Ok(Json(product))
}

/// Multipart upload; the first part carrying a file name is the image.
pub(super) async fn upload_image(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<Product>, AppError> {
    require_admin(&state, &*session.data.lock().await).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(e.to_string()))?;
        if bytes.is_empty() {
            return Err(bad_request("uploaded file is empty"));
        }
        if bytes.len() > state.config.server.max_upload_bytes {
            return Err(bad_request(format!(
                "image exceeds {} bytes",
                state.config.server.max_upload_bytes
            )));
        }

        let product = catalog::attach_image(
            &state.pool,
            &state.config.server.upload_dir,
            id,
            &filename,
            &bytes,
        )
        .await?;
        state.facets.invalidate().await;
        return Ok(Json(product));
    }

    Err(bad_request("no image file in upload"))
}

pub(super) async fn list_promos(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<PromoCode>>, AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    Ok(Json(checkout::list_promos(&state.pool).await?))
}

pub(super) async fn create_promo(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(input): Json<NewPromo>,
) -> Result<(StatusCode, Json<PromoCode>), AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    let promo = checkout::create_promo(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(promo)))
}

pub(super) async fn upsert_pack_rule(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(set): Path<String>,
    Json(update): Json<RuleUpdate>,
) -> Result<Json<PackRule>, AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    let rule = packs::upsert_rule(&state.pool, &state.config.packs, &set, &update).await?;
    Ok(Json(rule))
}

#[derive(Deserialize)]
pub(super) struct TokenGrant {
    email: String,
    tokens: i64,
}

pub(super) async fn grant_tokens(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(set): Path<String>,
    Json(grant): Json<TokenGrant>,
) -> Result<Json<PackAllowance>, AppError> {
    require_admin(&state, &*session.data.lock().await).await?;
    let user = auth::get_user_by_email(&state.pool, &grant.email)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("user {}", grant.email.trim())))?;
    let allowance = packs::grant_tokens(&state.pool, user.id, &set, grant.tokens).await?;
    Ok(Json(allowance))
}
