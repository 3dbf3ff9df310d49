//! Accounts, catalog, reviews, wishlist, cart and checkout endpoints.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{bad_request, current_user, require_user, AppError, AppState, Session};
use crate::auth::{self, RegisterInput};
use crate::cart::{self, CartView};
use crate::catalog::{self, CatalogPage, CatalogQuery, Facets, ProductDetail};
use crate::checkout;
use crate::models::{Order, Product, Review, User};
use crate::reviews;
use crate::wishlist;

// ============ Accounts ============

#[derive(Serialize)]
pub(super) struct MeResponse {
    user: Option<User>,
    cart_count: i64,
}

/// Create an account and sign it in on the current session.
pub(super) async fn register(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(input): Json<RegisterInput>,
) -> Result<(StatusCode, Json<User>), AppError> {
    auth::register(&state.pool, &input).await?;
    let mut data = session.data.lock().await;
    let user = auth::login(&state.pool, &mut data, &input.email, &input.password).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
pub(super) struct LoginForm {
    email: String,
    password: String,
}

pub(super) async fn login(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(form): Json<LoginForm>,
) -> Result<Json<User>, AppError> {
    let mut data = session.data.lock().await;
    let user = auth::login(&state.pool, &mut data, &form.email, &form.password).await?;
    Ok(Json(user))
}

pub(super) async fn logout(Extension(session): Extension<Session>) -> Json<Value> {
    auth::logout(&mut *session.data.lock().await);
    Json(json!({ "ok": true }))
}

pub(super) async fn me(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<MeResponse>, AppError> {
    let data = session.data.lock().await;
    let user = current_user(&state, &data).await?;
    let cart_count = cart::count(&state.pool, &data).await?;
    Ok(Json(MeResponse { user, cart_count }))
}

#[derive(Deserialize)]
pub(super) struct FavoritesForm {
    types: Vec<String>,
}

pub(super) async fn set_favorites(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(form): Json<FavoritesForm>,
) -> Result<Json<Value>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let favorites = auth::set_favorite_types(&state.pool, user.id, &form.types).await?;
    Ok(Json(json!({ "favorite_types": favorites })))
}

// ============ Catalog ============

pub(super) async fn list_products(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<CatalogPage>, AppError> {
    let data = session.data.lock().await;
    let user = current_user(&state, &data).await?;
    let page = catalog::list_products(
        &state.pool,
        &query,
        user.as_ref(),
        state.config.catalog.per_page,
        Some(&state.facets),
    )
    .await?;
    Ok(Json(page))
}

pub(super) async fn product_detail(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
) -> Result<Json<ProductDetail>, AppError> {
    let data = session.data.lock().await;
    let user = current_user(&state, &data).await?;
    let detail = catalog::product_detail(&state.pool, id, user.as_ref()).await?;
    Ok(Json(detail))
}

pub(super) async fn facets(State(state): State<AppState>) -> Result<Json<Facets>, AppError> {
    Ok(Json(state.facets.get(&state.pool).await?))
}

// ============ Reviews ============

#[derive(Deserialize)]
pub(super) struct ReviewForm {
    #[serde(default)]
    rating: Value,
    #[serde(default)]
    comment: String,
}

/// Ratings arrive as numbers or strings; anything else counts as missing.
fn rating_from(value: &Value) -> Result<i64, AppError> {
    match value {
        Value::Number(n) => Ok(reviews::parse_rating(&n.to_string())?),
        Value::String(s) => Ok(reviews::parse_rating(s)?),
        _ => Ok(0),
    }
}

pub(super) async fn post_review(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
    Json(form): Json<ReviewForm>,
) -> Result<Json<Review>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let rating = rating_from(&form.rating)?;
    let review = reviews::post_review(&state.pool, id, user.id, rating, &form.comment).await?;
    Ok(Json(review))
}

pub(super) async fn delete_review(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let deleted = reviews::delete_review(&state.pool, id, user.id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

// ============ Wishlist ============

pub(super) async fn wishlist(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<Product>>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    Ok(Json(wishlist::list(&state.pool, user.id).await?))
}

pub(super) async fn wishlist_add(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let added = wishlist::add(&state.pool, user.id, id).await?;
    Ok(Json(json!({ "added": added })))
}

pub(super) async fn wishlist_remove(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    let removed = wishlist::remove(&state.pool, user.id, id).await?;
    Ok(Json(json!({ "removed": removed })))
}

// ============ Cart ============

async fn cart_response(state: &AppState, session: &Session) -> Result<Json<CartView>, AppError> {
    let data = session.data.lock().await;
    let user = current_user(state, &data).await?;
    Ok(Json(cart::view(&state.pool, &data, user.as_ref()).await?))
}

pub(super) async fn cart_view(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<CartView>, AppError> {
    cart_response(&state, &session).await
}

#[derive(Deserialize)]
pub(super) struct CartItemForm {
    product_id: i64,
    #[serde(default = "default_quantity")]
    quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

pub(super) async fn cart_add(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(form): Json<CartItemForm>,
) -> Result<Json<Value>, AppError> {
    let mut data = session.data.lock().await;
    let quantity = cart::add(&state.pool, &mut data, form.product_id, form.quantity).await?;
    let count = cart::count(&state.pool, &data).await?;
    Ok(Json(json!({ "quantity": quantity, "count": count })))
}

#[derive(Deserialize)]
pub(super) struct CartUpdateForm {
    items: Vec<CartItemForm>,
}

pub(super) async fn cart_update(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(form): Json<CartUpdateForm>,
) -> Result<Json<CartView>, AppError> {
    let updates: Vec<(i64, i64)> = form
        .items
        .iter()
        .map(|i| (i.product_id, i.quantity))
        .collect();
    {
        let mut data = session.data.lock().await;
        cart::update(&state.pool, &mut data, &updates).await?;
    }
    cart_response(&state, &session).await
}

pub(super) async fn cart_clear(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<CartView>, AppError> {
    {
        let mut data = session.data.lock().await;
        cart::clear(&state.pool, &mut data).await?;
    }
    cart_response(&state, &session).await
}

pub(super) async fn cart_remove(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let mut data = session.data.lock().await;
    let removed = cart::remove(&state.pool, &mut data, id).await?;
    Ok(Json(json!({ "removed": removed })))
}

// ============ Checkout ============

#[derive(Deserialize, Default)]
pub(super) struct CheckoutForm {
    #[serde(default)]
    promo_code: Option<String>,
}

pub(super) async fn checkout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<(StatusCode, Json<Order>), AppError> {
    // The body is optional: no promo code means an empty request.
    let form: CheckoutForm = if body.iter().all(u8::is_ascii_whitespace) {
        CheckoutForm::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?
    };
    let mut data = session.data.lock().await;
    let user = current_user(&state, &data).await?;
    let order = checkout::checkout(
        &state.pool,
        &mut data,
        user.as_ref(),
        form.promo_code.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub(super) async fn orders(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<Order>>, AppError> {
    let data = session.data.lock().await;
    let user = require_user(&state, &data).await?;
    Ok(Json(checkout::list_orders(&state.pool, user.id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_from_json() {
        assert_eq!(rating_from(&json!(4)).ok(), Some(4));
        assert_eq!(rating_from(&json!("5")).ok(), Some(5));
        assert_eq!(rating_from(&Value::Null).ok(), Some(0));
        assert!(rating_from(&json!("zero")).is_err());
        assert_eq!(rating_from(&json!(4.5)).ok(), Some(5));
        assert_eq!(rating_from(&json!(9.7)).ok(), Some(5));
        assert_eq!(rating_from(&json!(2.0)).ok(), Some(2));
        assert!(rating_from(&json!(0)).is_err());
    }
}
