use anyhow::Result;
use sqlx::SqlitePool;

use crate::catalog;
use crate::error::ShopError;
use crate::models::{Product, PRODUCT_COLUMNS};

/// Add a product; returns `false` when it was already listed.
pub async fn add(pool: &SqlitePool, user_id: i64, product_id: i64) -> Result<bool> {
    if catalog::get_product(pool, product_id).await?.is_none() {
        return Err(ShopError::NotFound(format!("product {}", product_id)).into());
    }
    let result = sqlx::query(
        "INSERT OR IGNORE INTO wishlist (user_id, product_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(product_id)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove a product; returns whether it was listed.
pub async fn remove(pool: &SqlitePool, user_id: i64, product_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM wishlist WHERE user_id = ? AND product_id = ?")
        .bind(user_id)
        .bind(product_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn contains(pool: &SqlitePool, user_id: i64, product_id: i64) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT id FROM wishlist WHERE user_id = ? AND product_id = ?")
            .bind(user_id)
            .bind(product_id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

/// Wishlisted products, most recently added first.
pub async fn list(pool: &SqlitePool, user_id: i64) -> Result<Vec<Product>> {
    let sql = format!(
        "SELECT {} FROM wishlist w JOIN products p ON p.id = w.product_id \
         WHERE w.user_id = ? ORDER BY w.created_at DESC, w.id DESC",
        PRODUCT_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;
    Ok(rows.iter().map(Product::from_row).collect())
}
