//! Shopping cart with two backends.
//!
//! Signed-in shoppers keep their cart in `cart_items`; guests keep it in the
//! session as a product id → quantity map. Every operation picks the backend
//! from the session, so callers never branch on it. Quantities are capped at
//! [`MAX_QTY`] per line.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::catalog;
use crate::error::ShopError;
use crate::models::{CartLine, Product, User, PRODUCT_COLUMNS};
use crate::pricing;
use crate::session::SessionData;

pub const MAX_QTY: i64 = 99;

#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub lines: Vec<CartLine>,
    pub total: f64,
    pub count: i64,
}

/// Add `qty` (clamped to 1..=99) of a product; returns the new line quantity.
pub async fn add(
    pool: &SqlitePool,
    session: &mut SessionData,
    product_id: i64,
    qty: i64,
) -> Result<i64> {
    if catalog::get_product(pool, product_id).await?.is_none() {
        return Err(ShopError::NotFound(format!("product {}", product_id)).into());
    }
    let qty = qty.clamp(1, MAX_QTY);

    match session.user_id {
        Some(user_id) => {
            let now = chrono::Utc::now().timestamp();
            sqlx::query(
                r#"
                INSERT INTO cart_items (user_id, product_id, quantity, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(user_id, product_id) DO UPDATE SET
                    quantity = MIN(?, cart_items.quantity + excluded.quantity),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(product_id)
            .bind(qty)
            .bind(now)
            .bind(MAX_QTY)
            .execute(pool)
            .await?;

            let row = sqlx::query(
                "SELECT quantity FROM cart_items WHERE user_id = ? AND product_id = ?",
            )
            .bind(user_id)
            .bind(product_id)
            .fetch_one(pool)
            .await?;
            Ok(row.get("quantity"))
        }
        None => {
            let line = session.cart.entry(product_id).or_insert(0);
            *line = (*line + qty).min(MAX_QTY);
            Ok(*line)
        }
    }
}

/// Set several line quantities at once (clamped to 0..=99, 0 removes).
/// Unknown products are ignored.
pub async fn update(
    pool: &SqlitePool,
    session: &mut SessionData,
    updates: &[(i64, i64)],
) -> Result<()> {
    match session.user_id {
        Some(user_id) => {
            let now = chrono::Utc::now().timestamp();
            let mut tx = pool.begin().await?;
            for &(product_id, qty) in updates {
                let qty = qty.clamp(0, MAX_QTY);
                if qty == 0 {
                    sqlx::query("DELETE FROM cart_items WHERE user_id = ? AND product_id = ?")
                        .bind(user_id)
                        .bind(product_id)
                        .execute(&mut *tx)
                        .await?;
                    continue;
                }
                let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM products WHERE id = ?")
                    .bind(product_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                if exists.is_none() {
                    continue;
                }
                sqlx::query(
                    r#"
                    INSERT INTO cart_items (user_id, product_id, quantity, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(user_id, product_id) DO UPDATE SET
                        quantity = excluded.quantity,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(user_id)
                .bind(product_id)
                .bind(qty)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        None => {
            for &(product_id, qty) in updates {
                let qty = qty.clamp(0, MAX_QTY);
                if qty == 0 {
                    session.cart.remove(&product_id);
                } else if catalog::get_product(pool, product_id).await?.is_some() {
                    session.cart.insert(product_id, qty);
                }
            }
        }
    }
    Ok(())
}

/// Remove one line; returns whether it was present.
pub async fn remove(pool: &SqlitePool, session: &mut SessionData, product_id: i64) -> Result<bool> {
    match session.user_id {
        Some(user_id) => {
            let result = sqlx::query("DELETE FROM cart_items WHERE user_id = ? AND product_id = ?")
                .bind(user_id)
                .bind(product_id)
                .execute(pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }
        None => Ok(session.cart.remove(&product_id).is_some()),
    }
}

pub async fn clear(pool: &SqlitePool, session: &mut SessionData) -> Result<()> {
    match session.user_id {
        Some(user_id) => {
            sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
                .bind(user_id)
                .execute(pool)
                .await?;
        }
        None => session.cart.clear(),
    }
    Ok(())
}

/// Fold a guest cart into a user's saved cart, capping each line at 99.
pub async fn merge_session_into_user(
    pool: &SqlitePool,
    user_id: i64,
    guest_cart: &BTreeMap<i64, i64>,
) -> Result<()> {
    if guest_cart.is_empty() {
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    for (&product_id, &qty) in guest_cart {
        let qty = qty.clamp(0, MAX_QTY);
        if qty == 0 {
            continue;
        }
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO cart_items (user_id, product_id, quantity, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, product_id) DO UPDATE SET
                quantity = MIN(?, cart_items.quantity + excluded.quantity),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(product_id)
        .bind(qty)
        .bind(now)
        .bind(MAX_QTY)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Products and quantities in the cart, in insertion order for saved carts
/// and product id order for guest carts. Vanished products are skipped.
pub async fn items(pool: &SqlitePool, session: &SessionData) -> Result<Vec<(Product, i64)>> {
    match session.user_id {
        Some(user_id) => {
            let sql = format!(
                "SELECT {}, c.quantity AS cart_quantity FROM cart_items c \
                 JOIN products p ON p.id = c.product_id \
                 WHERE c.user_id = ? ORDER BY c.id",
                PRODUCT_COLUMNS
            );
            let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;
            Ok(rows
                .iter()
                .map(|row| (Product::from_row(row), row.get("cart_quantity")))
                .collect())
        }
        None => {
            let mut out = Vec::with_capacity(session.cart.len());
            for (&product_id, &qty) in &session.cart {
                if let Some(product) = catalog::get_product(pool, product_id).await? {
                    out.push((product, qty));
                }
            }
            Ok(out)
        }
    }
}

/// Cart lines priced dynamically for `user`, with the rounded total.
pub async fn view(pool: &SqlitePool, session: &SessionData, user: Option<&User>) -> Result<CartView> {
    let mut lines = Vec::new();
    let mut total = 0.0;
    let mut count = 0;

    for (product, quantity) in items(pool, session).await? {
        let quote = pricing::price_for(pool, &product, user).await?;
        let subtotal = pricing::round2(quote.price * quantity as f64);
        total += quote.price * quantity as f64;
        count += quantity;
        lines.push(CartLine {
            product,
            quantity,
            unit_price: quote.price,
            subtotal,
        });
    }

    Ok(CartView {
        lines,
        total: pricing::round2(total),
        count,
    })
}

/// Total quantity across all lines.
pub async fn count(pool: &SqlitePool, session: &SessionData) -> Result<i64> {
    match session.user_id {
        Some(user_id) => {
            let row = sqlx::query(
                "SELECT COALESCE(SUM(quantity), 0) AS n FROM cart_items WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_one(pool)
            .await?;
            Ok(row.get("n"))
        }
        None => Ok(session.cart.values().sum()),
    }
}
