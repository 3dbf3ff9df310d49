//! Checkout, order history and promo codes.
//!
//! A checkout is all-or-nothing: stock checks, the order row, its items,
//! stock decrements, promo usage and clearing the saved cart happen in one
//! SQLite transaction.

use anyhow::Result;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::cart;
use crate::error::ShopError;
use crate::models::{Order, OrderItem, PromoCode, User};
use crate::pricing::round2;
use crate::session::SessionData;

pub fn discount_for(total: f64, percent: i64) -> f64 {
    round2(total * percent as f64 / 100.0)
}

/// Look up a promo code, ignoring case.
pub async fn find_promo(pool: &SqlitePool, code: &str) -> Result<Option<PromoCode>> {
    let row = sqlx::query("SELECT * FROM promo_codes WHERE lower(code) = lower(?)")
        .bind(code.trim())
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(PromoCode::from_row))
}

/// Turn the signed-in user's cart into an order.
pub async fn checkout(
    pool: &SqlitePool,
    session: &mut SessionData,
    user: Option<&User>,
    promo_code: Option<&str>,
) -> Result<Order> {
    let user = user.ok_or(ShopError::Unauthorized)?;
    if session.user_id != Some(user.id) {
        return Err(ShopError::Unauthorized.into());
    }

    let view = cart::view(pool, session, Some(user)).await?;
    if view.lines.is_empty() {
        return Err(ShopError::BadRequest("your cart is empty".to_string()).into());
    }

    let now = chrono::Utc::now().timestamp();
    let promo = match promo_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => match find_promo(pool, code).await? {
            Some(p) if p.usable(now) => Some(p),
            _ => {
                return Err(
                    ShopError::BadRequest(format!("promo code {} is not valid", code)).into(),
                )
            }
        },
        None => None,
    };

    let total = round2(
        view.lines
            .iter()
            .map(|l| l.unit_price * l.quantity as f64)
            .sum(),
    );
    let discount = promo
        .as_ref()
        .map(|p| discount_for(total, p.percent))
        .unwrap_or(0.0);

    let mut tx = pool.begin().await?;

    for line in &view.lines {
        let stock: Option<i64> = sqlx::query_scalar("SELECT stock FROM products WHERE id = ?")
            .bind(line.product.id)
            .fetch_optional(&mut *tx)
            .await?;
        let available = stock.unwrap_or(0);
        if available < line.quantity {
            return Err(ShopError::OutOfStock {
                name: line.product.name.clone(),
                available,
                requested: line.quantity,
            }
            .into());
        }
    }

    let order_id = sqlx::query(
        r#"
        INSERT INTO orders (user_id, total, discount, promo_code, status, ship_name, ship_address, created_at)
        VALUES (?, ?, ?, ?, 'created', ?, ?, ?)
        "#,
    )
    .bind(user.id)
    .bind(total)
    .bind(discount)
    .bind(promo.as_ref().map(|p| p.code.clone()))
    .bind(&user.full_name)
    .bind(&user.ship_address)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for line in &view.lines {
        sqlx::query(
            r#"
            INSERT INTO order_items (order_id, product_id, product_name, unit_price, quantity)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(order_id)
        .bind(line.product.id)
        .bind(&line.product.name)
        .bind(line.unit_price)
        .bind(line.quantity)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query("UPDATE products SET stock = stock - ? WHERE id = ? AND stock >= ?")
            .bind(line.quantity)
            .bind(line.product.id)
            .bind(line.quantity)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(ShopError::OutOfStock {
                name: line.product.name.clone(),
                available: 0,
                requested: line.quantity,
            }
            .into());
        }
    }

    if let Some(promo) = &promo {
        let updated = sqlx::query(
            r#"
            UPDATE promo_codes SET used_count = used_count + 1
            WHERE id = ? AND (max_uses IS NULL OR used_count < max_uses)
            "#,
        )
        .bind(promo.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(
                ShopError::BadRequest(format!("promo code {} is not valid", promo.code)).into(),
            );
        }
    }

    sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(order_id, user_id = user.id, total, discount, "order created");
    get_order(pool, order_id)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("order {}", order_id)).into())
}

fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> Order {
    Order {
        id: row.get("id"),
        user_id: row.get("user_id"),
        total: row.get("total"),
        discount: row.get("discount"),
        promo_code: row.get("promo_code"),
        status: row.get("status"),
        ship_name: row.get("ship_name"),
        ship_address: row.get("ship_address"),
        created_at: row.get("created_at"),
        items: Vec::new(),
    }
}

async fn load_items(pool: &SqlitePool, order_id: i64) -> Result<Vec<OrderItem>> {
    let rows = sqlx::query(
        "SELECT product_id, product_name, unit_price, quantity FROM order_items \
         WHERE order_id = ? ORDER BY id",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| OrderItem {
            product_id: row.get("product_id"),
            product_name: row.get("product_name"),
            unit_price: row.get("unit_price"),
            quantity: row.get("quantity"),
        })
        .collect())
}

pub async fn get_order(pool: &SqlitePool, order_id: i64) -> Result<Option<Order>> {
    let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
        .bind(order_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let mut order = order_from_row(&row);
            order.items = load_items(pool, order.id).await?;
            Ok(Some(order))
        }
        None => Ok(None),
    }
}

/// A user's orders with their items, newest first.
pub async fn list_orders(pool: &SqlitePool, user_id: i64) -> Result<Vec<Order>> {
    let rows = sqlx::query("SELECT * FROM orders WHERE user_id = ? ORDER BY created_at DESC, id DESC")
        .bind(user_id)
        .fetch_all(pool)
        .await?;

    let mut orders = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut order = order_from_row(row);
        order.items = load_items(pool, order.id).await?;
        orders.push(order);
    }
    Ok(orders)
}

// ============ Admin promos ============

#[derive(Debug, Clone, Deserialize)]
pub struct NewPromo {
    pub code: String,
    pub percent: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub max_uses: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

fn default_active() -> bool {
    true
}

pub async fn create_promo(pool: &SqlitePool, input: &NewPromo) -> Result<PromoCode> {
    let code = input.code.trim();
    if code.is_empty() {
        return Err(ShopError::BadRequest("promo code is required".to_string()).into());
    }
    if !(1..=100).contains(&input.percent) {
        return Err(ShopError::BadRequest("percent must be between 1 and 100".to_string()).into());
    }
    if input.max_uses.is_some_and(|m| m < 0) {
        return Err(ShopError::BadRequest("max_uses must be non-negative".to_string()).into());
    }
    if find_promo(pool, code).await?.is_some() {
        return Err(ShopError::Conflict(format!("promo code {} already exists", code)).into());
    }

    sqlx::query(
        "INSERT INTO promo_codes (code, percent, active, max_uses, used_count, expires_at) \
         VALUES (?, ?, ?, ?, 0, ?)",
    )
    .bind(code)
    .bind(input.percent)
    .bind(input.active as i64)
    .bind(input.max_uses)
    .bind(input.expires_at)
    .execute(pool)
    .await?;

    info!(code, percent = input.percent, "created promo code");
    find_promo(pool, code)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("promo {}", code)).into())
}

pub async fn list_promos(pool: &SqlitePool) -> Result<Vec<PromoCode>> {
    let rows = sqlx::query("SELECT * FROM promo_codes ORDER BY id DESC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(PromoCode::from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discount_rounding() {
        assert_eq!(discount_for(100.0, 10), 10.0);
        assert_eq!(discount_for(33.33, 15), 5.0);
        assert_eq!(discount_for(19.99, 0), 0.0);
    }
}
