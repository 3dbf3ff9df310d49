use anyhow::Result;
use sqlx::SqlitePool;

use crate::catalog;
use crate::error::ShopError;
use crate::models::Review;

/// Parse a submitted rating: non-numeric or zero is rejected, anything
/// else is clamped into 1..=5.
pub fn parse_rating(raw: &str) -> Result<i64> {
    let rating = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|r| r.is_finite())
        .map(|r| r.round() as i64)
        .unwrap_or(0);
    if rating == 0 {
        return Err(ShopError::BadRequest("select a rating from 1 to 5".to_string()).into());
    }
    Ok(rating.clamp(1, 5))
}

/// Create or replace the user's review of a product.
pub async fn post_review(
    pool: &SqlitePool,
    product_id: i64,
    user_id: i64,
    rating: i64,
    comment: &str,
) -> Result<Review> {
    if catalog::get_product(pool, product_id).await?.is_none() {
        return Err(ShopError::NotFound(format!("product {}", product_id)).into());
    }
    let rating = parse_rating(&rating.to_string())?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO reviews (product_id, user_id, rating, comment, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, product_id) DO UPDATE SET
            rating = excluded.rating,
            comment = excluded.comment,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(product_id)
    .bind(user_id)
    .bind(rating)
    .bind(comment.trim())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_review(pool, product_id, user_id)
        .await?
        .ok_or_else(|| ShopError::NotFound("review".to_string()).into())
}

/// Returns whether a review existed.
pub async fn delete_review(pool: &SqlitePool, product_id: i64, user_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM reviews WHERE product_id = ? AND user_id = ?")
        .bind(product_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_review(pool: &SqlitePool, product_id: i64, user_id: i64) -> Result<Option<Review>> {
    let row = sqlx::query(
        r#"
        SELECT r.*, u.email
        FROM reviews r JOIN users u ON u.id = r.user_id
        WHERE r.product_id = ? AND r.user_id = ?
        "#,
    )
    .bind(product_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(Review::from_row))
}

/// Reviews of a product, newest first.
pub async fn list_for_product(pool: &SqlitePool, product_id: i64) -> Result<Vec<Review>> {
    let rows = sqlx::query(
        r#"
        SELECT r.*, u.email
        FROM reviews r JOIN users u ON u.id = r.user_id
        WHERE r.product_id = ?
        ORDER BY r.created_at DESC, r.id DESC
        "#,
    )
    .bind(product_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(Review::from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rating() {
        assert_eq!(parse_rating("4").unwrap(), 4);
        assert_eq!(parse_rating(" 9 ").unwrap(), 5);
        assert_eq!(parse_rating("-2").unwrap(), 1);
        assert!(parse_rating("0").is_err());
        assert!(parse_rating("five").is_err());
        assert!(parse_rating("").is_err());
        assert_eq!(parse_rating("4.5").unwrap(), 5);
        assert_eq!(parse_rating("3.2").unwrap(), 3);
        assert!(parse_rating("0.4").is_err());
        assert!(parse_rating("NaN").is_err());
    }
}
