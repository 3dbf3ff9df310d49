//! Dynamic pricing rule engine.
//!
//! Prices are adjusted by explainable rules only. Each rule contributes a
//! whole-percent adjustment and a human-readable reason:
//!
//! | Rule | Adjustment |
//! |------|------------|
//! | product type is a favorite of the user | +10% |
//! | product type is not a favorite | −5% |
//! | each unit of the same type bought before | +2% (max +10%) |
//! | viewed but never bought | −3% |
//! | stock ≤ 5 | +12% |
//! | stock ≥ 50 | −8% |
//!
//! The result is rounded to cents and clamped to [50%, 180%] of the base.
//! [`quote`] is pure; [`gather_signals`] reads the user's history.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::models::{Product, User};

const FAVORITE_PCT: i64 = 10;
const NOT_FAVORITE_PCT: i64 = -5;
const SAME_TYPE_PCT_PER_UNIT: i64 = 2;
const SAME_TYPE_PCT_CAP: i64 = 10;
const SEEN_NOT_BOUGHT_PCT: i64 = -3;
const LOW_STOCK: i64 = 5;
const LOW_STOCK_PCT: i64 = 12;
const HIGH_STOCK: i64 = 50;
const HIGH_STOCK_PCT: i64 = -8;
const FLOOR: f64 = 0.50;
const CEILING: f64 = 1.80;

/// Personal history of a signed-in shopper relative to one product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserSignals {
    pub is_favorite: bool,
    pub purchases_same_type: i64,
    pub seen_not_bought: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingSignals {
    pub base_price: f64,
    pub stock: i64,
    pub poke_type: String,
    /// `None` for guests.
    pub user: Option<UserSignals>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceFeatures {
    pub base_price: f64,
    pub stock: i64,
    pub poke_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchases_same_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seen_not_bought: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub price: f64,
    pub reasons: Vec<String>,
    pub features: PriceFeatures,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn quote(signals: &PricingSignals) -> PriceQuote {
    let base = signals.base_price;
    let mut pct: i64 = 0;
    let mut reasons = Vec::new();
    let mut features = PriceFeatures {
        base_price: base,
        stock: signals.stock,
        poke_type: signals.poke_type.clone(),
        purchases_same_type: None,
        seen_not_bought: None,
    };

    match signals.user {
        Some(user) => {
            if user.is_favorite {
                pct += FAVORITE_PCT;
                reasons.push(format!("Favorite type (+{}%)", FAVORITE_PCT));
            } else {
                pct += NOT_FAVORITE_PCT;
                reasons.push(format!("Not a favorite type ({}%)", NOT_FAVORITE_PCT));
            }

            let bump = (SAME_TYPE_PCT_PER_UNIT * user.purchases_same_type.max(0)).min(SAME_TYPE_PCT_CAP);
            if bump > 0 {
                pct += bump;
                reasons.push(format!("Same-type purchase history (+{}%)", bump));
            }
            features.purchases_same_type = Some(user.purchases_same_type);

            if user.seen_not_bought {
                pct += SEEN_NOT_BOUGHT_PCT;
                reasons.push(format!("Viewed but not bought ({}%)", SEEN_NOT_BOUGHT_PCT));
            }
            features.seen_not_bought = Some(user.seen_not_bought);
        }
        None => reasons.push("Guest (no personalization)".to_string()),
    }

    if signals.stock <= LOW_STOCK {
        pct += LOW_STOCK_PCT;
        reasons.push(format!("Low stock (+{}%)", LOW_STOCK_PCT));
    } else if signals.stock >= HIGH_STOCK {
        pct += HIGH_STOCK_PCT;
        reasons.push(format!("High stock ({}%)", HIGH_STOCK_PCT));
    }

    let mut price = round2(base * (1.0 + pct as f64 / 100.0));
    let floor = round2(base * FLOOR);
    let ceiling = round2(base * CEILING);
    if price < floor {
        reasons.push(format!("Clamped to 50% floor (${:.2})", floor));
        price = floor;
    }
    if price > ceiling {
        reasons.push(format!("Clamped to 180% ceiling (${:.2})", ceiling));
        price = ceiling;
    }

    PriceQuote {
        price,
        reasons,
        features,
    }
}

/// Collect the signals for `product` as seen by `user`.
pub async fn gather_signals(
    pool: &SqlitePool,
    product: &Product,
    user: Option<&User>,
) -> Result<PricingSignals> {
    let user_signals = match user {
        Some(user) => {
            let ptype = product.poke_type.to_lowercase();
            let is_favorite = user
                .favorite_types
                .iter()
                .any(|t| t.to_lowercase() == ptype);

            let purchases_same_type: i64 = sqlx::query(
                r#"
                SELECT COALESCE(SUM(oi.quantity), 0) AS n
                FROM order_items oi
                JOIN orders o ON o.id = oi.order_id
                JOIN products p ON p.id = oi.product_id
                WHERE o.user_id = ? AND p.poke_type = ?
                "#,
            )
            .bind(user.id)
            .bind(&product.poke_type)
            .fetch_one(pool)
            .await?
            .get("n");

            let seen: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM product_views WHERE user_id = ? AND product_id = ?",
            )
            .bind(user.id)
            .bind(product.id)
            .fetch_one(pool)
            .await?
            .get("n");

            let bought = if seen > 0 {
                has_purchased(pool, user.id, product.id).await?
            } else {
                false
            };

            Some(UserSignals {
                is_favorite,
                purchases_same_type,
                seen_not_bought: seen > 0 && !bought,
            })
        }
        None => None,
    };

    Ok(PricingSignals {
        base_price: product.base_price,
        stock: product.stock,
        poke_type: product.poke_type.clone(),
        user: user_signals,
    })
}

pub async fn has_purchased(pool: &SqlitePool, user_id: i64, product_id: i64) -> Result<bool> {
    let n: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS n
        FROM order_items oi
        JOIN orders o ON o.id = oi.order_id
        WHERE o.user_id = ? AND oi.product_id = ?
        "#,
    )
    .bind(user_id)
    .bind(product_id)
    .fetch_one(pool)
    .await?
    .get("n");
    Ok(n > 0)
}

/// Dynamic price of `product` for `user` (or a guest).
pub async fn price_for(
    pool: &SqlitePool,
    product: &Product,
    user: Option<&User>,
) -> Result<PriceQuote> {
    let signals = gather_signals(pool, product, user).await?;
    Ok(quote(&signals))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(base: f64, stock: i64, user: Option<UserSignals>) -> PricingSignals {
        PricingSignals {
            base_price: base,
            stock,
            poke_type: "fire".to_string(),
            user,
        }
    }

    #[test]
    fn test_guest_mid_stock_is_base() {
        let q = quote(&signals(10.0, 20, None));
        assert_eq!(q.price, 10.0);
        assert_eq!(q.reasons, vec!["Guest (no personalization)"]);
        assert_eq!(q.features.purchases_same_type, None);
    }

    #[test]
    fn test_guest_low_stock() {
        let q = quote(&signals(10.0, 5, None));
        assert_eq!(q.price, 11.2);
    }

    #[test]
    fn test_guest_high_stock() {
        let q = quote(&signals(10.0, 50, None));
        assert_eq!(q.price, 9.2);
    }

    #[test]
    fn test_favorite_with_history_capped() {
        let user = UserSignals {
            is_favorite: true,
            purchases_same_type: 9,
            seen_not_bought: false,
        };
        // +10 favorite, +10 capped history, +12 low stock
        let q = quote(&signals(100.0, 1, Some(user)));
        assert_eq!(q.price, 132.0);
        assert!(q.reasons.iter().any(|r| r.contains("+10%") && r.contains("history")));
        assert_eq!(q.features.purchases_same_type, Some(9));
    }

    #[test]
    fn test_not_favorite_seen_not_bought_high_stock() {
        let user = UserSignals {
            is_favorite: false,
            purchases_same_type: 0,
            seen_not_bought: true,
        };
        // -5 -3 -8 = -16%
        let q = quote(&signals(50.0, 80, Some(user)));
        assert_eq!(q.price, 42.0);
        assert_eq!(q.reasons.len(), 3);
        assert_eq!(q.features.seen_not_bought, Some(true));
    }

    #[test]
    fn test_rounding_to_cents() {
        let user = UserSignals {
            is_favorite: true,
            purchases_same_type: 1,
            seen_not_bought: false,
        };
        // 3.33 * 1.12 = 3.7296
        let q = quote(&signals(3.33, 20, Some(user)));
        assert_eq!(q.price, 3.73);
    }

    #[test]
    fn test_price_stays_within_bounds() {
        for stock in [0, 5, 20, 50, 500] {
            for fav in [true, false] {
                for n in [0, 3, 50] {
                    for seen in [true, false] {
                        let user = UserSignals {
                            is_favorite: fav,
                            purchases_same_type: n,
                            seen_not_bought: seen,
                        };
                        let q = quote(&signals(19.99, stock, Some(user)));
                        assert!(q.price >= round2(19.99 * 0.5));
                        assert!(q.price <= round2(19.99 * 1.8));
                    }
                }
            }
        }
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(2.346), 2.35);
        assert_eq!(round2(2.344), 2.34);
        assert_eq!(round2(-0.0), 0.0);
    }
}
