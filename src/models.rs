//! Core data models used throughout PokeShop.
//!
//! These types mirror the SQLite rows the catalog, cart, checkout and pack
//! modules read and write. Timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::config::RarityWeights;

/// Column list matching [`Product::from_row`].
pub const PRODUCT_COLUMNS: &str = "p.id, p.name, p.poke_type, p.category, p.description, \
    p.base_price, p.stock, p.image_url, p.created_at, p.expansion, p.rarity, p.language, \
    p.condition, p.card_number, p.tcg_card_id, p.market_price, p.market_currency, \
    p.market_source, p.market_updated_at";

/// A catalog entry: a single card or a piece of merchandise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub poke_type: String,
    pub category: String,
    pub description: String,
    pub base_price: f64,
    pub stock: i64,
    pub image_url: String,
    pub created_at: i64,
    pub expansion: Option<String>,
    pub rarity: Option<String>,
    pub language: Option<String>,
    pub condition: Option<String>,
    pub card_number: Option<String>,
    pub tcg_card_id: Option<String>,
    pub market_price: Option<f64>,
    pub market_currency: Option<String>,
    pub market_source: Option<String>,
    pub market_updated_at: Option<i64>,
}

impl Product {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            poke_type: row.get("poke_type"),
            category: row.get("category"),
            description: row.get("description"),
            base_price: row.get("base_price"),
            stock: row.get("stock"),
            image_url: row.get("image_url"),
            created_at: row.get("created_at"),
            expansion: row.get("expansion"),
            rarity: row.get("rarity"),
            language: row.get("language"),
            condition: row.get("condition"),
            card_number: row.get("card_number"),
            tcg_card_id: row.get("tcg_card_id"),
            market_price: row.get("market_price"),
            market_currency: row.get("market_currency"),
            market_source: row.get("market_source"),
            market_updated_at: row.get("market_updated_at"),
        }
    }
}

/// Fields accepted when creating a product (admin form or JSON import).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    #[serde(alias = "type")]
    pub poke_type: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "price")]
    pub base_price: f64,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub expansion: Option<String>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub card_number: Option<String>,
    #[serde(default)]
    pub tcg_card_id: Option<String>,
}

/// A registered shopper or administrator.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub is_admin: bool,
    pub favorite_types: Vec<String>,
    pub full_name: Option<String>,
    pub ship_address: Option<String>,
    pub star_points: i64,
}

impl User {
    pub fn from_row(row: &SqliteRow) -> Self {
        let favorites: String = row.get("favorite_types");
        Self {
            id: row.get("id"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            is_admin: row.get::<i64, _>("is_admin") != 0,
            favorite_types: serde_json::from_str(&favorites).unwrap_or_default(),
            full_name: row.get("full_name"),
            ship_address: row.get("ship_address"),
            star_points: row.get("star_points"),
        }
    }
}

/// A placed order with its line items.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub total: f64,
    pub discount: f64,
    pub promo_code: Option<String>,
    pub status: String,
    pub ship_name: Option<String>,
    pub ship_address: Option<String>,
    pub created_at: i64,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub product_id: i64,
    pub product_name: String,
    pub unit_price: f64,
    pub quantity: i64,
}

/// A percentage discount code redeemable at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    #[serde(default)]
    pub id: i64,
    pub code: String,
    pub percent: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub max_uses: Option<i64>,
    #[serde(default)]
    pub used_count: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl PromoCode {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            code: row.get("code"),
            percent: row.get("percent"),
            active: row.get::<i64, _>("active") != 0,
            max_uses: row.get("max_uses"),
            used_count: row.get("used_count"),
            expires_at: row.get("expires_at"),
        }
    }

    /// Active, not expired at `now`, and below its use limit.
    pub fn usable(&self, now: i64) -> bool {
        if !self.active {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at < now {
                return false;
            }
        }
        if let Some(max_uses) = self.max_uses {
            if self.used_count >= max_uses {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Review {
    pub id: i64,
    pub product_id: i64,
    pub user_id: i64,
    pub user_email: String,
    pub rating: i64,
    pub comment: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Review {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            product_id: row.get("product_id"),
            user_id: row.get("user_id"),
            user_email: row.get("email"),
            rating: row.get("rating"),
            comment: row.get("comment"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// A product paired with a relevance score from semantic search.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredProduct {
    pub product: Product,
    pub score: f32,
}

/// One cart line priced for the current shopper.
#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub product: Product,
    pub quantity: i64,
    pub unit_price: f64,
    pub subtotal: f64,
}

/// Draw configuration for one card set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PackRule {
    pub id: i64,
    pub set_code: String,
    pub pack_size: i64,
    pub weights: RarityWeights,
    pub god_chance: f64,
    pub enabled: bool,
    pub set_image_url: Option<String>,
}

impl PackRule {
    pub fn from_row(row: &SqliteRow) -> Self {
        let weights: String = row.get("weights_json");
        Self {
            id: row.get("id"),
            set_code: row.get("set_code"),
            pack_size: row.get("pack_size"),
            weights: serde_json::from_str(&weights).unwrap_or_default(),
            god_chance: row.get("god_chance"),
            enabled: row.get::<i64, _>("enabled") != 0,
            set_image_url: row.get("set_image_url"),
        }
    }
}

/// Daily-open bookkeeping for a (user, set) pair.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PackAllowance {
    pub user_id: i64,
    pub set_code: String,
    /// UTC calendar date (`YYYY-MM-DD`) of the last daily open.
    pub last_daily_open_date: Option<String>,
    pub bonus_tokens: i64,
}

/// A card in a user's collection, grouped with its copy count.
#[derive(Debug, Clone, Serialize)]
pub struct OwnedCard {
    pub product_id: i64,
    pub name: String,
    pub tcg_card_id: String,
    pub set_code: String,
    pub expansion: Option<String>,
    pub rarity: Option<String>,
    pub tier: String,
    pub image_url: String,
    pub quantity: i64,
    pub last_acquired_at: i64,
}

/// A card as drawn from a pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawnCard {
    pub product_id: i64,
    pub name: String,
    pub tcg_card_id: String,
    pub rarity: Option<String>,
    pub tier: String,
    pub image_url: String,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub points: i64,
}

/// A stored pack opening.
#[derive(Debug, Clone, Serialize)]
pub struct PackOpenRecord {
    pub id: i64,
    pub set_code: String,
    pub opened_at: i64,
    pub cards: Vec<DrawnCard>,
    pub dup_points: i64,
    pub used_bonus: bool,
}

impl PackOpenRecord {
    pub fn from_row(row: &SqliteRow) -> Self {
        let cards: String = row.get("cards_json");
        Self {
            id: row.get("id"),
            set_code: row.get("set_code"),
            opened_at: row.get("opened_at"),
            cards: serde_json::from_str(&cards).unwrap_or_default(),
            dup_points: row.get("dup_points"),
            used_bonus: row.get::<i64, _>("used_bonus") != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promo() -> PromoCode {
        PromoCode {
            id: 1,
            code: "PIKA10".to_string(),
            percent: 10,
            active: true,
            max_uses: Some(2),
            used_count: 0,
            expires_at: Some(1_000),
        }
    }

    #[test]
    fn test_promo_usable() {
        assert!(promo().usable(999));
    }

    #[test]
    fn test_promo_expired() {
        assert!(!promo().usable(1_001));
    }

    #[test]
    fn test_promo_exhausted() {
        let mut p = promo();
        p.used_count = 2;
        assert!(!p.usable(0));
    }

    #[test]
    fn test_promo_inactive() {
        let mut p = promo();
        p.active = false;
        assert!(!p.usable(0));
    }

    #[test]
    fn test_promo_unlimited_without_expiry() {
        let mut p = promo();
        p.max_uses = None;
        p.expires_at = None;
        p.used_count = 10_000;
        assert!(p.usable(i64::MAX));
    }
}
