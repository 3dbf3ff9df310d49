//! Product catalog: listing, full-text search, facets, detail pages and
//! admin maintenance.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::error::ShopError;
use crate::models::{NewProduct, Product, Review, User, PRODUCT_COLUMNS};
use crate::pricing::{self, PriceQuote};
use crate::reviews;
use crate::wishlist;

/// Image extensions accepted by [`attach_image`].
pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

const FEATURED_LIMIT: i64 = 8;
const RECOMMENDATION_LIMIT: i64 = 4;

pub async fn get_product(pool: &SqlitePool, id: i64) -> Result<Option<Product>> {
    let sql = format!("SELECT {} FROM products p WHERE p.id = ?", PRODUCT_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(Product::from_row))
}

async fn require_product(pool: &SqlitePool, id: i64) -> Result<Product> {
    get_product(pool, id)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("product {}", id)).into())
}

// ============ Full-text search ============

/// Turn free text into an FTS5 prefix query: every whitespace-separated
/// term becomes a quoted prefix (`"term"*`), implicitly ANDed.
pub fn fts_query(q: &str) -> Option<String> {
    let terms: Vec<String> = q
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// The FTS pattern for `q`, or `None` when it has no terms or the index
/// rejects it.
async fn checked_fts_pattern(pool: &SqlitePool, q: &str) -> Option<String> {
    let pattern = fts_query(q)?;
    let check = sqlx::query("SELECT 1 FROM product_fts WHERE product_fts MATCH ? LIMIT 1")
        .bind(&pattern)
        .fetch_optional(pool)
        .await;
    match check {
        Ok(_) => Some(pattern),
        Err(e) => {
            warn!(query = %q, error = %e, "full-text query failed");
            None
        }
    }
}

/// Product ids matching `q` in the FTS index. Invalid input matches nothing.
pub async fn fts_match_ids(pool: &SqlitePool, q: &str, limit: i64) -> Result<Vec<i64>> {
    let Some(pattern) = fts_query(q) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query("SELECT rowid FROM product_fts WHERE product_fts MATCH ? LIMIT ?")
        .bind(&pattern)
        .bind(limit)
        .fetch_all(pool)
        .await;

    match rows {
        Ok(rows) => Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect()),
        Err(e) => {
            warn!(query = %q, error = %e, "full-text query failed");
            Ok(Vec::new())
        }
    }
}

// ============ Listing ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    New,
    PriceAsc,
    PriceDesc,
}

impl SortOrder {
    /// Unknown values fall back to newest first.
    pub fn parse(s: &str) -> Self {
        match s {
            "price_asc" => Self::PriceAsc,
            "price_desc" => Self::PriceDesc,
            _ => Self::New,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, rename = "type")]
    pub poke_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub exp: Option<String>,
    #[serde(default)]
    pub rare: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub cond: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub per_page: Option<i64>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Price shown in listings: the market price when known, else the
/// dynamic price in dollars.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DisplayPrice {
    pub price: f64,
    pub currency: String,
    pub using_market: bool,
    pub source: Option<String>,
}

impl DisplayPrice {
    pub fn for_product(product: &Product, dynamic_price: f64) -> Self {
        match product.market_price {
            Some(market) if market > 0.0 => Self {
                price: pricing::round2(market),
                currency: product
                    .market_currency
                    .as_deref()
                    .unwrap_or_default()
                    .to_uppercase(),
                using_market: true,
                source: product.market_source.clone(),
            },
            _ => Self {
                price: pricing::round2(dynamic_price),
                currency: "$".to_string(),
                using_market: false,
                source: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductListing {
    #[serde(flatten)]
    pub product: Product,
    pub display: DisplayPrice,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPage {
    pub items: Vec<ProductListing>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub pages: i64,
    pub featured_tcg: Vec<Product>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Facets>,
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &CatalogQuery, fts: Option<&str>) {
    qb.push(" WHERE 1 = 1");

    if let Some(pattern) = fts {
        qb.push(" AND p.id IN (SELECT rowid FROM product_fts WHERE product_fts MATCH ")
            .push_bind(pattern.to_string())
            .push(")");
    }
    if let Some(t) = non_empty(&query.poke_type) {
        qb.push(" AND lower(p.poke_type) = ").push_bind(t.to_lowercase());
    }

    let category = non_empty(&query.category).map(|c| c.to_lowercase());
    if let Some(c) = &category {
        qb.push(" AND lower(p.category) = ").push_bind(c.clone());
    }
    if category.as_deref() == Some("tcg") {
        let tcg_filters = [
            ("p.expansion", &query.exp),
            ("p.rarity", &query.rare),
            ("p.language", &query.lang),
            ("p.condition", &query.cond),
        ];
        for (column, value) in tcg_filters {
            if let Some(v) = non_empty(value) {
                qb.push(format!(" AND {} = ", column)).push_bind(v);
            }
        }
    }
}

/// One page of the catalog with display prices for `user`.
pub async fn list_products(
    pool: &SqlitePool,
    query: &CatalogQuery,
    user: Option<&User>,
    default_per_page: i64,
    facets: Option<&FacetsCache>,
) -> Result<CatalogPage> {
    let per_page = query.per_page.unwrap_or(default_per_page).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    let sort = SortOrder::parse(query.sort.as_deref().unwrap_or("new"));

    let is_tcg = non_empty(&query.category).is_some_and(|c| c.eq_ignore_ascii_case("tcg"));
    let facets = match (is_tcg, facets) {
        (true, Some(cache)) => Some(cache.get(pool).await?),
        (true, None) => Some(load_tcg_facets(pool).await?),
        _ => None,
    };
    let featured_tcg = featured_tcg(pool).await?;
    let empty = |total: i64, featured_tcg: Vec<Product>, facets: Option<Facets>| CatalogPage {
        items: Vec::new(),
        page,
        per_page,
        total,
        pages: (total + per_page - 1) / per_page,
        featured_tcg,
        facets,
    };

    let fts = match non_empty(&query.q) {
        Some(q) => match checked_fts_pattern(pool, &q).await {
            Some(pattern) => Some(pattern),
            None => return Ok(empty(0, featured_tcg, facets)),
        },
        None => None,
    };

    let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM products p");
    push_filters(&mut count_qb, query, fts.as_deref());
    let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    // Pages past the end (including ones whose offset overflows) are empty.
    let Some(offset) = (page - 1).checked_mul(per_page).filter(|o| *o < total) else {
        return Ok(empty(total, featured_tcg, facets));
    };

    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM products p", PRODUCT_COLUMNS));
    push_filters(&mut qb, query, fts.as_deref());
    qb.push(match sort {
        SortOrder::New => " ORDER BY p.created_at DESC, p.id DESC",
        SortOrder::PriceAsc => " ORDER BY p.base_price ASC, p.id ASC",
        SortOrder::PriceDesc => " ORDER BY p.base_price DESC, p.id ASC",
    });
    qb.push(" LIMIT ")
        .push_bind(per_page)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb.build().fetch_all(pool).await?;
    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        let product = Product::from_row(row);
        let dynamic = match pricing::price_for(pool, &product, user).await {
            Ok(quote) => quote.price,
            Err(e) => {
                warn!(product_id = product.id, error = %e, "dynamic price failed, using base price");
                product.base_price
            }
        };
        let display = DisplayPrice::for_product(&product, dynamic);
        items.push(ProductListing { product, display });
    }

    Ok(CatalogPage {
        items,
        page,
        per_page,
        total,
        pages: (total + per_page - 1) / per_page,
        featured_tcg,
        facets,
    })
}

/// The newest trading-card products.
pub async fn featured_tcg(pool: &SqlitePool) -> Result<Vec<Product>> {
    let sql = format!(
        "SELECT {} FROM products p WHERE p.category = 'tcg' \
         ORDER BY p.created_at DESC, p.id DESC LIMIT ?",
        PRODUCT_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(FEATURED_LIMIT).fetch_all(pool).await?;
    Ok(rows.iter().map(Product::from_row).collect())
}

// ============ Facets ============

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Facets {
    pub exp: Vec<String>,
    pub rare: Vec<String>,
    pub lang: Vec<String>,
    pub cond: Vec<String>,
}

pub async fn load_tcg_facets(pool: &SqlitePool) -> Result<Facets> {
    async fn distinct(pool: &SqlitePool, column: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {col} AS v FROM products \
             WHERE category = 'tcg' AND {col} IS NOT NULL AND {col} != '' ORDER BY {col} ASC",
            col = column
        );
        let rows = sqlx::query(&sql).fetch_all(pool).await?;
        Ok(rows.iter().map(|r| r.get("v")).collect())
    }

    Ok(Facets {
        exp: distinct(pool, "expansion").await?,
        rare: distinct(pool, "rarity").await?,
        lang: distinct(pool, "language").await?,
        cond: distinct(pool, "condition").await?,
    })
}

/// In-process TCG facet cache with a time-to-live.
pub struct FacetsCache {
    ttl: Duration,
    inner: RwLock<Option<(Instant, Facets)>>,
}

impl FacetsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn get(&self, pool: &SqlitePool) -> Result<Facets> {
        if let Some((at, facets)) = self.inner.read().await.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(facets.clone());
            }
        }

        let facets = load_tcg_facets(pool).await?;
        *self.inner.write().await = Some((Instant::now(), facets.clone()));
        Ok(facets)
    }

    pub async fn invalidate(&self) {
        *self.inner.write().await = None;
    }
}

// ============ Detail ============

#[derive(Debug, Clone, Serialize)]
pub struct ProductDetail {
    pub product: Product,
    pub display: DisplayPrice,
    pub quote: PriceQuote,
    pub recommendations: Vec<Product>,
    pub reviews: Vec<Review>,
    pub avg_rating: Option<f64>,
    pub my_review: Option<Review>,
    pub purchased: bool,
    pub in_wishlist: bool,
}

/// Record a view for signed-in users, then assemble everything the
/// product page shows.
pub async fn product_detail(
    pool: &SqlitePool,
    id: i64,
    user: Option<&User>,
) -> Result<ProductDetail> {
    let product = require_product(pool, id).await?;

    if let Some(user) = user {
        sqlx::query("INSERT INTO product_views (user_id, product_id, ts) VALUES (?, ?, ?)")
            .bind(user.id)
            .bind(product.id)
            .bind(chrono::Utc::now().timestamp())
            .execute(pool)
            .await?;
    }

    let quote = pricing::price_for(pool, &product, user).await?;
    let display = DisplayPrice::for_product(&product, quote.price);
    let recommendations = recommendations(pool, &product).await?;

    let reviews = reviews::list_for_product(pool, product.id).await?;
    let avg_rating = average_rating(&reviews);

    let (my_review, purchased, in_wishlist) = match user {
        Some(user) => (
            reviews.iter().find(|r| r.user_id == user.id).cloned(),
            pricing::has_purchased(pool, user.id, product.id).await?,
            wishlist::contains(pool, user.id, product.id).await?,
        ),
        None => (None, false, false),
    };

    Ok(ProductDetail {
        product,
        display,
        quote,
        recommendations,
        reviews,
        avg_rating,
        my_review,
        purchased,
        in_wishlist,
    })
}

pub fn average_rating(reviews: &[Review]) -> Option<f64> {
    if reviews.is_empty() {
        return None;
    }
    let sum: i64 = reviews.iter().map(|r| r.rating).sum();
    Some(pricing::round2(sum as f64 / reviews.len() as f64))
}

/// Same-type products, best sellers first, then newest.
pub async fn recommendations(pool: &SqlitePool, product: &Product) -> Result<Vec<Product>> {
    let sql = format!(
        r#"
        SELECT {}, COALESCE(SUM(oi.quantity), 0) AS sold
        FROM products p
        LEFT JOIN order_items oi ON oi.product_id = p.id
        WHERE p.poke_type = ? AND p.id != ?
        GROUP BY p.id
        ORDER BY sold DESC, p.created_at DESC, p.id DESC
        LIMIT ?
        "#,
        PRODUCT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(&product.poke_type)
        .bind(product.id)
        .bind(RECOMMENDATION_LIMIT)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(Product::from_row).collect())
}

// ============ Admin ============

fn normalize_new_product(input: &NewProduct) -> Result<NewProduct> {
    let name = input.name.trim().to_string();
    let poke_type = input.poke_type.trim().to_lowercase();
    if name.is_empty() || poke_type.is_empty() || !(input.base_price > 0.0) {
        return Err(ShopError::BadRequest(
            "name, type and a positive price are required".to_string(),
        )
        .into());
    }
    let category = input
        .category
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "general".to_string());

    Ok(NewProduct {
        name,
        poke_type,
        category: Some(category),
        description: input.description.trim().to_string(),
        base_price: input.base_price,
        stock: input.stock.max(0),
        image_url: input.image_url.trim().to_string(),
        expansion: non_empty(&input.expansion),
        rarity: non_empty(&input.rarity),
        language: non_empty(&input.language),
        condition: non_empty(&input.condition),
        card_number: non_empty(&input.card_number),
        tcg_card_id: non_empty(&input.tcg_card_id),
    })
}

pub async fn create_product(pool: &SqlitePool, input: &NewProduct) -> Result<Product> {
    let p = normalize_new_product(input)?;
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO products (name, poke_type, category, description, base_price, stock,
                              image_url, created_at, expansion, rarity, language, condition,
                              card_number, tcg_card_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&p.name)
    .bind(&p.poke_type)
    .bind(p.category.as_deref().unwrap_or("general"))
    .bind(&p.description)
    .bind(p.base_price)
    .bind(p.stock)
    .bind(&p.image_url)
    .bind(now)
    .bind(&p.expansion)
    .bind(&p.rarity)
    .bind(&p.language)
    .bind(&p.condition)
    .bind(&p.card_number)
    .bind(&p.tcg_card_id)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    info!(product_id = id, name = %p.name, "created product");
    require_product(pool, id).await
}

/// Partial product update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductUpdate {
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub poke_type: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "price")]
    pub base_price: Option<f64>,
    pub stock: Option<i64>,
    pub image_url: Option<String>,
    pub expansion: Option<String>,
    pub rarity: Option<String>,
    pub language: Option<String>,
    pub condition: Option<String>,
    pub card_number: Option<String>,
    pub tcg_card_id: Option<String>,
}

pub async fn update_product(pool: &SqlitePool, id: i64, update: &ProductUpdate) -> Result<Product> {
    let current = require_product(pool, id).await?;

    let merged = NewProduct {
        name: update.name.clone().unwrap_or(current.name),
        poke_type: update.poke_type.clone().unwrap_or(current.poke_type),
        category: Some(update.category.clone().unwrap_or(current.category)),
        description: update.description.clone().unwrap_or(current.description),
        base_price: update.base_price.unwrap_or(current.base_price),
        stock: update.stock.unwrap_or(current.stock),
        image_url: update.image_url.clone().unwrap_or(current.image_url),
        expansion: update.expansion.clone().or(current.expansion),
        rarity: update.rarity.clone().or(current.rarity),
        language: update.language.clone().or(current.language),
        condition: update.condition.clone().or(current.condition),
        card_number: update.card_number.clone().or(current.card_number),
        tcg_card_id: update.tcg_card_id.clone().or(current.tcg_card_id),
    };
    let p = normalize_new_product(&merged)?;

    sqlx::query(
        r#"
        UPDATE products SET
            name = ?, poke_type = ?, category = ?, description = ?, base_price = ?,
            stock = ?, image_url = ?, expansion = ?, rarity = ?, language = ?,
            condition = ?, card_number = ?, tcg_card_id = ?
        WHERE id = ?
        "#,
    )
    .bind(&p.name)
    .bind(&p.poke_type)
    .bind(p.category.as_deref().unwrap_or("general"))
    .bind(&p.description)
    .bind(p.base_price)
    .bind(p.stock)
    .bind(&p.image_url)
    .bind(&p.expansion)
    .bind(&p.rarity)
    .bind(&p.language)
    .bind(&p.condition)
    .bind(&p.card_number)
    .bind(&p.tcg_card_id)
    .bind(id)
    .execute(pool)
    .await?;

    require_product(pool, id).await
}

/// Every product, newest first.
pub async fn list_products_admin(pool: &SqlitePool) -> Result<Vec<Product>> {
    let sql = format!(
        "SELECT {} FROM products p ORDER BY p.created_at DESC, p.id DESC",
        PRODUCT_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(Product::from_row).collect())
}

/// Lowercase extension of `filename` if it is an accepted image type.
pub fn image_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
    ALLOWED_IMAGE_EXTENSIONS
        .contains(&ext.as_str())
        .then_some(ext)
}

/// Store an uploaded image under a unique name and point the product at it.
pub async fn attach_image(
    pool: &SqlitePool,
    upload_dir: &Path,
    id: i64,
    filename: &str,
    bytes: &[u8],
) -> Result<Product> {
    require_product(pool, id).await?;
    let ext = image_extension(filename).ok_or_else(|| {
        ShopError::BadRequest(format!(
            "unsupported image type; allowed: {}",
            ALLOWED_IMAGE_EXTENSIONS.join(", ")
        ))
    })?;
    if bytes.is_empty() {
        return Err(ShopError::BadRequest("empty upload".to_string()).into());
    }

    tokio::fs::create_dir_all(upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir: {}", upload_dir.display()))?;

    let unique = format!(
        "{}_{}.{}",
        chrono::Utc::now().timestamp(),
        &uuid::Uuid::new_v4().simple().to_string()[..8],
        ext
    );
    let path = upload_dir.join(&unique);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write upload: {}", path.display()))?;

    sqlx::query("UPDATE products SET image_url = ? WHERE id = ?")
        .bind(format!("/uploads/{}", unique))
        .bind(id)
        .execute(pool)
        .await?;

    info!(product_id = id, file = %unique, "attached product image");
    require_product(pool, id).await
}

/// Insert every product of a JSON array file; returns how many were added.
pub async fn import_products(pool: &SqlitePool, path: &Path) -> Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let products: Vec<NewProduct> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid product JSON in {}", path.display()))?;

    let mut imported = 0;
    for (i, p) in products.iter().enumerate() {
        create_product(pool, p)
            .await
            .with_context(|| format!("product #{} ({})", i + 1, p.name))?;
        imported += 1;
    }
    Ok(imported)
}

/// CLI entry point for `pokeshop import`.
pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let pool = db::connect(config).await?;
    let imported = import_products(&pool, path).await?;
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(&pool)
        .await?;

    println!("import {}", path.display());
    println!("  imported: {}", imported);
    println!("  products total: {}", total);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("pika chu").as_deref(), Some("\"pika\"* \"chu\"*"));
        assert_eq!(fts_query("  ").as_deref(), None);
        assert_eq!(fts_query("a\"b OR").as_deref(), Some("\"ab\"* \"OR\"*"));
        assert_eq!(fts_query("\"\"").as_deref(), None);
    }

    #[test]
    fn test_sort_parse() {
        assert_eq!(SortOrder::parse("price_asc"), SortOrder::PriceAsc);
        assert_eq!(SortOrder::parse("price_desc"), SortOrder::PriceDesc);
        assert_eq!(SortOrder::parse("bogus"), SortOrder::New);
    }

    #[test]
    fn test_image_extension() {
        assert_eq!(image_extension("Card.PNG").as_deref(), Some("png"));
        assert_eq!(image_extension("a.webp").as_deref(), Some("webp"));
        assert_eq!(image_extension("evil.svg"), None);
        assert_eq!(image_extension("noext"), None);
    }

    #[test]
    fn test_normalize_new_product() {
        let input = NewProduct {
            name: "  Pikachu Plush ".to_string(),
            poke_type: "Electric".to_string(),
            category: Some("  ".to_string()),
            base_price: 12.5,
            stock: -3,
            ..NewProduct::default()
        };
        let p = normalize_new_product(&input).unwrap();
        assert_eq!(p.name, "Pikachu Plush");
        assert_eq!(p.poke_type, "electric");
        assert_eq!(p.category.as_deref(), Some("general"));
        assert_eq!(p.stock, 0);
    }

    #[test]
    fn test_normalize_rejects_missing_fields() {
        let input = NewProduct {
            name: "X".to_string(),
            poke_type: "fire".to_string(),
            base_price: 0.0,
            ..NewProduct::default()
        };
        assert!(normalize_new_product(&input).is_err());
    }

    #[test]
    fn test_average_rating() {
        let review = |rating| Review {
            id: 0,
            product_id: 1,
            user_id: 1,
            user_email: String::new(),
            rating,
            comment: String::new(),
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(average_rating(&[]), None);
        assert_eq!(average_rating(&[review(5), review(4), review(4)]), Some(4.33));
    }

    #[test]
    fn test_display_price_prefers_market() {
        let mut p = Product {
            id: 1,
            name: "Mew".to_string(),
            poke_type: "psychic".to_string(),
            category: "tcg".to_string(),
            description: String::new(),
            base_price: 10.0,
            stock: 1,
            image_url: String::new(),
            created_at: 0,
            expansion: None,
            rarity: None,
            language: None,
            condition: None,
            card_number: None,
            tcg_card_id: None,
            market_price: Some(3.456),
            market_currency: Some("usd".to_string()),
            market_source: Some("tcgplayer".to_string()),
            market_updated_at: None,
        };
        let d = DisplayPrice::for_product(&p, 11.2);
        assert_eq!(d.price, 3.46);
        assert_eq!(d.currency, "USD");
        assert!(d.using_market);

        p.market_price = None;
        let d = DisplayPrice::for_product(&p, 11.2);
        assert_eq!(d.price, 11.2);
        assert_eq!(d.currency, "$");
        assert!(!d.using_market);
    }
}
