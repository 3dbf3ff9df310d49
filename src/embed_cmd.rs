//! Product embedding index maintenance.
//!
//! Each product is rendered to a plain-text document; the SHA-256 of that
//! document is its fingerprint. A stored vector is reused while its
//! fingerprint matches the product's current state and recomputed (then
//! upserted) as soon as it does not.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, Embedder};
use crate::models::{Product, PRODUCT_COLUMNS};

/// Counts reported by [`build_index`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub embedded: u64,
    pub skipped: u64,
}

/// Text embedded for a product: name, description, type, category, then
/// any non-empty card attributes as `key: value` lines.
pub fn product_document(p: &Product) -> String {
    let mut lines = vec![
        p.name.clone(),
        p.description.clone(),
        format!("Type: {}", p.poke_type),
        format!("Category: {}", p.category),
    ];

    let extras = [
        ("expansion", &p.expansion),
        ("rarity", &p.rarity),
        ("language", &p.language),
        ("condition", &p.condition),
        ("card_number", &p.card_number),
    ];
    for (key, value) in extras {
        if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            lines.push(format!("{}: {}", key, v));
        }
    }

    lines.join("\n")
}

pub fn fingerprint(doc: &str) -> String {
    hash_text(doc)
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Embed `product` unless its stored fingerprint is current.
///
/// Returns `true` when a vector was computed and written.
pub async fn upsert_product_embedding(
    pool: &SqlitePool,
    embedder: &Embedder,
    product: &Product,
) -> Result<bool> {
    let doc = product_document(product);
    let fp = fingerprint(&doc);

    let existing: Option<String> =
        sqlx::query_scalar("SELECT fingerprint FROM product_embeddings WHERE product_id = ?")
            .bind(product.id)
            .fetch_optional(pool)
            .await?;

    if existing.as_deref() == Some(fp.as_str()) {
        return Ok(false);
    }

    let (vector, model) = embedder.embed(&doc).await;
    let blob = embedding::vec_to_blob(&vector);
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO product_embeddings (product_id, model, dims, vector, fingerprint, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(product_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            vector = excluded.vector,
            fingerprint = excluded.fingerprint,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(product.id)
    .bind(&model)
    .bind(vector.len() as i64)
    .bind(&blob)
    .bind(&fp)
    .bind(now)
    .execute(pool)
    .await?;

    debug!(product_id = product.id, model = %model, "stored product embedding");
    Ok(true)
}

/// Refresh the vector of every product. With `rebuild`, stored vectors are
/// dropped first so every product is re-embedded.
pub async fn build_index(
    pool: &SqlitePool,
    embedder: &Embedder,
    rebuild: bool,
) -> Result<IndexReport> {
    if rebuild {
        sqlx::query("DELETE FROM product_embeddings")
            .execute(pool)
            .await?;
    }

    let sql = format!("SELECT {} FROM products p ORDER BY p.id", PRODUCT_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    let mut report = IndexReport::default();
    for row in &rows {
        let product = Product::from_row(row);
        if upsert_product_embedding(pool, embedder, &product).await? {
            report.embedded += 1;
        } else {
            report.skipped += 1;
        }
    }

    info!(
        embedded = report.embedded,
        skipped = report.skipped,
        rebuild,
        "product index refreshed"
    );
    Ok(report)
}

/// Number of stored product vectors.
pub async fn index_size(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM product_embeddings")
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}

/// CLI entry point for `pokeshop embed build|rebuild`.
pub async fn run_embed(config: &Config, rebuild: bool) -> Result<()> {
    let embedder = Embedder::new(&config.embedding)?;
    let pool = db::connect(config).await?;

    let report = build_index(&pool, &embedder, rebuild).await?;

    println!("embed {}", if rebuild { "rebuild" } else { "build" });
    println!("  model: {}", embedder.model_name());
    println!("  embedded: {}", report.embedded);
    println!("  skipped: {}", report.skipped);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> Product {
        Product {
            id: 1,
            name: "Charizard ex".to_string(),
            poke_type: "fire".to_string(),
            category: "tcg".to_string(),
            description: "Special illustration".to_string(),
            base_price: 120.0,
            stock: 2,
            image_url: String::new(),
            created_at: 0,
            expansion: Some("Obsidian Flames".to_string()),
            rarity: Some("Special Illustration Rare".to_string()),
            language: Some("  ".to_string()),
            condition: None,
            card_number: Some("223".to_string()),
            tcg_card_id: Some("sv3-223".to_string()),
            market_price: None,
            market_currency: None,
            market_source: None,
            market_updated_at: None,
        }
    }

    #[test]
    fn test_document_layout() {
        let doc = product_document(&card());
        assert_eq!(
            doc,
            "Charizard ex\nSpecial illustration\nType: fire\nCategory: tcg\n\
             expansion: Obsidian Flames\nrarity: Special Illustration Rare\ncard_number: 223"
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = card();
        let mut b = card();
        assert_eq!(
            fingerprint(&product_document(&a)),
            fingerprint(&product_document(&b))
        );
        b.description = "Full art".to_string();
        assert_ne!(
            fingerprint(&product_document(&a)),
            fingerprint(&product_document(&b))
        );
    }

    #[test]
    fn test_fingerprint_ignores_price_and_stock() {
        let a = card();
        let mut b = card();
        b.base_price = 1.0;
        b.stock = 99;
        assert_eq!(
            fingerprint(&product_document(&a)),
            fingerprint(&product_document(&b))
        );
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint("abc");
        assert_eq!(
            fp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
