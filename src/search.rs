use anyhow::Result;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};

use crate::catalog;
use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::embedding::{self, Embedder};
use crate::models::ScoredProduct;

/// Post-filters applied to semantic hits (case-insensitive).
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, rename = "type")]
    pub poke_type: Option<String>,
}

impl SearchFilters {
    fn accepts(&self, category: &str, poke_type: &str) -> bool {
        let matches = |wanted: &Option<String>, actual: &str| match wanted
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
        {
            Some(w) => w.eq_ignore_ascii_case(actual),
            None => true,
        };
        matches(&self.category, category) && matches(&self.poke_type, poke_type)
    }
}

/// Rank products by cosine similarity to `query`.
///
/// Filters are applied after scoring, over the top `max(3k, k)` candidates,
/// so fewer than `k` results may come back when filters are selective.
pub async fn semantic_search(
    pool: &SqlitePool,
    embedder: &Embedder,
    query: &str,
    k: usize,
    filters: &SearchFilters,
) -> Result<Vec<ScoredProduct>> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let (query_vec, _model) = embedder.embed(query).await;

    if embed_cmd::index_size(pool).await? == 0 {
        embed_cmd::build_index(pool, embedder, false).await?;
    }

    let rows = sqlx::query("SELECT product_id, vector FROM product_embeddings")
        .fetch_all(pool)
        .await?;

    let mut candidates: Vec<(i64, f32)> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            let vec = embedding::blob_to_vec(&blob);
            (
                row.get::<i64, _>("product_id"),
                embedding::cosine_similarity(&query_vec, &vec),
            )
        })
        .collect();

    // Sort by similarity desc, ties by id for determinism
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    candidates.truncate(k.saturating_mul(3).max(k));

    let mut results = Vec::with_capacity(k);
    for (product_id, score) in candidates {
        let Some(product) = catalog::get_product(pool, product_id).await? else {
            continue;
        };
        if !filters.accepts(&product.category, &product.poke_type) {
            continue;
        }
        results.push(ScoredProduct { product, score });
        if results.len() == k {
            break;
        }
    }

    Ok(results)
}

/// CLI entry point for `pokeshop search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    filters: SearchFilters,
    limit: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let embedder = Embedder::new(&config.embedding)?;
    let pool = db::connect(config).await?;
    let k = limit.unwrap_or(config.assistant.search_k);

    let results = semantic_search(&pool, &embedder, query, k, &filters).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in results.iter().enumerate() {
        let p = &hit.product;
        println!("{}. [{:.3}] {}", i + 1, hit.score, p.name);
        println!("    type: {} / category: {}", p.poke_type, p.category);
        println!("    price: {:.2}  stock: {}", p.base_price, p.stock);
        println!("    id: {}", p.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_case_insensitive() {
        let f = SearchFilters {
            category: Some("TCG".to_string()),
            poke_type: Some("Fire".to_string()),
        };
        assert!(f.accepts("tcg", "fire"));
        assert!(!f.accepts("plush", "fire"));
        assert!(!f.accepts("tcg", "water"));
    }

    #[test]
    fn test_blank_filters_accept_everything() {
        let f = SearchFilters {
            category: Some("  ".to_string()),
            poke_type: None,
        };
        assert!(f.accepts("anything", "any"));
    }
}
