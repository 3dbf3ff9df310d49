//! Persistent answer cache for the assistant.
//!
//! Keys are `namespace:model:sha256(normalized text)`, so the same question
//! asked with different spacing or casing hits the same entry.

use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

/// Trim, collapse runs of whitespace to one space, lowercase.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn make_key(namespace: &str, model: &str, text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    format!("{}:{}:{:x}", namespace, model, digest)
}

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT value FROM ai_cache WHERE cache_key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    // A corrupt entry behaves like a miss and is overwritten on the next set.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub async fn set(pool: &SqlitePool, key: &str, value: &Value) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO ai_cache (cache_key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(cache_key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(serde_json::to_string(value)?)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  What   IS\tthe\nbest deck? "), "what is the best deck?");
    }

    #[test]
    fn test_key_stable_under_normalization() {
        assert_eq!(
            make_key("qa", "gpt-4o-mini", "Best fire card?"),
            make_key("qa", "gpt-4o-mini", "  best   FIRE card? ")
        );
    }

    #[test]
    fn test_key_varies_by_namespace_and_model() {
        let base = make_key("qa", "m1", "q");
        assert_ne!(base, make_key("qa", "m2", "q"));
        assert_ne!(base, make_key("other", "m1", "q"));
        assert!(base.starts_with("qa:m1:"));
        assert_eq!(base.len(), "qa:m1:".len() + 64);
    }
}
