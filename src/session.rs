//! Server-side sessions.
//!
//! The browser only holds an opaque UUID cookie; everything else lives in
//! the `sessions` table as JSON: the signed-in user, the guest cart and the
//! assistant chat history.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::assistant::ChatTurn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Guest cart: product id → quantity.
    #[serde(default)]
    pub cart: BTreeMap<i64, i64>,
    #[serde(default)]
    pub chat: Vec<ChatTurn>,
}

/// Store `data` under a fresh session id.
pub async fn create(pool: &SqlitePool, data: &SessionData) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query("INSERT INTO sessions (id, data, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(serde_json::to_string(data)?)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

    Ok(id)
}

/// Load a session; unknown ids yield `None`.
pub async fn load(pool: &SqlitePool, id: &str) -> Result<Option<SessionData>> {
    let row = sqlx::query("SELECT data FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let raw: String = row.get("data");
            let data = serde_json::from_str(&raw)
                .with_context(|| format!("corrupt session data for {}", id))?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

pub async fn save(pool: &SqlitePool, id: &str, data: &SessionData) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE sessions SET data = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(data)?)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove sessions untouched for longer than `max_age_secs`.
pub async fn prune(pool: &SqlitePool, max_age_secs: i64) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - max_age_secs;
    let result = sqlx::query("DELETE FROM sessions WHERE updated_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Extract `name` from a `Cookie` request header value.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name && !v.is_empty()).then_some(v)
    })
}

pub fn set_cookie_header(name: &str, id: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Lax", name, id)
}

pub fn expired_cookie_header(name: &str) -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value() {
        let header = "theme=dark; pokeshop_session=abc-123; other=1";
        assert_eq!(cookie_value(header, "pokeshop_session"), Some("abc-123"));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("pokeshop_session=", "pokeshop_session"), None);
    }

    #[test]
    fn test_expired_cookie_is_empty() {
        let header = expired_cookie_header("pokeshop_session");
        assert!(header.starts_with("pokeshop_session=;"));
        assert!(header.ends_with("Max-Age=0"));
    }

    #[test]
    fn test_session_json_roundtrip_with_int_keys() {
        let mut data = SessionData::default();
        data.cart.insert(7, 2);
        data.user_id = Some(3);
        let raw = serde_json::to_string(&data).unwrap();
        assert!(raw.contains("\"7\":2"));
        let back: SessionData = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_missing_fields_default() {
        let data: SessionData = serde_json::from_str("{}").unwrap();
        assert_eq!(data, SessionData::default());
    }
}
