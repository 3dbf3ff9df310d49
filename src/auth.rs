//! Accounts, password hashing and sign-in.
//!
//! Passwords are stored as `pbkdf2$<iterations>$<salt hex>$<hash hex>`
//! (PBKDF2-HMAC-SHA256, 32-byte output). The iteration count travels with
//! the hash so it can be raised without invalidating existing accounts.

use anyhow::Result;
use serde::Deserialize;
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::cart;
use crate::config::Config;
use crate::db;
use crate::error::ShopError;
use crate::models::User;
use crate::session::SessionData;

const PBKDF2_ITERATIONS: u32 = 60_000;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub ship_address: Option<String>,
}

fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

pub fn hash_password(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let hash = pbkdf2_sha256(password.as_bytes(), &salt, PBKDF2_ITERATIONS);
    format!(
        "pbkdf2${}${}${}",
        PBKDF2_ITERATIONS,
        hex::encode(salt),
        hex::encode(hash)
    )
}

/// Check `password` against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, iterations, salt, hash] = parts.as_slice() else {
        return false;
    };
    if *scheme != "pbkdf2" {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) =
        (iterations.parse::<u32>(), hex::decode(salt), hex::decode(hash))
    else {
        return false;
    };
    if iterations == 0 {
        return false;
    }

    let actual = pbkdf2_sha256(password.as_bytes(), &salt, iterations);
    constant_time_eq(&actual, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// One `@`, non-empty local part, dotted domain with non-empty labels.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

pub async fn register(pool: &SqlitePool, input: &RegisterInput) -> Result<User> {
    let email = input.email.trim().to_lowercase();
    if email.is_empty() || input.password.is_empty() {
        return Err(ShopError::BadRequest("email and password are required".to_string()).into());
    }
    if !is_valid_email(&email) {
        return Err(ShopError::BadRequest(format!("invalid email: {}", email)).into());
    }
    let hash = hash_password(&input.password);
    let now = chrono::Utc::now().timestamp();
    let clean = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let result = sqlx::query(
        r#"
        INSERT INTO users (email, password_hash, full_name, ship_address, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&email)
    .bind(&hash)
    .bind(clean(&input.full_name))
    .bind(clean(&input.ship_address))
    .bind(now)
    .execute(pool)
    .await;

    // Duplicates are caught by the UNIQUE email column.
    let result = match result {
        Ok(result) => result,
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(ShopError::Conflict("email already registered".to_string()).into());
        }
        Err(e) => return Err(e.into()),
    };

    let id = result.last_insert_rowid();
    info!(user_id = id, "registered user");
    get_user(pool, id)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("user {}", id)).into())
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(User::from_row))
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE email = ?")
        .bind(email.trim().to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(User::from_row))
}

pub async fn authenticate(pool: &SqlitePool, email: &str, password: &str) -> Result<User> {
    match get_user_by_email(pool, email).await? {
        Some(user) if verify_password(password, &user.password_hash) => Ok(user),
        _ => Err(ShopError::InvalidCredentials.into()),
    }
}

/// Sign in: bind the user to the session and move the guest cart into
/// the user's saved cart.
pub async fn login(
    pool: &SqlitePool,
    session: &mut SessionData,
    email: &str,
    password: &str,
) -> Result<User> {
    let user = authenticate(pool, email, password).await?;
    cart::merge_session_into_user(pool, user.id, &session.cart).await?;
    session.cart.clear();
    session.user_id = Some(user.id);
    info!(user_id = user.id, "login");
    Ok(user)
}

pub fn logout(session: &mut SessionData) {
    session.user_id = None;
    session.cart.clear();
}

/// Store the lowercase, de-duplicated favorite types of a user.
pub async fn set_favorite_types(
    pool: &SqlitePool,
    user_id: i64,
    types: &[String],
) -> Result<Vec<String>> {
    let mut favorites: Vec<String> = Vec::new();
    for t in types {
        let t = t.trim().to_lowercase();
        if !t.is_empty() && !favorites.contains(&t) {
            favorites.push(t);
        }
    }

    let result = sqlx::query("UPDATE users SET favorite_types = ? WHERE id = ?")
        .bind(serde_json::to_string(&favorites)?)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ShopError::NotFound(format!("user {}", user_id)).into());
    }
    Ok(favorites)
}

pub async fn grant_admin(pool: &SqlitePool, email: &str) -> Result<User> {
    let result = sqlx::query("UPDATE users SET is_admin = 1 WHERE email = ?")
        .bind(email.trim().to_lowercase())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ShopError::NotFound(format!("user {}", email.trim())).into());
    }
    get_user_by_email(pool, email)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("user {}", email.trim())).into())
}

/// CLI entry point for `pokeshop admin grant`.
pub async fn run_admin_grant(config: &Config, email: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let user = grant_admin(&pool, email).await?;
    println!("admin grant");
    println!("  user: {} (id {})", user.email, user.id);
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("pikachu123");
        assert!(stored.starts_with("pbkdf2$60000$"));
        assert!(verify_password("pikachu123", &stored));
        assert!(!verify_password("pikachu124", &stored));
    }

    #[test]
    fn test_hashes_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn test_pbkdf2_known_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 with c = 1 (first 32 bytes)
        let out = pbkdf2_sha256(b"passwd", b"salt", 1);
        assert_eq!(
            hex::encode(out),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[test]
    fn test_verifies_stored_iteration_count() {
        // RFC 7914 section 11, P = "Password", S = "NaCl", c = 80000
        let stored = format!(
            "pbkdf2$80000${}${}",
            hex::encode(b"NaCl"),
            "4ddcd8f60b98be21830cee5ef22701f9641a4418d04c0414aeff08876b34ab56"
        );
        assert!(verify_password("Password", &stored));
        assert!(!verify_password("password", &stored));
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "plain"));
        assert!(!verify_password("x", "pbkdf2$abc$00$00"));
        assert!(!verify_password("x", "bcrypt$1$00$00"));
        assert!(!verify_password("x", "pbkdf2$0$00$00"));
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ash@pallet.town"));
        assert!(is_valid_email("a.b+c@mail.example.com"));
        assert!(!is_valid_email("ash"));
        assert!(!is_valid_email("@pallet.town"));
        assert!(!is_valid_email("ash@pallet"));
        assert!(!is_valid_email("ash@pallet."));
        assert!(!is_valid_email("ash@@pallet.town"));
        assert!(!is_valid_email("ash ketchum@pallet.town"));
    }
}
