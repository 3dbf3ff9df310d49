//! Card-pack reward engine.
//!
//! Every trading card whose `tcg_card_id` looks like `<set>-<number>` belongs
//! to the set `<set>`. A pack draw picks `pack_size` cards from that set by
//! weighted rarity tier, guaranteeing a rare-tier card when the set has one;
//! with probability `god_chance` the pack is instead made of illustration
//! cards. Each user gets one free pack per set per UTC day and may spend
//! bonus tokens for more. Duplicates pay out star points by tier.
//!
//! [`draw_pack`] is pure and takes its random source as a parameter; the
//! database side ([`open_pack`]) runs in a single transaction.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::config::{PacksConfig, RarityWeights};
use crate::error::ShopError;
use crate::models::{DrawnCard, OwnedCard, PackAllowance, PackOpenRecord, PackRule, Product, User, PRODUCT_COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Common,
    Uncommon,
    Rare,
    Illustration,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Common => "common",
            Tier::Uncommon => "uncommon",
            Tier::Rare => "rare",
            Tier::Illustration => "illustration",
        }
    }

    /// Star points paid for a duplicate of this tier.
    pub fn star_points(self) -> i64 {
        match self {
            Tier::Common => 1,
            Tier::Uncommon => 2,
            Tier::Rare => 5,
            Tier::Illustration => 25,
        }
    }

    /// Rare and illustration cards both satisfy the rare guarantee.
    pub fn is_rare_or_better(self) -> bool {
        matches!(self, Tier::Rare | Tier::Illustration)
    }
}

pub fn rarity_tier(rarity: Option<&str>) -> Tier {
    let r = rarity.unwrap_or_default().to_lowercase();
    if r.is_empty() {
        return Tier::Common;
    }
    if r.contains("illustration") {
        return Tier::Illustration;
    }
    if ["double rare", "ultra", "gold", "secret", "rare"]
        .iter()
        .any(|k| r.contains(k))
    {
        return Tier::Rare;
    }
    if r.contains("uncommon") {
        return Tier::Uncommon;
    }
    Tier::Common
}

/// `sv3-223` → `sv3`. Ids without a `-` have no set.
pub fn set_code_of(tcg_card_id: &str) -> Option<String> {
    let (prefix, _) = tcg_card_id.split_once('-')?;
    let prefix = prefix.trim();
    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_lowercase())
    }
}

fn tier_of(p: &Product) -> Tier {
    rarity_tier(p.rarity.as_deref())
}

/// Draw one pack from `cards`.
pub fn draw_pack<R: Rng + ?Sized>(rule: &PackRule, cards: &[Product], rng: &mut R) -> Vec<Product> {
    if cards.is_empty() {
        return Vec::new();
    }
    let size = rule.pack_size.max(1) as usize;

    let roll: f64 = rng.random();
    if roll < rule.god_chance {
        let mut illustrations: Vec<&Product> = cards
            .iter()
            .filter(|c| tier_of(c) == Tier::Illustration)
            .collect();
        if !illustrations.is_empty() {
            illustrations.shuffle(rng);
            let mut out: Vec<Product> = illustrations.into_iter().take(size).cloned().collect();
            if out.len() < size {
                let need = size - out.len();
                out.extend(cards.choose_multiple(rng, need).cloned());
            }
            return out;
        }
    }

    let commons: Vec<&Product> = cards.iter().filter(|c| tier_of(c) == Tier::Common).collect();
    let uncommons: Vec<&Product> = cards.iter().filter(|c| tier_of(c) == Tier::Uncommon).collect();
    let rares: Vec<&Product> = cards
        .iter()
        .filter(|c| tier_of(c).is_rare_or_better())
        .collect();

    let (common_cut, uncommon_cut) = cutoffs(&rule.weights);

    let mut out: Vec<Product> = Vec::with_capacity(size);
    for _ in 0..size {
        let r: f64 = rng.random();
        let pick = if r < common_cut && !commons.is_empty() {
            commons.choose(rng)
        } else if r < uncommon_cut && !uncommons.is_empty() {
            uncommons.choose(rng)
        } else {
            rares
                .choose(rng)
                .or_else(|| uncommons.choose(rng))
                .or_else(|| commons.choose(rng))
        };
        if let Some(card) = pick {
            out.push((*card).clone());
        }
    }

    if !rares.is_empty() && !out.iter().any(|c| tier_of(c).is_rare_or_better()) {
        if let (Some(last), Some(rare)) = (out.last_mut(), rares.choose(rng)) {
            *last = (*rare).clone();
        }
    }

    out
}

/// Cumulative common and common+uncommon thresholds in `[0, 1]`.
fn cutoffs(weights: &RarityWeights) -> (f64, f64) {
    let w = if weights.validate().is_ok() {
        *weights
    } else {
        RarityWeights::default()
    };
    let total = w.common + w.uncommon + w.rare;
    let c = w.common / total;
    (c, c + w.uncommon / total)
}

pub fn today_utc() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

// ============ Rules & allowances ============

fn default_rule(set_code: &str, defaults: &PacksConfig) -> PackRule {
    PackRule {
        id: 0,
        set_code: set_code.to_string(),
        pack_size: defaults.default_pack_size,
        weights: defaults.default_weights,
        god_chance: defaults.default_god_chance,
        enabled: true,
        set_image_url: None,
    }
}

async fn find_rule(conn: &mut SqliteConnection, set_code: &str) -> Result<Option<PackRule>> {
    let row = sqlx::query("SELECT * FROM pack_rules WHERE set_code = ?")
        .bind(set_code)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(PackRule::from_row))
}

/// The stored rule for a set, created from the configured defaults if absent.
pub async fn get_or_create_rule(
    conn: &mut SqliteConnection,
    set_code: &str,
    defaults: &PacksConfig,
) -> Result<PackRule> {
    if let Some(rule) = find_rule(conn, set_code).await? {
        return Ok(rule);
    }

    let rule = default_rule(set_code, defaults);
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO pack_rules (set_code, pack_size, weights_json, god_chance, enabled, created_at)
        VALUES (?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(set_code)
    .bind(rule.pack_size)
    .bind(serde_json::to_string(&rule.weights)?)
    .bind(rule.god_chance)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    find_rule(conn, set_code)
        .await?
        .ok_or_else(|| ShopError::NotFound(format!("pack rule {}", set_code)).into())
}

async fn get_or_create_allowance(
    conn: &mut SqliteConnection,
    user_id: i64,
    set_code: &str,
) -> Result<PackAllowance> {
    sqlx::query(
        "INSERT OR IGNORE INTO pack_allowances (user_id, set_code, bonus_tokens, created_at) \
         VALUES (?, ?, 0, ?)",
    )
    .bind(user_id)
    .bind(set_code)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        "SELECT last_daily_open_date, bonus_tokens FROM pack_allowances WHERE user_id = ? AND set_code = ?",
    )
    .bind(user_id)
    .bind(set_code)
    .fetch_one(&mut *conn)
    .await?;

    Ok(PackAllowance {
        user_id,
        set_code: set_code.to_string(),
        last_daily_open_date: row.get("last_daily_open_date"),
        bonus_tokens: row.get("bonus_tokens"),
    })
}

/// All trading cards of a set.
pub async fn universe_for_set(conn: &mut SqliteConnection, set_code: &str) -> Result<Vec<Product>> {
    let sql = format!(
        "SELECT {} FROM products p WHERE p.category = 'tcg' \
         AND p.tcg_card_id IS NOT NULL AND lower(p.tcg_card_id) LIKE ? ORDER BY p.id",
        PRODUCT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(format!("{}-%", set_code.to_lowercase()))
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.iter().map(Product::from_row).collect())
}

// ============ Opening ============

#[derive(Debug, Clone, Serialize)]
pub struct PackOpening {
    pub set_code: String,
    pub cards: Vec<DrawnCard>,
    pub dup_points: i64,
    pub used_bonus: bool,
}

/// Open a pack of `set_code` for `user` with a fresh random source.
pub async fn open_pack(
    pool: &SqlitePool,
    defaults: &PacksConfig,
    user: &User,
    set_code: &str,
) -> Result<PackOpening> {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    open_pack_with(pool, defaults, user, set_code, &today_utc(), &mut rng).await
}

/// Open a pack as of the UTC date `today`, drawing from `rng`.
///
/// Administrators bypass the daily allowance and disabled rules but earn no
/// star points.
pub async fn open_pack_with<R: Rng + Send>(
    pool: &SqlitePool,
    defaults: &PacksConfig,
    user: &User,
    set_code: &str,
    today: &str,
    rng: &mut R,
) -> Result<PackOpening> {
    let set_code = set_code.trim().to_lowercase();
    if set_code.is_empty() {
        return Err(ShopError::BadRequest("set code is required".to_string()).into());
    }
    let admin_unlimited = user.is_admin;

    let mut tx = pool.begin().await?;

    let rule = get_or_create_rule(&mut tx, &set_code, defaults).await?;
    if !rule.enabled && !admin_unlimited {
        return Err(ShopError::PackUnavailable("packs are disabled for this set".to_string()).into());
    }

    let allowance = get_or_create_allowance(&mut tx, user.id, &set_code).await?;
    let can_daily = allowance.last_daily_open_date.as_deref() != Some(today);
    let mut used_bonus = false;
    if !admin_unlimited {
        if can_daily {
            sqlx::query(
                "UPDATE pack_allowances SET last_daily_open_date = ? WHERE user_id = ? AND set_code = ?",
            )
            .bind(today)
            .bind(user.id)
            .bind(&set_code)
            .execute(&mut *tx)
            .await?;
        } else if allowance.bonus_tokens > 0 {
            sqlx::query(
                "UPDATE pack_allowances SET bonus_tokens = bonus_tokens - 1 WHERE user_id = ? AND set_code = ?",
            )
            .bind(user.id)
            .bind(&set_code)
            .execute(&mut *tx)
            .await?;
            used_bonus = true;
        } else {
            return Err(ShopError::PackUnavailable(
                "no daily pack or bonus tokens left for this set".to_string(),
            )
            .into());
        }
    }

    let universe = universe_for_set(&mut tx, &set_code).await?;
    let picks = draw_pack(&rule, &universe, rng);
    if picks.is_empty() {
        return Err(ShopError::PackUnavailable(format!("no cards for set {}", set_code)).into());
    }

    let owned: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT tcg_card_id FROM user_cards WHERE user_id = ?")
            .bind(user.id)
            .fetch_all(&mut *tx)
            .await?;
    let mut owned: HashSet<String> = owned.into_iter().collect();

    let now = chrono::Utc::now().timestamp();
    let award_points = !admin_unlimited;
    let mut dup_points = 0;
    let mut cards = Vec::with_capacity(picks.len());

    for card in &picks {
        let tcg_card_id = card.tcg_card_id.clone().unwrap_or_default();
        let tier = tier_of(card);
        let duplicate = !owned.insert(tcg_card_id.clone());
        let points = if duplicate && award_points {
            tier.star_points()
        } else {
            0
        };
        dup_points += points;

        sqlx::query(
            "INSERT INTO user_cards (user_id, product_id, tcg_card_id, set_code, acquired_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(card.id)
        .bind(&tcg_card_id)
        .bind(&set_code)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        cards.push(DrawnCard {
            product_id: card.id,
            name: card.name.clone(),
            tcg_card_id,
            rarity: card.rarity.clone(),
            tier: tier.as_str().to_string(),
            image_url: card.image_url.clone(),
            duplicate,
            points,
        });
    }

    if dup_points > 0 {
        sqlx::query("UPDATE users SET star_points = star_points + ? WHERE id = ?")
            .bind(dup_points)
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO star_ledger (user_id, points, reason, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(dup_points)
        .bind(format!("Duplicates {}", set_code))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO pack_opens (user_id, set_code, opened_at, cards_json, dup_points, used_bonus) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user.id)
    .bind(&set_code)
    .bind(now)
    .bind(serde_json::to_string(&cards)?)
    .bind(dup_points)
    .bind(used_bonus as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        user_id = user.id,
        set = %set_code,
        cards = cards.len(),
        dup_points,
        used_bonus,
        "pack opened"
    );

    Ok(PackOpening {
        set_code,
        cards,
        dup_points,
        used_bonus,
    })
}

// ============ Sets ============

#[derive(Debug, Clone, Serialize)]
pub struct SetSummary {
    pub set_code: String,
    pub expansion: Option<String>,
    pub card_count: i64,
    pub image_url: Option<String>,
    pub enabled: bool,
    pub pack_size: i64,
    pub daily_available: bool,
    pub bonus_tokens: i64,
}

/// Every set with at least one card, with the caller's allowance state.
pub async fn list_sets(
    pool: &SqlitePool,
    defaults: &PacksConfig,
    user: Option<&User>,
) -> Result<Vec<SetSummary>> {
    let sql = format!(
        "SELECT {} FROM products p WHERE p.category = 'tcg' AND p.tcg_card_id LIKE '%-%' ORDER BY p.id",
        PRODUCT_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    let mut grouped: BTreeMap<String, (i64, Option<String>, Option<String>)> = BTreeMap::new();
    for row in &rows {
        let p = Product::from_row(row);
        let Some(code) = p.tcg_card_id.as_deref().and_then(set_code_of) else {
            continue;
        };
        let entry = grouped.entry(code).or_insert((0, None, None));
        entry.0 += 1;
        if entry.1.is_none() && !p.image_url.trim().is_empty() {
            entry.1 = Some(p.image_url.clone());
        }
        if entry.2.is_none() {
            entry.2 = p.expansion.clone().filter(|e| !e.trim().is_empty());
        }
    }

    let today = today_utc();
    let mut conn = pool.acquire().await?;
    let mut sets = Vec::with_capacity(grouped.len());

    for (set_code, (card_count, sample_image, expansion)) in grouped {
        let rule = find_rule(&mut conn, &set_code)
            .await?
            .unwrap_or_else(|| default_rule(&set_code, defaults));

        let (daily_available, bonus_tokens) = match user {
            Some(user) => {
                let row = sqlx::query(
                    "SELECT last_daily_open_date, bonus_tokens FROM pack_allowances \
                     WHERE user_id = ? AND set_code = ?",
                )
                .bind(user.id)
                .bind(&set_code)
                .fetch_optional(&mut *conn)
                .await?;
                match row {
                    Some(row) => {
                        let last: Option<String> = row.get("last_daily_open_date");
                        (last.as_deref() != Some(today.as_str()), row.get("bonus_tokens"))
                    }
                    None => (true, 0),
                }
            }
            None => (false, 0),
        };

        sets.push(SetSummary {
            image_url: rule.set_image_url.clone().or(sample_image),
            set_code,
            expansion,
            card_count,
            enabled: rule.enabled,
            pack_size: rule.pack_size,
            daily_available: daily_available && rule.enabled,
            bonus_tokens,
        });
    }

    Ok(sets)
}

// ============ Collection ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionQuery {
    /// Set code.
    #[serde(default)]
    pub exp: Option<String>,
    #[serde(default)]
    pub rare: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CollectionFacets {
    pub exp: Vec<String>,
    pub rare: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    pub items: Vec<OwnedCard>,
    /// Copies across all listed cards.
    pub total: i64,
    /// Distinct listed cards.
    pub unique: i64,
    pub facets: CollectionFacets,
}

fn filter_value(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub async fn collection(pool: &SqlitePool, user_id: i64, query: &CollectionQuery) -> Result<Collection> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        r#"
        SELECT uc.product_id, uc.tcg_card_id, uc.set_code,
               COUNT(*) AS quantity, MAX(uc.acquired_at) AS last_acquired_at,
               p.name, p.expansion, p.rarity, p.image_url
        FROM user_cards uc
        JOIN products p ON p.id = uc.product_id
        WHERE uc.user_id = "#,
    );
    qb.push_bind(user_id);

    if let Some(exp) = filter_value(&query.exp) {
        qb.push(" AND uc.set_code = ").push_bind(exp.to_lowercase());
    }
    if let Some(rare) = filter_value(&query.rare) {
        qb.push(" AND lower(p.rarity) = ").push_bind(rare.to_lowercase());
    }
    if let Some(q) = filter_value(&query.q) {
        let like = format!("%{}%", q.to_lowercase());
        qb.push(" AND (lower(p.name) LIKE ")
            .push_bind(like.clone())
            .push(" OR lower(p.description) LIKE ")
            .push_bind(like.clone())
            .push(" OR CAST(p.id AS TEXT) LIKE ")
            .push_bind(like)
            .push(")");
    }

    qb.push(" GROUP BY uc.product_id");
    qb.push(match query.sort.as_deref().unwrap_or("name") {
        "qty_desc" => " ORDER BY quantity DESC, p.name ASC",
        "qty_asc" => " ORDER BY quantity ASC, p.name ASC",
        "rarity" => " ORDER BY p.rarity ASC, p.name ASC",
        _ => " ORDER BY p.name ASC",
    });

    let rows = qb.build().fetch_all(pool).await?;
    let items: Vec<OwnedCard> = rows
        .iter()
        .map(|row| {
            let rarity: Option<String> = row.get("rarity");
            OwnedCard {
                product_id: row.get("product_id"),
                name: row.get("name"),
                tcg_card_id: row.get("tcg_card_id"),
                set_code: row.get("set_code"),
                expansion: row.get("expansion"),
                tier: rarity_tier(rarity.as_deref()).as_str().to_string(),
                rarity,
                image_url: row.get("image_url"),
                quantity: row.get("quantity"),
                last_acquired_at: row.get("last_acquired_at"),
            }
        })
        .collect();

    let exp: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT set_code FROM user_cards WHERE user_id = ? ORDER BY set_code",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    let rare: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT p.rarity FROM user_cards uc JOIN products p ON p.id = uc.product_id
        WHERE uc.user_id = ? AND p.rarity IS NOT NULL AND p.rarity != ''
        ORDER BY p.rarity
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(Collection {
        total: items.iter().map(|i| i.quantity).sum(),
        unique: items.len() as i64,
        items,
        facets: CollectionFacets { exp, rare },
    })
}

/// Delete every card a user owns; returns how many copies were removed.
pub async fn clear_collection(pool: &SqlitePool, user_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM user_cards WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Most recent pack openings first.
pub async fn history(pool: &SqlitePool, user_id: i64, limit: i64) -> Result<Vec<PackOpenRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM pack_opens WHERE user_id = ? ORDER BY opened_at DESC, id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(PackOpenRecord::from_row).collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub points: i64,
    pub reason: String,
    pub created_at: i64,
}

pub async fn ledger(pool: &SqlitePool, user_id: i64) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query(
        "SELECT points, reason, created_at FROM star_ledger WHERE user_id = ? ORDER BY id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| LedgerEntry {
            points: row.get("points"),
            reason: row.get("reason"),
            created_at: row.get("created_at"),
        })
        .collect())
}

// ============ Admin ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleUpdate {
    pub pack_size: Option<i64>,
    pub weights: Option<RarityWeights>,
    pub god_chance: Option<f64>,
    pub enabled: Option<bool>,
    pub set_image_url: Option<String>,
}

pub async fn upsert_rule(
    pool: &SqlitePool,
    defaults: &PacksConfig,
    set_code: &str,
    update: &RuleUpdate,
) -> Result<PackRule> {
    let set_code = set_code.trim().to_lowercase();
    if set_code.is_empty() {
        return Err(ShopError::BadRequest("set code is required".to_string()).into());
    }

    let mut tx = pool.begin().await?;
    let mut rule = get_or_create_rule(&mut tx, &set_code, defaults).await?;

    if let Some(size) = update.pack_size {
        if size < 1 {
            return Err(ShopError::BadRequest("pack_size must be >= 1".to_string()).into());
        }
        rule.pack_size = size;
    }
    if let Some(weights) = update.weights {
        weights
            .validate()
            .map_err(|e| ShopError::BadRequest(e.to_string()))?;
        rule.weights = weights;
    }
    if let Some(god_chance) = update.god_chance {
        if !(0.0..=1.0).contains(&god_chance) {
            return Err(ShopError::BadRequest("god_chance must be in [0, 1]".to_string()).into());
        }
        rule.god_chance = god_chance;
    }
    if let Some(enabled) = update.enabled {
        rule.enabled = enabled;
    }
    if let Some(url) = &update.set_image_url {
        let url = url.trim();
        rule.set_image_url = (!url.is_empty()).then(|| url.to_string());
    }

    sqlx::query(
        r#"
        UPDATE pack_rules
        SET pack_size = ?, weights_json = ?, god_chance = ?, enabled = ?, set_image_url = ?
        WHERE set_code = ?
        "#,
    )
    .bind(rule.pack_size)
    .bind(serde_json::to_string(&rule.weights)?)
    .bind(rule.god_chance)
    .bind(rule.enabled as i64)
    .bind(&rule.set_image_url)
    .bind(&set_code)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(set = %set_code, enabled = rule.enabled, "pack rule updated");
    Ok(rule)
}

/// Give a user extra opens for a set; returns the updated allowance.
pub async fn grant_tokens(
    pool: &SqlitePool,
    user_id: i64,
    set_code: &str,
    tokens: i64,
) -> Result<PackAllowance> {
    let set_code = set_code.trim().to_lowercase();
    if tokens < 1 {
        return Err(ShopError::BadRequest("tokens must be >= 1".to_string()).into());
    }

    let mut tx = pool.begin().await?;
    let allowance = get_or_create_allowance(&mut tx, user_id, &set_code).await?;
    sqlx::query(
        "UPDATE pack_allowances SET bonus_tokens = bonus_tokens + ? WHERE user_id = ? AND set_code = ?",
    )
    .bind(tokens)
    .bind(user_id)
    .bind(&set_code)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(user_id, set = %set_code, tokens, "granted bonus tokens");
    Ok(PackAllowance {
        bonus_tokens: allowance.bonus_tokens + tokens,
        ..allowance
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: i64, rarity: &str) -> Product {
        Product {
            id,
            name: format!("Card {}", id),
            poke_type: "colorless".to_string(),
            category: "tcg".to_string(),
            description: String::new(),
            base_price: 1.0,
            stock: 1,
            image_url: format!("/img/{}.png", id),
            created_at: id,
            expansion: Some("Test Set".to_string()),
            rarity: Some(rarity.to_string()),
            language: None,
            condition: None,
            card_number: Some(id.to_string()),
            tcg_card_id: Some(format!("ts-{}", id)),
            market_price: None,
            market_currency: None,
            market_source: None,
            market_updated_at: None,
        }
    }

    fn rule(size: i64, god: f64, weights: RarityWeights) -> PackRule {
        PackRule {
            id: 1,
            set_code: "ts".to_string(),
            pack_size: size,
            weights,
            god_chance: god,
            enabled: true,
            set_image_url: None,
        }
    }

    fn mixed_set() -> Vec<Product> {
        let mut cards = Vec::new();
        for i in 1..=20 {
            cards.push(card(i, "Common"));
        }
        for i in 21..=30 {
            cards.push(card(i, "Uncommon"));
        }
        for i in 31..=34 {
            cards.push(card(i, "Double Rare"));
        }
        for i in 35..=36 {
            cards.push(card(i, "Special Illustration Rare"));
        }
        cards
    }

    #[test]
    fn test_rarity_tier() {
        assert_eq!(rarity_tier(None), Tier::Common);
        assert_eq!(rarity_tier(Some("")), Tier::Common);
        assert_eq!(rarity_tier(Some("Common")), Tier::Common);
        assert_eq!(rarity_tier(Some("Uncommon")), Tier::Uncommon);
        assert_eq!(rarity_tier(Some("Rare Holo")), Tier::Rare);
        assert_eq!(rarity_tier(Some("Double Rare")), Tier::Rare);
        assert_eq!(rarity_tier(Some("Ultra Rare")), Tier::Rare);
        assert_eq!(rarity_tier(Some("Hyper Gold")), Tier::Rare);
        assert_eq!(rarity_tier(Some("Secret")), Tier::Rare);
        assert_eq!(rarity_tier(Some("Illustration Rare")), Tier::Illustration);
        assert_eq!(rarity_tier(Some("Promo")), Tier::Common);
    }

    #[test]
    fn test_star_points() {
        assert_eq!(Tier::Common.star_points(), 1);
        assert_eq!(Tier::Uncommon.star_points(), 2);
        assert_eq!(Tier::Rare.star_points(), 5);
        assert_eq!(Tier::Illustration.star_points(), 25);
    }

    #[test]
    fn test_set_code_of() {
        assert_eq!(set_code_of("SV3-223").as_deref(), Some("sv3"));
        assert_eq!(set_code_of("base1-4").as_deref(), Some("base1"));
        assert_eq!(set_code_of("nohyphen"), None);
        assert_eq!(set_code_of("-12"), None);
    }

    #[test]
    fn test_empty_universe_draws_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(draw_pack(&rule(10, 0.0, RarityWeights::default()), &[], &mut rng).is_empty());
    }

    #[test]
    fn test_pack_size_and_rare_guarantee() {
        let cards = mixed_set();
        let r = rule(10, 0.0, RarityWeights::default());
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let pack = draw_pack(&r, &cards, &mut rng);
            assert_eq!(pack.len(), 10);
            assert!(pack.iter().any(|c| tier_of(c).is_rare_or_better()), "seed {}", seed);
        }
    }

    #[test]
    fn test_rare_guarantee_replaces_last_slot() {
        let cards = mixed_set();
        let weights = RarityWeights {
            common: 1.0,
            uncommon: 0.0,
            rare: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let pack = draw_pack(&rule(5, 0.0, weights), &cards, &mut rng);
        assert_eq!(pack.len(), 5);
        assert!(pack[..4].iter().all(|c| tier_of(c) == Tier::Common));
        assert!(tier_of(&pack[4]).is_rare_or_better());
    }

    #[test]
    fn test_no_rares_in_set_means_no_guarantee() {
        let cards: Vec<Product> = (1..=5).map(|i| card(i, "Common")).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let pack = draw_pack(&rule(8, 0.0, RarityWeights::default()), &cards, &mut rng);
        assert_eq!(pack.len(), 8);
        assert!(pack.iter().all(|c| tier_of(c) == Tier::Common));
    }

    #[test]
    fn test_empty_pools_degrade() {
        // Only uncommons: every slot still gets a card.
        let cards: Vec<Product> = (1..=3).map(|i| card(i, "Uncommon")).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let pack = draw_pack(&rule(6, 0.0, RarityWeights::default()), &cards, &mut rng);
        assert_eq!(pack.len(), 6);
        assert!(pack.iter().all(|c| tier_of(c) == Tier::Uncommon));
    }

    #[test]
    fn test_god_pack() {
        let mut cards = mixed_set();
        for i in 40..=52 {
            cards.push(card(i, "Illustration Rare"));
        }
        let mut rng = StdRng::seed_from_u64(5);
        let pack = draw_pack(&rule(10, 1.0, RarityWeights::default()), &cards, &mut rng);
        assert_eq!(pack.len(), 10);
        assert!(pack.iter().all(|c| tier_of(c) == Tier::Illustration));
    }

    #[test]
    fn test_god_pack_tops_up_small_illustration_pool() {
        let cards = mixed_set();
        let mut rng = StdRng::seed_from_u64(9);
        let pack = draw_pack(&rule(10, 1.0, RarityWeights::default()), &cards, &mut rng);
        assert_eq!(pack.len(), 10);
        let illus = pack[..2].iter().filter(|c| tier_of(c) == Tier::Illustration).count();
        assert_eq!(illus, 2);
    }

    #[test]
    fn test_cutoffs_normalise_weights() {
        let (c, u) = cutoffs(&RarityWeights {
            common: 2.0,
            uncommon: 1.0,
            rare: 1.0,
        });
        assert!((c - 0.5).abs() < 1e-9);
        assert!((u - 0.75).abs() < 1e-9);
    }
}
