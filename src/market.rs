//! Market prices from the pokemontcg.io v2 API.
//!
//! Cards of a set are fetched page by page, reduced to a single reference
//! price each (TCGplayer in USD, else Cardmarket in EUR) and matched to
//! catalog products by collector number.

use anyhow::{bail, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, MarketConfig};
use crate::db;
use crate::packs::set_code_of;
use crate::pricing::round2;

const API_KEY_ENV: &str = "POKEMONTCG_API_KEY";

/// Seconds to wait after a 429: the Retry-After header within [0.5, 5],
/// or one second when it is missing or not a finite number.
fn retry_after_secs(header: Option<&str>) -> f64 {
    header
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|w| w.is_finite())
        .unwrap_or(1.0)
        .clamp(0.5, 5.0)
}

/// A reference price for one card.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketPrice {
    pub price: f64,
    pub currency: &'static str,
    pub source: &'static str,
}

pub struct MarketClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
    max_retries: u32,
}

impl MarketClient {
    pub fn new(config: &MarketConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()),
            page_size: config.page_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            let mut req = self
                .http
                .get(&url)
                .header("Accept", "application/json")
                .query(query);
            if let Some(key) = &self.api_key {
                req = req.header("X-Api-Key", key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 {
                        let wait = retry_after_secs(
                            response
                                .headers()
                                .get("Retry-After")
                                .and_then(|v| v.to_str().ok()),
                        );
                        debug!(attempt, wait, "market API rate limited");
                        last_err = Some(anyhow::anyhow!("Market API rate limited"));
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        continue;
                    }

                    if status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("Market API error {}: {}", status, body));
                        tokio::time::sleep(Duration::from_secs(1 << attempt.min(5))).await;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    bail!("Market API error {}: {}", status, body);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    let wait = (0.5 * (attempt + 1) as f64).min(3.0);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Market API request failed after retries")))
    }

    /// Every card of a set with its number and price blocks.
    pub async fn fetch_set_cards(&self, set_code: &str) -> Result<Vec<Value>> {
        let set_code = set_code.trim().to_lowercase();
        let mut cards = Vec::new();
        let mut page = 1u32;

        loop {
            let json = self
                .get_json(
                    "/cards",
                    &[
                        ("q", format!("set.id:{}", set_code)),
                        ("pageSize", self.page_size.to_string()),
                        ("page", page.to_string()),
                        ("select", "number,tcgplayer,cardmarket".to_string()),
                    ],
                )
                .await?;

            let batch = json
                .get("data")
                .and_then(|d| d.as_array())
                .cloned()
                .unwrap_or_default();
            let n = batch.len();
            cards.extend(batch);

            if n == 0 || n < self.page_size as usize {
                break;
            }
            page += 1;
        }

        debug!(set = %set_code, cards = cards.len(), "fetched set cards");
        Ok(cards)
    }
}

fn positive(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64).filter(|p| *p > 0.0)
}

/// The first usable price of a card.
pub fn extract_market(card: &Value) -> Option<MarketPrice> {
    if let Some(prices) = card.pointer("/tcgplayer/prices") {
        for variant in ["holofoil", "reverseHolofoil", "normal"] {
            let Some(p) = prices.get(variant) else {
                continue;
            };
            let found = positive(p.get("market"))
                .or_else(|| positive(p.get("mid")))
                .or_else(|| positive(p.get("low")));
            if let Some(price) = found {
                return Some(MarketPrice {
                    price,
                    currency: "USD",
                    source: "tcgplayer",
                });
            }
        }
    }

    let prices = card.pointer("/cardmarket/prices")?;
    ["trendPrice", "averageSellPrice", "avg1", "avg7"]
        .iter()
        .find_map(|k| positive(prices.get(*k)))
        .map(|price| MarketPrice {
            price,
            currency: "EUR",
            source: "cardmarket",
        })
}

/// Lookup keys for a collector number: as given, without leading zeros and,
/// when numeric, zero-padded to three digits.
pub fn number_keys(number: &str) -> Vec<String> {
    let raw = number.trim().to_lowercase();
    if raw.is_empty() {
        return Vec::new();
    }
    let stripped = raw.trim_start_matches('0');
    let stripped = if stripped.is_empty() { "0" } else { stripped };

    let mut keys = vec![raw.clone()];
    for key in [
        stripped.to_string(),
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            format!("{:0>3}", stripped)
        } else {
            String::new()
        },
    ] {
        if !key.is_empty() && !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Map every number key of every priced card to its price.
pub fn price_map(cards: &[Value]) -> HashMap<String, MarketPrice> {
    let mut map = HashMap::new();
    for card in cards {
        let Some(price) = extract_market(card) else {
            continue;
        };
        let number = match card.get("number") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        for key in number_keys(&number) {
            map.insert(key, price);
        }
    }
    map
}

/// Write prices onto the set's trading-card products. Products refreshed
/// within `max_age_days` are left alone. Returns how many were updated.
pub async fn apply_prices(
    pool: &SqlitePool,
    set_code: &str,
    prices: &HashMap<String, MarketPrice>,
    max_age_days: Option<i64>,
) -> Result<usize> {
    if prices.is_empty() {
        return Ok(0);
    }
    let set_code = set_code.trim().to_lowercase();
    let now = chrono::Utc::now().timestamp();
    let cutoff = max_age_days.map(|d| now - d * 86_400);

    let rows = sqlx::query(
        "SELECT id, tcg_card_id, market_updated_at FROM products \
         WHERE category = 'tcg' AND tcg_card_id IS NOT NULL AND tcg_card_id != '' \
         AND lower(tcg_card_id) LIKE ?",
    )
    .bind(format!("{}-%", set_code))
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    let mut updated = 0;

    for row in &rows {
        let id: i64 = row.get("id");
        let tcg_card_id: String = row.get("tcg_card_id");
        let last: Option<i64> = row.get("market_updated_at");

        if let (Some(cutoff), Some(last)) = (cutoff, last) {
            if last > cutoff {
                continue;
            }
        }
        let Some((_, number)) = tcg_card_id.split_once('-') else {
            continue;
        };
        let Some(found) = number_keys(number).iter().find_map(|k| prices.get(k)) else {
            continue;
        };

        sqlx::query(
            "UPDATE products SET market_price = ?, market_currency = ?, market_source = ?, \
             market_updated_at = ? WHERE id = ?",
        )
        .bind(round2(found.price))
        .bind(found.currency)
        .bind(found.source)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        updated += 1;
    }

    tx.commit().await?;
    Ok(updated)
}

pub async fn update_prices_by_set(
    pool: &SqlitePool,
    client: &MarketClient,
    set_code: &str,
    max_age_days: Option<i64>,
) -> Result<usize> {
    let set_code = set_code.trim().to_lowercase();
    if set_code.is_empty() {
        return Ok(0);
    }
    let cards = client.fetch_set_cards(&set_code).await?;
    let prices = price_map(&cards);
    let updated = apply_prices(pool, &set_code, &prices, max_age_days).await?;
    info!(set = %set_code, fetched = cards.len(), updated, "market prices updated");
    Ok(updated)
}

/// Set codes of every trading card in the catalog.
pub async fn known_sets(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT tcg_card_id FROM products \
         WHERE category = 'tcg' AND tcg_card_id IS NOT NULL AND tcg_card_id != ''",
    )
    .fetch_all(pool)
    .await?;
    let sets: BTreeSet<String> = ids.iter().filter_map(|id| set_code_of(id)).collect();
    Ok(sets.into_iter().collect())
}

/// Refresh every known set. A set that fails is logged and skipped.
pub async fn update_all(
    pool: &SqlitePool,
    client: &MarketClient,
    max_age_days: Option<i64>,
) -> Result<usize> {
    let mut total = 0;
    for set_code in known_sets(pool).await? {
        match update_prices_by_set(pool, client, &set_code, max_age_days).await {
            Ok(n) => total += n,
            Err(e) => warn!(set = %set_code, error = %e, "market update failed"),
        }
    }
    Ok(total)
}

pub async fn run_market_update(
    config: &Config,
    set_code: Option<&str>,
    max_age_days: Option<i64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let client = MarketClient::new(&config.market)?;

    let updated = match set_code {
        Some(set) => update_prices_by_set(&pool, &client, set, max_age_days).await?,
        None => update_all(&pool, &client, max_age_days).await?,
    };

    println!("Market prices updated: {} products", updated);
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_after_is_bounded() {
        assert_eq!(retry_after_secs(Some("2")), 2.0);
        assert_eq!(retry_after_secs(Some("120")), 5.0);
        assert_eq!(retry_after_secs(Some("0")), 0.5);
        assert_eq!(retry_after_secs(None), 1.0);
        assert_eq!(retry_after_secs(Some("Wed, 21 Oct 2026 07:28:00 GMT")), 1.0);
        assert_eq!(retry_after_secs(Some("NaN")), 1.0);
        assert_eq!(retry_after_secs(Some("inf")), 1.0);
        assert_eq!(retry_after_secs(Some("-inf")), 1.0);
    }

    #[test]
    fn test_extract_prefers_tcgplayer_holofoil() {
        let card = json!({
            "tcgplayer": {"prices": {
                "normal": {"market": 1.0},
                "holofoil": {"market": null, "mid": 4.5}
            }},
            "cardmarket": {"prices": {"trendPrice": 9.0}}
        });
        assert_eq!(
            extract_market(&card),
            Some(MarketPrice {
                price: 4.5,
                currency: "USD",
                source: "tcgplayer"
            })
        );
    }

    #[test]
    fn test_extract_falls_back_to_cardmarket() {
        let card = json!({
            "tcgplayer": {"prices": {"normal": {"market": 0}}},
            "cardmarket": {"prices": {"trendPrice": 0, "averageSellPrice": 2.25}}
        });
        let price = extract_market(&card).unwrap();
        assert_eq!(price.price, 2.25);
        assert_eq!(price.currency, "EUR");
        assert_eq!(price.source, "cardmarket");
    }

    #[test]
    fn test_extract_none_without_prices() {
        assert_eq!(extract_market(&json!({"number": "1"})), None);
    }

    #[test]
    fn test_number_keys() {
        assert_eq!(number_keys("007"), vec!["007", "7"]);
        assert_eq!(number_keys("7"), vec!["7", "007"]);
        assert_eq!(number_keys("123"), vec!["123"]);
        assert_eq!(number_keys("000"), vec!["000", "0"]);
        assert_eq!(number_keys("TG05"), vec!["tg05"]);
        assert!(number_keys("  ").is_empty());
    }

    #[test]
    fn test_price_map_keys_every_variant() {
        let cards = vec![
            json!({"number": "4", "tcgplayer": {"prices": {"normal": {"low": 0.3}}}}),
            json!({"number": "5"}),
        ];
        let map = price_map(&cards);
        assert_eq!(map.len(), 2);
        assert_eq!(map["004"].price, 0.3);
        assert_eq!(map["4"].price, 0.3);
    }
}
