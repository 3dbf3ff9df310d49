//! Retrieval-augmented shopping assistant.
//!
//! Questions are answered from the catalog: semantic search picks the most
//! relevant products, their details become the model's context, and the
//! reply is cached by normalised question so a repeat skips both retrieval
//! and the model call. Without a chat model the assistant still answers,
//! listing the related products itself.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

use crate::ai_cache;
use crate::catalog;
use crate::chat::{create_chat_model, ChatMessage, ChatModel};
use crate::config::{AssistantConfig, Config};
use crate::db;
use crate::embedding::Embedder;
use crate::error::ShopError;
use crate::models::{Product, ScoredProduct, PRODUCT_COLUMNS};
use crate::search::{self, SearchFilters};

const QA_NAMESPACE: &str = "qa";
const LOCAL_MODEL: &str = "local";

const SYSTEM_PROMPT: &str = "You are the assistant of a Pokémon store. Answer briefly and clearly, \
     using the product context you are given. If you are not sure, say so and suggest related products.";
const PRODUCT_PROMPT: &str =
    "You are an advisor at a Pokémon store. Answer clearly, briefly and helpfully.";
const CHAT_PROMPT: &str = "You are the assistant of a Pokémon store. Be clear and helpful.";

const DECK_KEYWORDS: &[&str] = &["mazo", "deck", "meta"];
const DECK_DISABLED_REPLY: &str =
    "The deck builder is disabled for now. Here are some related cards in case you want to explore.";
const CHAT_DISABLED_REPLY: &str = "The AI chat is not available right now.";
pub const AI_FAILED_REPLY: &str = "Could not get an answer from the AI right now.";
const PRODUCT_DISABLED_REPLY: &str =
    "The AI assistant is not available. Check the product description and specifications.";

const SUGGESTION_LIMIT: usize = 8;

/// How `ask` should reach an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AskMode {
    /// Retrieval over the catalog, then the model (or a local summary).
    #[default]
    Rag,
    /// The question goes straight to the chat model.
    Direct,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub hits: Vec<ScoredProduct>,
    pub cached: bool,
}

/// One message in a chat session, as stored in the session data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub text: String,
    #[serde(default)]
    pub product_ids: Vec<i64>,
}

/// A chat turn with its suggested products loaded.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedTurn {
    pub role: String,
    pub text: String,
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatHealth {
    pub ok: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedAnswer {
    answer: String,
    #[serde(default)]
    hit_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct Assistant {
    pool: SqlitePool,
    embedder: Arc<Embedder>,
    chat: Option<Arc<dyn ChatModel>>,
    settings: AssistantConfig,
}

impl Assistant {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<Embedder>,
        chat: Option<Arc<dyn ChatModel>>,
        settings: AssistantConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            chat,
            settings,
        }
    }

    pub fn chat_enabled(&self) -> bool {
        self.chat.is_some()
    }

    fn model_name(&self) -> &str {
        self.chat
            .as_ref()
            .map(|c| c.model_name())
            .unwrap_or(LOCAL_MODEL)
    }

    /// Semantic catalog search with the assistant's default depth.
    pub async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<ScoredProduct>> {
        search::semantic_search(
            &self.pool,
            &self.embedder,
            query,
            self.settings.search_k,
            filters,
        )
        .await
    }

    pub async fn ask(&self, question: &str, mode: AskMode) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ShopError::BadRequest("question is empty".to_string()).into());
        }

        if mode == AskMode::Direct {
            if let Some(chat) = &self.chat {
                let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(question)];
                match chat.complete(&messages, None).await {
                    Ok(answer) => {
                        return Ok(Answer {
                            answer,
                            hits: Vec::new(),
                            cached: false,
                        })
                    }
                    Err(e) => warn!(error = %e, "direct chat failed, answering from catalog"),
                }
            }
        }

        self.answer_question(question, self.settings.retrieval_k)
            .await
    }

    /// Answer from the catalog, consulting the answer cache first.
    pub async fn answer_question(&self, question: &str, k: usize) -> Result<Answer> {
        let key = ai_cache::make_key(QA_NAMESPACE, self.model_name(), question);

        if let Some(value) = ai_cache::get(&self.pool, &key).await? {
            if let Ok(cached) = serde_json::from_value::<CachedAnswer>(value) {
                let mut hits = Vec::with_capacity(cached.hit_ids.len());
                for id in cached.hit_ids {
                    if let Some(product) = catalog::get_product(&self.pool, id).await? {
                        hits.push(ScoredProduct {
                            product,
                            score: 0.0,
                        });
                    }
                }
                return Ok(Answer {
                    answer: cached.answer,
                    hits,
                    cached: true,
                });
            }
        }

        let hits = search::semantic_search(
            &self.pool,
            &self.embedder,
            question,
            k,
            &SearchFilters::default(),
        )
        .await?;
        let hit_ids: Vec<i64> = hits.iter().map(|h| h.product.id).collect();

        if let Some(chat) = &self.chat {
            let context = build_context(&hits);
            let messages = [
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Question: {}\n\nContext:\n{}\n\nAnswer:",
                    question, context
                )),
            ];
            match chat.complete(&messages, None).await {
                Ok(answer) => {
                    let entry = CachedAnswer {
                        answer: answer.clone(),
                        hit_ids,
                    };
                    ai_cache::set(&self.pool, &key, &serde_json::to_value(&entry)?).await?;
                    return Ok(Answer {
                        answer,
                        hits,
                        cached: false,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "chat completion failed, using local answer");
                    return Ok(Answer {
                        answer: local_answer(&hits),
                        hits,
                        cached: false,
                    });
                }
            }
        }

        let answer = local_answer(&hits);
        let entry = CachedAnswer {
            answer: answer.clone(),
            hit_ids,
        };
        ai_cache::set(&self.pool, &key, &serde_json::to_value(&entry)?).await?;
        Ok(Answer {
            answer,
            hits,
            cached: false,
        })
    }

    /// Answer a question scoped to one product.
    pub async fn ask_about_product(&self, product_id: i64, question: &str) -> Result<String> {
        let product = catalog::get_product(&self.pool, product_id)
            .await?
            .ok_or_else(|| ShopError::NotFound(format!("product {}", product_id)))?;

        let question = question.trim();
        if question.is_empty() {
            return Err(ShopError::BadRequest("question is empty".to_string()).into());
        }

        let Some(chat) = &self.chat else {
            return Ok(PRODUCT_DISABLED_REPLY.to_string());
        };

        let context = format!(
            "Product: {}\nType: {} | Category: {}\nBase price: {:.2}\nDescription: {}",
            product.name, product.poke_type, product.category, product.base_price, product.description
        );
        let messages = [
            ChatMessage::system(PRODUCT_PROMPT),
            ChatMessage::user(format!(
                "Question: {}\n\nProduct context:\n{}\n\nAnswer:",
                question, context
            )),
        ];

        match chat.complete(&messages, None).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                warn!(product_id, error = %e, "product question failed");
                Ok(AI_FAILED_REPLY.to_string())
            }
        }
    }

    /// Append a user message and the assistant's reply to `history`.
    ///
    /// History is trimmed to the configured number of messages.
    pub async fn send(&self, history: &mut Vec<ChatTurn>, text: &str) -> Result<ChatTurn> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ShopError::BadRequest("message is empty".to_string()).into());
        }

        history.push(ChatTurn {
            role: "user".to_string(),
            text: text.to_string(),
            product_ids: Vec::new(),
        });

        let lower = text.to_lowercase();
        let reply = if DECK_KEYWORDS.iter().any(|k| lower.contains(k)) {
            DECK_DISABLED_REPLY.to_string()
        } else if let Some(chat) = &self.chat {
            let messages = [ChatMessage::system(CHAT_PROMPT), ChatMessage::user(text)];
            match chat.complete(&messages, Some(450)).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "chat reply failed");
                    AI_FAILED_REPLY.to_string()
                }
            }
        } else {
            CHAT_DISABLED_REPLY.to_string()
        };

        let product_ids = match self.suggest_products(text, SUGGESTION_LIMIT).await {
            Ok(products) => products.iter().map(|p| p.id).collect(),
            Err(e) => {
                warn!(error = %e, "product suggestions failed");
                Vec::new()
            }
        };

        let turn = ChatTurn {
            role: "assistant".to_string(),
            text: reply,
            product_ids,
        };
        history.push(turn.clone());

        let keep = self.settings.chat_history;
        if history.len() > keep {
            history.drain(..history.len() - keep);
        }

        Ok(turn)
    }

    /// Load the suggested products of each turn, preserving their order.
    pub async fn render_history(&self, history: &[ChatTurn]) -> Result<Vec<RenderedTurn>> {
        let mut rendered = Vec::with_capacity(history.len());
        for turn in history {
            let mut products = Vec::with_capacity(turn.product_ids.len());
            for id in &turn.product_ids {
                if let Some(p) = catalog::get_product(&self.pool, *id).await? {
                    products.push(p);
                }
            }
            rendered.push(RenderedTurn {
                role: turn.role.clone(),
                text: turn.text.clone(),
                products,
            });
        }
        Ok(rendered)
    }

    /// TCG cards related to `text`: semantic hits, then full-text matches,
    /// then substring matches. Only cards with an image, newest first.
    pub async fn suggest_products(&self, text: &str, limit: usize) -> Result<Vec<Product>> {
        let mut products: Vec<Product> = Vec::new();
        let push = |products: &mut Vec<Product>, p: Product| {
            if p.category == "tcg" && !products.iter().any(|q| q.id == p.id) {
                products.push(p);
            }
        };

        let filters = SearchFilters {
            category: Some("tcg".to_string()),
            poke_type: None,
        };
        match search::semantic_search(&self.pool, &self.embedder, text, limit, &filters).await {
            Ok(hits) => {
                for hit in hits {
                    push(&mut products, hit.product);
                }
            }
            Err(e) => warn!(error = %e, "semantic suggestions failed"),
        }

        if products.len() < limit {
            for id in catalog::fts_match_ids(&self.pool, text, (limit * 2) as i64).await? {
                if let Some(p) = catalog::get_product(&self.pool, id).await? {
                    push(&mut products, p);
                }
            }
        }

        if products.len() < limit {
            let like = format!("%{}%", text.to_lowercase());
            let sql = format!(
                "SELECT {} FROM products p WHERE p.category = 'tcg' \
                 AND (lower(p.name) LIKE ? OR lower(p.description) LIKE ?) LIMIT ?",
                PRODUCT_COLUMNS
            );
            let rows = sqlx::query(&sql)
                .bind(&like)
                .bind(&like)
                .bind((limit * 2) as i64)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                push(&mut products, Product::from_row(row));
            }
        }

        products.retain(|p| !p.image_url.trim().is_empty());
        products.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        products.truncate(limit);
        Ok(products)
    }

    /// Ping the chat model.
    pub async fn chat_health(&self) -> ChatHealth {
        let Some(chat) = &self.chat else {
            return ChatHealth {
                ok: false,
                model: LOCAL_MODEL.to_string(),
                reply: None,
                error: Some("chat provider is disabled".to_string()),
            };
        };

        match chat.complete(&[ChatMessage::user("ping")], Some(4)).await {
            Ok(reply) => ChatHealth {
                ok: true,
                model: chat.model_name().to_string(),
                reply: Some(reply),
                error: None,
            },
            Err(e) => ChatHealth {
                ok: false,
                model: chat.model_name().to_string(),
                reply: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// CLI entry point: answer one question and print it with its sources.
pub async fn run_ask(config: &Config, question: &str, mode: AskMode) -> Result<()> {
    let pool = db::connect(config).await?;
    let embedder = Arc::new(Embedder::new(&config.embedding)?);
    let chat = create_chat_model(&config.chat)?;
    let assistant = Assistant::new(pool.clone(), embedder, chat, config.assistant.clone());

    let answer = assistant.ask(question, mode).await?;
    println!("{}", answer.answer);
    if !answer.hits.is_empty() {
        println!();
        println!("Sources{}:", if answer.cached { " (cached)" } else { "" });
        for hit in &answer.hits {
            println!("  - [{}] {}", hit.product.id, hit.product.name);
        }
    }

    pool.close().await;
    Ok(())
}

fn build_context(hits: &[ScoredProduct]) -> String {
    if hits.is_empty() {
        return "No data.".to_string();
    }
    hits.iter()
        .map(|h| {
            let p = &h.product;
            format!(
                "- {} | Type: {} | Base price: {:.2}\n  {}",
                p.name, p.poke_type, p.base_price, p.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn local_answer(hits: &[ScoredProduct]) -> String {
    let mut text = String::from("No external AI is enabled; here are related products:\n");
    if hits.is_empty() {
        text.push_str("(no related products found)");
        return text;
    }
    let bullets: Vec<String> = hits
        .iter()
        .map(|h| {
            format!(
                "- {} (type {}, $ {:.2})",
                h.product.name, h.product.poke_type, h.product.base_price
            )
        })
        .collect();
    text.push_str(&bullets.join("\n"));
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(name: &str, price: f64) -> ScoredProduct {
        ScoredProduct {
            product: Product {
                id: 1,
                name: name.to_string(),
                poke_type: "fire".to_string(),
                category: "tcg".to_string(),
                description: "hot".to_string(),
                base_price: price,
                stock: 1,
                image_url: String::new(),
                created_at: 0,
                expansion: None,
                rarity: None,
                language: None,
                condition: None,
                card_number: None,
                tcg_card_id: None,
                market_price: None,
                market_currency: None,
                market_source: None,
                market_updated_at: None,
            },
            score: 0.5,
        }
    }

    #[test]
    fn test_context_lines() {
        assert_eq!(
            build_context(&[hit("Charmander", 3.5)]),
            "- Charmander | Type: fire | Base price: 3.50\n  hot"
        );
        assert_eq!(build_context(&[]), "No data.");
    }

    #[test]
    fn test_local_answer_lists_products() {
        let text = local_answer(&[hit("Charmander", 3.5), hit("Charizard", 99.0)]);
        assert!(text.contains("- Charmander (type fire, $ 3.50)"));
        assert!(text.contains("- Charizard (type fire, $ 99.00)"));
    }

    #[test]
    fn test_ask_mode_parses_lowercase() {
        let mode: AskMode = serde_json::from_str("\"direct\"").unwrap();
        assert_eq!(mode, AskMode::Direct);
        assert_eq!(AskMode::default(), AskMode::Rag);
    }
}
