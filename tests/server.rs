//! HTTP API tests against a server bound to an ephemeral port.

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

use pokeshop::chat::{ChatMessage, ChatModel};
use pokeshop::config::Config;
use pokeshop::models::NewProduct;
use pokeshop::server::{build_router, AppState};
use pokeshop::{auth, catalog, db, migrate};

struct EchoChat;

#[async_trait]
impl ChatModel for EchoChat {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, messages: &[ChatMessage], _max_tokens: Option<u32>) -> anyhow::Result<String> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        Ok(format!("echo: {}", last.lines().next().unwrap_or_default()))
    }
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    pool: SqlitePool,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("shop.sqlite"));
        config.server.upload_dir = tmp.path().join("uploads");
        std::fs::create_dir_all(&config.server.upload_dir).unwrap();

        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();

        let state = AppState::new(config, pool.clone(), Some(Arc::new(EchoChat))).unwrap();
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            _tmp: tmp,
            base: format!("http://{}", addr),
            pool,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn product(&self, name: &str, price: f64, stock: i64) -> i64 {
        catalog::create_product(
            &self.pool,
            &NewProduct {
                name: name.to_string(),
                poke_type: "electric".to_string(),
                base_price: price,
                stock,
                ..NewProduct::default()
            },
        )
        .await
        .unwrap()
        .id
    }
}

/// `name=value` from a response's `Set-Cookie` header.
fn session_cookie(resp: &reqwest::Response) -> String {
    let raw = resp
        .headers()
        .get(SET_COOKIE)
        .expect("response should set a session cookie")
        .to_str()
        .unwrap();
    raw.split(';').next().unwrap().to_string()
}

async fn register(server: &TestServer, email: &str) -> String {
    let resp = server
        .client
        .post(server.url("/auth/register"))
        .json(&json!({ "email": email, "password": "pikapika", "full_name": "Ash" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let cookie = session_cookie(&resp);
    let user: Value = resp.json().await.unwrap();
    assert_eq!(user["email"], email);
    assert!(user.get("password_hash").is_none());
    cookie
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(SET_COOKIE).is_none());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_guest_cart_persists_in_session() {
    let server = TestServer::start().await;
    let id = server.product("Pikachu Plush", 20.0, 10).await;

    let resp = server
        .client
        .post(server.url("/cart/items"))
        .json(&json!({ "product_id": id, "quantity": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = session_cookie(&resp);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["count"], 2);

    let resp = server
        .client
        .get(server.url("/cart"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert!(resp.headers().get(SET_COOKIE).is_none());
    let cart: Value = resp.json().await.unwrap();
    assert_eq!(cart["count"], 2);
    assert_eq!(cart["lines"][0]["product"]["id"], id);
}

async fn session_rows(server: &TestServer) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
        .fetch_one(&server.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_anonymous_browsing_stores_no_session() {
    let server = TestServer::start().await;
    server.product("Pikachu Plush", 20.0, 10).await;

    for path in ["/products", "/products?q=pika", "/cart", "/auth/me", "/packs"] {
        let resp = server.client.get(server.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{}", path);
        assert!(resp.headers().get(SET_COOKIE).is_none(), "{}", path);
    }
    assert_eq!(session_rows(&server).await, 0);
}

#[tokio::test]
async fn test_sign_in_moves_session_to_new_id() {
    let server = TestServer::start().await;
    let id = server.product("Pikachu Plush", 20.0, 10).await;

    let resp = server
        .client
        .post(server.url("/cart/items"))
        .json(&json!({ "product_id": id, "quantity": 2 }))
        .send()
        .await
        .unwrap();
    let guest_cookie = session_cookie(&resp);
    assert_eq!(session_rows(&server).await, 1);

    let resp = server
        .client
        .post(server.url("/auth/register"))
        .header(COOKIE, &guest_cookie)
        .json(&json!({ "email": "brock@example.com", "password": "onix1234" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let user_cookie = session_cookie(&resp);
    assert_ne!(user_cookie, guest_cookie);
    assert_eq!(session_rows(&server).await, 1);

    // The pre-login id no longer names any session.
    let me: Value = server
        .client
        .get(server.url("/auth/me"))
        .header(COOKIE, &guest_cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(me["user"].is_null());
    assert_eq!(me["cart_count"], 0);

    let me: Value = server
        .client
        .get(server.url("/auth/me"))
        .header(COOKIE, &user_cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["user"]["email"], "brock@example.com");
    assert_eq!(me["cart_count"], 2);

    let resp = server
        .client
        .post(server.url("/auth/logout"))
        .header(COOKIE, &user_cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(session_cookie(&resp), "pokeshop_session=");
    assert_eq!(session_rows(&server).await, 0);

    let me: Value = server
        .client
        .get(server.url("/auth/me"))
        .header(COOKIE, &user_cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(me["user"].is_null());
}

#[tokio::test]
async fn test_register_then_checkout() {
    let server = TestServer::start().await;
    let id = server.product("Thunder Deck", 15.0, 4).await;
    let cookie = register(&server, "ash@example.com").await;

    let resp = server
        .client
        .post(server.url("/cart/items"))
        .header(COOKIE, &cookie)
        .json(&json!({ "product_id": id, "quantity": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .client
        .post(server.url("/checkout"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let order: Value = resp.json().await.unwrap();
    assert_eq!(order["items"][0]["quantity"], 3);
    assert_eq!(order["status"], "created");

    let resp = server
        .client
        .post(server.url("/cart/items"))
        .header(COOKIE, &cookie)
        .json(&json!({ "product_id": id, "quantity": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .client
        .post(server.url("/checkout"))
        .header(COOKIE, &cookie)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "out_of_stock");

    let orders: Value = server
        .client
        .get(server.url("/orders"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(orders.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_error_body_shape() {
    let server = TestServer::start().await;

    let resp = server.client.get(server.url("/orders")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
    assert!(body["error"]["message"].is_string());

    let resp = server
        .client
        .get(server.url("/products/4242"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .post(server.url("/auth/login"))
        .json(&json!({ "email": "ghost@example.com", "password": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_credentials");
}

#[tokio::test]
async fn test_admin_routes_require_admin() {
    let server = TestServer::start().await;
    let cookie = register(&server, "misty@example.com").await;

    let resp = server
        .client
        .get(server.url("/admin/products"))
        .header(COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    auth::grant_admin(&server.pool, "misty@example.com")
        .await
        .unwrap();

    let resp = server
        .client
        .post(server.url("/admin/products"))
        .header(COOKIE, &cookie)
        .json(&json!({ "name": "Staryu Figure", "type": "water", "price": 9.5, "stock": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let product: Value = resp.json().await.unwrap();
    assert_eq!(product["poke_type"], "water");
    let product_id = product["id"].as_i64().unwrap();
    let fingerprint_sql = "SELECT fingerprint FROM product_embeddings WHERE product_id = ?";
    let before: String = sqlx::query_scalar(fingerprint_sql)
        .bind(product_id)
        .fetch_one(&server.pool)
        .await
        .unwrap();

    let resp = server
        .client
        .patch(server.url(&format!("/admin/products/{}", product_id)))
        .header(COOKIE, &cookie)
        .json(&json!({ "description": "Poseable star with a glowing core" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let after: String = sqlx::query_scalar(fingerprint_sql)
        .bind(product_id)
        .fetch_one(&server.pool)
        .await
        .unwrap();
    assert_ne!(after, before);

    let resp = server
        .client
        .post(server.url("/admin/promos"))
        .header(COOKIE, &cookie)
        .json(&json!({ "code": "WATER5", "percent": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = server
        .client
        .post(server.url("/admin/promos"))
        .header(COOKIE, &cookie)
        .json(&json!({ "code": "BROKEN", "percent": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pack_responses_are_not_cached() {
    let server = TestServer::start().await;

    let resp = server.client.get(server.url("/packs")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(CACHE_CONTROL).unwrap(), "no-store");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sets"], json!([]));
    assert_eq!(body["star_points"], 0);

    let resp = server
        .client
        .post(server.url("/packs/sv3/open"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get(CACHE_CONTROL).unwrap(), "no-store");
}

#[tokio::test]
async fn test_ask_uses_chat_model_then_cache() {
    let server = TestServer::start().await;
    server.product("Pikachu Plush", 20.0, 10).await;

    let first: Value = server
        .client
        .post(server.url("/ai/ask"))
        .json(&json!({ "question": "Which plush?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["cached"], false);
    assert_eq!(first["answer"], "echo: Question: Which plush?");

    let second: Value = server
        .client
        .post(server.url("/ai/ask"))
        .json(&json!({ "question": "which   PLUSH?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["cached"], true);
    assert_eq!(second["answer"], first["answer"]);

    let resp = server
        .client
        .post(server.url("/ai/ask"))
        .json(&json!({ "question": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
