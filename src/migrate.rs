use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        is_admin INTEGER NOT NULL DEFAULT 0,
        favorite_types TEXT NOT NULL DEFAULT '[]',
        full_name TEXT,
        ship_address TEXT,
        star_points INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        poke_type TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'general',
        description TEXT NOT NULL DEFAULT '',
        base_price REAL NOT NULL,
        stock INTEGER NOT NULL DEFAULT 0,
        image_url TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        expansion TEXT,
        rarity TEXT,
        language TEXT,
        condition TEXT,
        card_number TEXT,
        tcg_card_id TEXT,
        market_price REAL,
        market_currency TEXT,
        market_source TEXT,
        market_updated_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_views (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
        product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        ts INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        total REAL NOT NULL,
        discount REAL NOT NULL DEFAULT 0,
        promo_code TEXT,
        status TEXT NOT NULL DEFAULT 'created',
        ship_name TEXT,
        ship_address TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
        product_id INTEGER NOT NULL REFERENCES products(id),
        product_name TEXT NOT NULL,
        unit_price REAL NOT NULL,
        quantity INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS promo_codes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        code TEXT NOT NULL UNIQUE,
        percent INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        max_uses INTEGER,
        used_count INTEGER NOT NULL DEFAULT 0,
        expires_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wishlist (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL,
        UNIQUE(user_id, product_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reviews (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        rating INTEGER NOT NULL,
        comment TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(user_id, product_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cart_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        quantity INTEGER NOT NULL DEFAULT 1,
        updated_at INTEGER NOT NULL,
        UNIQUE(user_id, product_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_embeddings (
        product_id INTEGER PRIMARY KEY REFERENCES products(id) ON DELETE CASCADE,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB NOT NULL,
        fingerprint TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ai_cache (
        cache_key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pack_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        set_code TEXT NOT NULL UNIQUE,
        pack_size INTEGER NOT NULL DEFAULT 10,
        weights_json TEXT NOT NULL,
        god_chance REAL NOT NULL DEFAULT 0.001,
        enabled INTEGER NOT NULL DEFAULT 1,
        set_image_url TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pack_allowances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        set_code TEXT NOT NULL,
        last_daily_open_date TEXT,
        bonus_tokens INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        UNIQUE(user_id, set_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pack_opens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        set_code TEXT NOT NULL,
        opened_at INTEGER NOT NULL,
        cards_json TEXT NOT NULL,
        dup_points INTEGER NOT NULL DEFAULT 0,
        used_bonus INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        product_id INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        tcg_card_id TEXT NOT NULL,
        set_code TEXT NOT NULL,
        acquired_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS star_ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        points INTEGER NOT NULL,
        reason TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_products_category ON products(category)",
    "CREATE INDEX IF NOT EXISTS idx_products_created_at ON products(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_products_tcg_card_id ON products(tcg_card_id)",
    "CREATE INDEX IF NOT EXISTS idx_product_views_user ON product_views(user_id, product_id)",
    "CREATE INDEX IF NOT EXISTS idx_order_items_product ON order_items(product_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_user_cards_user_set ON user_cards(user_id, set_code)",
    "CREATE INDEX IF NOT EXISTS idx_pack_opens_user ON pack_opens(user_id, opened_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_star_ledger_user ON star_ledger(user_id)",
];

// Keep product_fts in step with products (external content table).
const FTS_TRIGGERS: &[&str] = &[
    r#"
    CREATE TRIGGER IF NOT EXISTS products_fts_ai AFTER INSERT ON products BEGIN
        INSERT INTO product_fts(rowid, name, description, poke_type, category, expansion, rarity)
        VALUES (new.id, new.name, new.description, new.poke_type, new.category,
                new.expansion, new.rarity);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS products_fts_ad AFTER DELETE ON products BEGIN
        INSERT INTO product_fts(product_fts, rowid, name, description, poke_type, category, expansion, rarity)
        VALUES ('delete', old.id, old.name, old.description, old.poke_type, old.category,
                old.expansion, old.rarity);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS products_fts_au AFTER UPDATE ON products BEGIN
        INSERT INTO product_fts(product_fts, rowid, name, description, poke_type, category, expansion, rarity)
        VALUES ('delete', old.id, old.name, old.description, old.poke_type, old.category,
                old.expansion, old.rarity);
        INSERT INTO product_fts(rowid, name, description, poke_type, category, expansion, rarity)
        VALUES (new.id, new.name, new.description, new.poke_type, new.category,
                new.expansion, new.rarity);
    END
    "#,
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table, index and trigger on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='product_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE product_fts USING fts5(
                name,
                description,
                poke_type,
                category,
                expansion,
                rarity,
                content='products',
                content_rowid='id'
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Index rows that predate the FTS table.
        sqlx::query("INSERT INTO product_fts(product_fts) VALUES ('rebuild')")
            .execute(pool)
            .await?;
    }

    for ddl in FTS_TRIGGERS {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
