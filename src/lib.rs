//! # PokeShop
//!
//! A collectible card storefront: a catalog with full-text search and
//! facets, carts, checkout with promo codes, reviews and wishlists, a
//! dynamic pricing rule engine, an AI layer (semantic search and a
//! retrieval-augmented assistant) and a card-pack reward engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Catalog    │──▶│  Embeddings  │──▶│    SQLite    │
//! │ Cart/Orders  │   │ hash/OpenAI  │   │ FTS5 + BLOBs │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │
//!                      ┌───────────────────────┤
//!                      ▼                       ▼
//!                 ┌──────────┐           ┌──────────┐
//!                 │   CLI    │           │   HTTP   │
//!                 │(pokeshop)│           │  (JSON)  │
//!                 └──────────┘           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pokeshop init                       # create database
//! pokeshop import ./data/products.json
//! pokeshop embed build                # index products for semantic search
//! pokeshop search "fire starter deck" --category tcg
//! pokeshop serve                      # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Row types |
//! | [`auth`], [`session`] | Accounts and server-side sessions |
//! | [`catalog`] | Listing, facets, product pages, admin writes |
//! | [`pricing`] | Dynamic pricing rules |
//! | [`cart`], [`checkout`] | Carts, orders and promo codes |
//! | [`reviews`], [`wishlist`] | Shopper feedback |
//! | [`embedding`], [`embed_cmd`], [`search`] | Vector index and semantic search |
//! | [`ai_cache`], [`chat`], [`assistant`] | RAG assistant |
//! | [`packs`] | Card-pack reward engine |
//! | [`market`] | Market prices from pokemontcg.io |
//! | [`server`] | HTTP JSON API |
//! | [`db`], [`migrate`] | Database connection and schema |

pub mod ai_cache;
pub mod assistant;
pub mod auth;
pub mod cart;
pub mod catalog;
pub mod chat;
pub mod checkout;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod market;
pub mod migrate;
pub mod models;
pub mod packs;
pub mod pricing;
pub mod reviews;
pub mod search;
pub mod server;
pub mod session;
pub mod wishlist;
