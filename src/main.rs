//! # PokeShop CLI (`pokeshop`)
//!
//! The `pokeshop` binary sets up the database, seeds and indexes the
//! catalog, answers questions from the terminal and runs the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! pokeshop --config ./config/pokeshop.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pokeshop init` | Create the SQLite database and run schema migrations |
//! | `pokeshop serve` | Start the HTTP JSON API |
//! | `pokeshop import <file>` | Insert products from a JSON array |
//! | `pokeshop embed build` | Embed new or changed products |
//! | `pokeshop embed rebuild` | Drop and regenerate every product vector |
//! | `pokeshop search "<query>"` | Semantic product search |
//! | `pokeshop ask "<question>"` | Ask the catalog assistant |
//! | `pokeshop admin grant <email>` | Give a user admin rights |
//! | `pokeshop market update` | Refresh market prices from pokemontcg.io |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use pokeshop::assistant::{self, AskMode};
use pokeshop::search::{self, SearchFilters};
use pokeshop::{auth, catalog, config, embed_cmd, market, migrate, server};

/// PokeShop: a collectible card storefront with semantic search, a
/// catalog assistant and a card-pack reward engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pokeshop.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "pokeshop", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pokeshop.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Start the HTTP JSON API.
    Serve,

    /// Import products from a JSON array file.
    Import {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Manage the product vector index.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Semantic product search.
    Search {
        /// The search query string.
        query: String,

        /// Only return products of this category (e.g. `tcg`).
        #[arg(long)]
        category: Option<String>,

        /// Only return products of this Pokémon type.
        #[arg(long = "type")]
        poke_type: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask the catalog assistant a question.
    Ask {
        question: String,

        /// Send the question straight to the chat model, skipping retrieval.
        #[arg(long)]
        direct: bool,
    },

    /// Administrative tasks.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },

    /// Market price maintenance.
    Market {
        #[command(subcommand)]
        action: MarketAction,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed products that are new or changed since they were last embedded.
    Build,
    /// Delete every stored vector and embed all products again.
    Rebuild,
}

#[derive(Subcommand)]
enum AdminAction {
    /// Grant admin rights to an existing user.
    Grant { email: String },
}

#[derive(Subcommand)]
enum MarketAction {
    /// Fetch current prices for one set, or every set in the catalog.
    Update {
        /// Set code (e.g. `sv3`).
        #[arg(long)]
        set: Option<String>,

        /// Skip products refreshed within this many days.
        #[arg(long)]
        max_age_days: Option<i64>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Import { file } => {
            catalog::run_import(&cfg, &file).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Build => embed_cmd::run_embed(&cfg, false).await?,
            EmbedAction::Rebuild => embed_cmd::run_embed(&cfg, true).await?,
        },
        Commands::Search {
            query,
            category,
            poke_type,
            limit,
        } => {
            let filters = SearchFilters {
                category,
                poke_type,
            };
            search::run_search(&cfg, &query, filters, limit).await?;
        }
        Commands::Ask { question, direct } => {
            let mode = if direct { AskMode::Direct } else { AskMode::Rag };
            assistant::run_ask(&cfg, &question, mode).await?;
        }
        Commands::Admin { action } => match action {
            AdminAction::Grant { email } => {
                auth::run_admin_grant(&cfg, &email).await?;
            }
        },
        Commands::Market { action } => match action {
            MarketAction::Update { set, max_age_days } => {
                market::run_market_update(&cfg, set.as_deref(), max_age_days).await?;
            }
        },
    }

    Ok(())
}
