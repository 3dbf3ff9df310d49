//! Domain error type for the storefront.
//!
//! Services return `anyhow::Result`; failures the HTTP layer must turn into
//! a specific status are raised as [`ShopError`] and recovered with
//! `downcast_ref` in the server.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShopError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("login required")]
    Unauthorized,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("admin privileges required")]
    Forbidden,

    #[error("{0}")]
    Conflict(String),

    #[error("not enough stock for {name}: available {available}, requested {requested}")]
    OutOfStock {
        name: String,
        available: i64,
        requested: i64,
    },

    #[error("{0}")]
    PackUnavailable(String),
}

impl ShopError {
    /// Machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Forbidden => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::OutOfStock { .. } => "out_of_stock",
            Self::PackUnavailable(_) => "pack_unavailable",
        }
    }
}
