// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Campus API Library
//!
//! HTTP surface of the billing engine: webhook intake, purchase initiation,
//! enrollment confirmation, and the catalog sync hook.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::ApiError;
pub use state::AppState;
