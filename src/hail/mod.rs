//! Hail API access: OAuth token management and the authenticated client.
use reqwest::Client;
use std::time::Duration;

use crate::config::Config;

pub mod client;
pub mod token;

pub use client::{ApiError, HailApi, HailClient, NamedRef};
pub use token::{SqliteTokenStore, TokenError, TokenManager, TokenStore};

const USER_AGENT: &str = "hail-sync/0.1";

/// Shared HTTP client for both the OAuth endpoint and the API.
pub fn http_client(cfg: &Config) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(cfg.hail.timeout_secs))
        .build()
}
