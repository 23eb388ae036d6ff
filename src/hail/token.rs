//! OAuth token manager.
//!
//! The manager owns the current [`TokenState`] snapshot. Every change is
//! computed as a new snapshot and written through a [`TokenStore`] with a
//! version check, so two processes refreshing at once cannot silently
//! overwrite each other.
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::{ApiHealth, Credentials, TokenState};
use crate::notice::NoticeSink;

/// Refresh when the access token has less than this left.
pub const REFRESH_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Hail client id and secret are not configured")]
    NotConfigured,
    #[error("no Hail refresh token stored; authorise first")]
    NoRefreshToken,
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("token state changed concurrently (stored version {0})")]
    Conflict(i64),
    #[error("token store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Persistence for token snapshots.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<TokenState>;

    /// Write `state` if the stored version is `state.version - 1`.
    /// Returns `false` on a version mismatch.
    async fn save(&self, state: &TokenState) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SqliteTokenStore {
    pool: Pool,
}

impl SqliteTokenStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn load(&self) -> anyhow::Result<TokenState> {
        db::load_token_state(&self.pool).await
    }

    async fn save(&self, state: &TokenState) -> anyhow::Result<bool> {
        db::save_token_state(&self.pool, state).await
    }
}

/// Successful response of the OAuth token endpoint.
#[derive(Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: Url,
    pub token_url: Url,
    pub redirect_uri: String,
    pub scope: String,
}

impl OAuthEndpoints {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            authorize_url: Url::parse(&cfg.hail.authorize_url)
                .context("invalid hail.authorize_url")?,
            token_url: Url::parse(&cfg.hail.token_url).context("invalid hail.token_url")?,
            redirect_uri: cfg.hail.redirect_uri.clone(),
            scope: cfg.hail.scope.clone(),
        })
    }
}

pub struct TokenManager {
    http: Client,
    credentials: Credentials,
    endpoints: OAuthEndpoints,
    store: Arc<dyn TokenStore>,
    notices: Arc<dyn NoticeSink>,
    state: Mutex<TokenState>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("credentials", &self.credentials)
            .field("token_url", &self.endpoints.token_url)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Build a manager seeded with the snapshot currently in `store`.
    pub async fn load(
        http: Client,
        credentials: Credentials,
        endpoints: OAuthEndpoints,
        store: Arc<dyn TokenStore>,
        notices: Arc<dyn NoticeSink>,
    ) -> Result<Self, TokenError> {
        let state = store.load().await?;
        Ok(Self {
            http,
            credentials,
            endpoints,
            store,
            notices,
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> TokenState {
        self.state.lock().await.clone()
    }

    pub async fn is_authorised(&self) -> bool {
        self.state.lock().await.is_authorised()
    }

    pub fn is_ready_to_authorise(&self) -> bool {
        self.credentials.is_configured()
    }

    /// URL the operator visits to grant access; Hail redirects back with `?code=`.
    pub fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.endpoints.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("redirect_uri", &self.endpoints.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.endpoints.scope)
            .append_pair("state", state);
        url
    }

    /// Current access token, refreshed first when it is about to expire.
    ///
    /// A failed refresh has already been reported to the notice sink; the
    /// previous (possibly stale or missing) token is returned in that case.
    pub async fn access_token(&self) -> Option<String> {
        let current = match self.reload().await {
            Ok(state) => state,
            Err(err) => {
                warn!(?err, "failed to reload Hail token state, using cached token");
                self.snapshot().await
            }
        };
        let window = Duration::minutes(REFRESH_WINDOW_MINUTES);
        if current.refresh_token.is_some() && current.expires_within(window, Utc::now()) {
            debug!(expiry = ?current.access_token_expiry, "access token near expiry, refreshing");
            if let Ok(next) = self.refresh_access_token().await {
                return next.access_token;
            }
        }
        self.snapshot().await.access_token
    }

    /// Exchange the stored refresh token for a new token pair.
    #[instrument(skip_all)]
    pub async fn refresh_access_token(&self) -> Result<TokenState, TokenError> {
        let refresh_token = self
            .reload()
            .await?
            .refresh_token
            .ok_or(TokenError::NoRefreshToken)?;
        let grant = self
            .request_grant(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await?;
        let next = self.apply_grant(grant).await?;
        info!(expiry = ?next.access_token_expiry, "refreshed Hail access token");
        Ok(next)
    }

    /// Exchange an authorization code from the OAuth callback for a token pair.
    #[instrument(skip_all)]
    pub async fn fetch_access_token(&self, code: &str) -> Result<TokenState, TokenError> {
        let grant = self
            .request_grant(&[("grant_type", "authorization_code"), ("code", code)])
            .await?;
        let next = self.apply_grant(grant).await?;
        info!(expiry = ?next.access_token_expiry, "obtained Hail access token");
        Ok(next)
    }

    pub async fn set_user(&self, user_id: String) -> Result<TokenState, TokenError> {
        self.commit(|s| s.with_user(user_id.clone())).await
    }

    pub async fn set_organisations(
        &self,
        organisations: Vec<String>,
    ) -> Result<TokenState, TokenError> {
        self.commit(|s| s.with_organisations(organisations.clone()))
            .await
    }

    /// Persist the API health only when it changed.
    pub async fn record_health(&self, health: ApiHealth) {
        if self.state.lock().await.api_health == health {
            return;
        }
        if let Err(err) = self.commit(|s| s.with_health(health.clone())).await {
            warn!(?err, "failed to persist Hail API health");
        }
    }

    /// Adopt the stored snapshot when another process wrote a newer one, e.g.
    /// the CLI authorising while a worker is running.
    async fn reload(&self) -> Result<TokenState, TokenError> {
        let stored = self.store.load().await?;
        let mut guard = self.state.lock().await;
        if stored.version > guard.version {
            debug!(
                cached = guard.version,
                stored = stored.version,
                "adopting newer stored token state"
            );
            *guard = stored;
        }
        Ok(guard.clone())
    }

    async fn request_grant(&self, grant: &[(&str, &str)]) -> Result<TokenGrant, TokenError> {
        let res = self.try_request_grant(grant).await;
        if let Err(err) = &res {
            warn!(?err, "Hail token request failed");
            self.notices
                .error(&format!("Hail authorisation failed: {err}"))
                .await;
        }
        res
    }

    async fn try_request_grant(&self, grant: &[(&str, &str)]) -> Result<TokenGrant, TokenError> {
        if !self.is_ready_to_authorise() {
            return Err(TokenError::NotConfigured);
        }
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("redirect_uri", self.endpoints.redirect_uri.as_str()),
        ];
        form.extend_from_slice(grant);

        let res = self
            .http
            .post(self.endpoints.token_url.clone())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TokenError::Api { status, body });
        }
        Ok(res.json::<TokenGrant>().await?)
    }

    async fn apply_grant(&self, grant: TokenGrant) -> Result<TokenState, TokenError> {
        let now = Utc::now();
        let res = self
            .commit(|s| {
                s.with_tokens(
                    grant.access_token.clone(),
                    grant.refresh_token.clone(),
                    grant.expires_in,
                    now,
                )
            })
            .await;
        // The grant is already spent on Hail's side; losing it needs a re-authorise.
        if let Err(err) = &res {
            warn!(?err, "failed to save Hail token grant");
            self.notices
                .error(&format!("Hail token could not be saved: {err}"))
                .await;
        }
        res
    }

    /// Derive a snapshot from the current one and persist it. On a version
    /// conflict the stored snapshot is reloaded and the change re-applied once.
    async fn commit<F>(&self, change: F) -> Result<TokenState, TokenError>
    where
        F: Fn(&TokenState) -> TokenState + Send,
    {
        let mut guard = self.state.lock().await;
        let next = change(&*guard);
        if self.store.save(&next).await? {
            *guard = next.clone();
            return Ok(next);
        }

        let latest = self.store.load().await?;
        debug!(
            ours = guard.version,
            stored = latest.version,
            "token state moved underneath us, re-applying"
        );
        let next = change(&latest);
        *guard = latest;
        if self.store.save(&next).await? {
            *guard = next.clone();
            Ok(next)
        } else {
            Err(TokenError::Conflict(guard.version))
        }
    }
}
