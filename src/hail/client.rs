use async_trait::async_trait;
use chrono::Duration;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::hail::token::{TokenError, TokenManager};
use crate::model::{ApiHealth, ObjectType, TokenState};
use crate::notice::NoticeSink;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authorised with Hail")]
    NotAuthorised,
    #[error("invalid Hail endpoint '{0}'")]
    InvalidUri(String),
    #[error("request to {uri} failed: {source}")]
    Transport {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Hail returned {status} for {uri}: {body}")]
    Status {
        uri: String,
        status: StatusCode,
        body: String,
    },
    #[error("malformed JSON from {uri}: {source}")]
    Decode {
        uri: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected response from {uri}: {reason}")]
    Unexpected { uri: String, reason: &'static str },
}

/// The subset of the Hail API used by importers and the fetch orchestrator.
#[async_trait]
pub trait HailApi: Send + Sync {
    /// Authenticated GET. Failures are reported to the notice sink before
    /// being returned.
    async fn try_get(&self, uri: &str, params: &[(&str, String)]) -> Result<Value, ApiError>;

    /// Like [`HailApi::try_get`] but yields an empty list on failure. An empty
    /// result therefore means "fetch failed or nothing there", never an error.
    async fn get(&self, uri: &str, params: &[(&str, String)]) -> Value {
        match self.try_get(uri, params).await {
            Ok(value) => value,
            Err(_) => Value::Array(Vec::new()),
        }
    }

    async fn get_one(&self, object_type: ObjectType, hail_id: &str) -> Result<Value, ApiError> {
        self.try_get(&object_type.object_uri(hail_id), &[]).await
    }

    /// Local copies older than this are refetched.
    fn refresh_rate(&self) -> Duration;
}

/// An `{id, name}` pair from a Hail collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub id: String,
    pub name: String,
}

#[derive(Clone)]
pub struct HailClient {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenManager>,
    notices: Arc<dyn NoticeSink>,
    refresh_rate: Duration,
}

impl fmt::Debug for HailClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HailClient")
            .field("base_url", &self.base_url)
            .field("refresh_rate", &self.refresh_rate)
            .finish_non_exhaustive()
    }
}

impl HailClient {
    pub fn new(
        http: Client,
        base_url: Url,
        tokens: Arc<TokenManager>,
        notices: Arc<dyn NoticeSink>,
        refresh_rate: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            tokens,
            notices,
            refresh_rate,
        }
    }

    pub fn from_config(
        cfg: &Config,
        http: Client,
        tokens: Arc<TokenManager>,
        notices: Arc<dyn NoticeSink>,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(&cfg.hail.api_base)
            .map_err(|_| ApiError::InvalidUri(cfg.hail.api_base.clone()))?;
        let refresh_rate = Duration::seconds(cfg.hail.refresh_rate_seconds as i64);
        Ok(Self::new(http, base_url, tokens, notices, refresh_rate))
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    fn endpoint(&self, uri: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(uri.trim_start_matches('/'))
            .map_err(|_| ApiError::InvalidUri(uri.to_string()))
    }

    async fn authorised(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self
            .tokens
            .access_token()
            .await
            .ok_or(ApiError::NotAuthorised)?;
        Ok(request
            .bearer_auth(token)
            .header("Accept", "application/json"))
    }

    async fn execute(&self, uri: &str, request: RequestBuilder) -> Result<Value, ApiError> {
        let res = request.send().await.map_err(|source| ApiError::Transport {
            uri: uri.to_string(),
            source,
        })?;
        let status = res.status();
        let body = res.text().await.map_err(|source| ApiError::Transport {
            uri: uri.to_string(),
            source,
        })?;
        if !status.is_success() {
            return Err(ApiError::Status {
                uri: uri.to_string(),
                status,
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|source| ApiError::Decode {
            uri: uri.to_string(),
            source,
        })
    }

    /// Log, notify and record API health for the outcome of one request.
    async fn settle(&self, res: Result<Value, ApiError>) -> Result<Value, ApiError> {
        match &res {
            Ok(_) => self.tokens.record_health(ApiHealth::Ok).await,
            Err(err) => {
                warn!(?err, "Hail API request failed");
                self.notices.error(&format!("Hail API error: {err}")).await;
                self.tokens
                    .record_health(ApiHealth::Error(err.to_string()))
                    .await;
            }
        }
        res
    }

    #[instrument(skip_all, fields(uri = %uri))]
    pub async fn post(&self, uri: &str, body: &Value) -> Result<Value, ApiError> {
        let res: Result<Value, ApiError> = async {
            let url = self.endpoint(uri)?;
            let request = self.authorised(self.http.post(url).json(body)).await?;
            self.execute(uri, request).await
        }
        .await;
        self.settle(res).await
    }

    /// Complete the OAuth callback: exchange the code, then remember which
    /// user authorised us.
    #[instrument(skip_all)]
    pub async fn authorise(&self, code: &str) -> Result<TokenState, AuthoriseError> {
        self.tokens.fetch_access_token(code).await?;
        let me = self.try_get("users/me", &[]).await?;
        let user_id = id_of(&me).ok_or(ApiError::Unexpected {
            uri: "users/me".into(),
            reason: "missing user id",
        })?;
        Ok(self.tokens.set_user(user_id).await?)
    }

    /// Organisations the authorising user belongs to, sorted by name.
    pub async fn organisations(&self) -> Result<Vec<NamedRef>, ApiError> {
        let user_id = self
            .tokens
            .snapshot()
            .await
            .user_id
            .ok_or(ApiError::NotAuthorised)?;
        let value = self
            .try_get(&format!("users/{}/organisations", user_id), &[])
            .await?;
        Ok(flatten_named(&value))
    }

    /// Tags of the given organisations as `(label, tag id)`, sorted by label.
    /// Labels carry the organisation name when more than one is involved.
    pub async fn tag_list(
        &self,
        org_ids: &[String],
        private: bool,
    ) -> Result<Vec<NamedRef>, ApiError> {
        let tag_type = if private {
            ObjectType::PrivateTag
        } else {
            ObjectType::PublicTag
        };
        let orgs = if org_ids.len() > 1 {
            self.organisations().await?
        } else {
            Vec::new()
        };
        let mut per_org = Vec::with_capacity(org_ids.len());
        for org_id in org_ids {
            let value = self.try_get(&tag_type.listing_uri(org_id), &[]).await?;
            let org_name = orgs
                .iter()
                .find(|o| &o.id == org_id)
                .map(|o| o.name.clone())
                .unwrap_or_else(|| org_id.clone());
            per_org.push((org_name, flatten_named(&value)));
        }
        Ok(merge_org_lists(per_org))
    }
}

#[derive(Debug, Error)]
pub enum AuthoriseError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[async_trait]
impl HailApi for HailClient {
    #[instrument(skip_all, fields(uri = %uri))]
    async fn try_get(&self, uri: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let res: Result<Value, ApiError> = async {
            let url = self.endpoint(uri)?;
            let request = self.authorised(self.http.get(url).query(params)).await?;
            debug!("GET");
            self.execute(uri, request).await
        }
        .await;
        self.settle(res).await
    }

    fn refresh_rate(&self) -> Duration {
        self.refresh_rate
    }
}

/// Remote ids are strings, but some endpoints return them as numbers.
pub fn id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Display name of a remote object: `name`, falling back to `title`.
pub fn name_of(value: &Value) -> Option<String> {
    ["name", "title"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Turn a collection (a bare array or `{"data": [...]}`) into name-sorted refs.
pub fn flatten_named(value: &Value) -> Vec<NamedRef> {
    let items: &[Value] = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    let mut refs: Vec<NamedRef> = items
        .iter()
        .filter_map(|item| {
            Some(NamedRef {
                id: id_of(item)?,
                name: name_of(item).unwrap_or_default(),
            })
        })
        .collect();
    refs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    refs
}

/// Merge per-organisation lists, prefixing with `"{org} - "` when there is
/// more than one organisation.
pub fn merge_org_lists(per_org: Vec<(String, Vec<NamedRef>)>) -> Vec<NamedRef> {
    let prefix = per_org.len() > 1;
    let mut merged: Vec<NamedRef> = per_org
        .into_iter()
        .flat_map(|(org_name, refs)| {
            refs.into_iter().map(move |r| NamedRef {
                name: if prefix {
                    format!("{} - {}", org_name, r.name)
                } else {
                    r.name
                },
                id: r.id,
            })
        })
        .collect();
    merged.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::hail::token::{OAuthEndpoints, SqliteTokenStore};
    use crate::model::NoticeLevel;
    use crate::notice::LogSink;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct CountingSink {
        errors: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl NoticeSink for CountingSink {
        async fn notify(&self, level: NoticeLevel, _message: &str) {
            if level == NoticeLevel::Error {
                *self.errors.lock().unwrap() += 1;
            }
        }
    }

    async fn client(server: &MockServer, notices: Arc<dyn NoticeSink>) -> (HailClient, db::Pool) {
        let pool = db::memory_pool().await.unwrap();
        let authorised =
            TokenState::default().with_tokens("acc".into(), "ref".into(), 3600, Utc::now());
        assert!(db::save_token_state(&pool, &authorised).await.unwrap());
        let with_user = authorised.with_user("u1".into());
        assert!(db::save_token_state(&pool, &with_user).await.unwrap());

        let endpoints = OAuthEndpoints {
            authorize_url: Url::parse(&format!("{}/oauth/authorise", server.uri())).unwrap(),
            token_url: Url::parse(&format!("{}/oauth/access_token", server.uri())).unwrap(),
            redirect_uri: "http://localhost/cb".into(),
            scope: "user.basic".into(),
        };
        let tokens = TokenManager::load(
            Client::new(),
            crate::model::Credentials {
                client_id: "cid".into(),
                client_secret: "secret".into(),
            },
            endpoints,
            Arc::new(SqliteTokenStore::new(pool.clone())),
            notices.clone(),
        )
        .await
        .unwrap();
        let base = Url::parse(&format!("{}/api/v1/", server.uri())).unwrap();
        let client = HailClient::new(
            Client::new(),
            base,
            Arc::new(tokens),
            notices,
            Duration::hours(1),
        );
        (client, pool)
    }

    #[tokio::test]
    async fn get_sends_bearer_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/organisations/o1/articles"))
            .and(header("Authorization", "Bearer acc"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "a1"}])))
            .expect(1)
            .mount(&server)
            .await;

        let (client, pool) = client(&server, Arc::new(LogSink)).await;
        let value = client
            .try_get("organisations/o1/articles", &[("limit", "2".to_string())])
            .await
            .unwrap();
        assert_eq!(value[0]["id"], "a1");
        assert_eq!(
            db::load_token_state(&pool).await.unwrap().api_health,
            ApiHealth::Ok
        );
    }

    #[tokio::test]
    async fn get_returns_empty_on_failure_and_reports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/articles/a1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let sink = Arc::new(CountingSink::default());
        let (client, pool) = client(&server, sink.clone()).await;
        let value = client.get("articles/a1", &[]).await;
        assert_eq!(value, json!([]));
        assert_eq!(*sink.errors.lock().unwrap(), 1);

        let err = client.get_one(ObjectType::Article, "a1").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status, .. } if status.as_u16() == 500));
        let health = db::load_token_state(&pool).await.unwrap().api_health;
        assert!(matches!(health, ApiHealth::Error(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/images/i1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let (client, _pool) = client(&server, Arc::new(LogSink)).await;
        let err = client.get_one(ObjectType::Image, "i1").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test]
    async fn tag_list_prefixes_with_org_name_for_many_orgs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/u1/organisations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "o2", "name": "Beta"},
                {"id": "o1", "name": "Alpha"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/organisations/o1/tags"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "t1", "name": "News"}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/organisations/o2/tags"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "t2", "name": "Events"}])),
            )
            .mount(&server)
            .await;

        let (client, _pool) = client(&server, Arc::new(LogSink)).await;
        let tags = client
            .tag_list(&["o1".to_string(), "o2".to_string()], false)
            .await
            .unwrap();
        let labels: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(labels, vec!["Alpha - News", "Beta - Events"]);

        let single = client.tag_list(&["o1".to_string()], false).await.unwrap();
        assert_eq!(single[0].name, "News");
    }

    #[tokio::test]
    async fn authorise_stores_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "refresh_token": "fresh-ref",
                "expires_in": 7200
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/me"))
            .and(header("Authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
            .mount(&server)
            .await;

        let (client, pool) = client(&server, Arc::new(LogSink)).await;
        let state = client.authorise("the-code").await.unwrap();
        assert_eq!(state.user_id.as_deref(), Some("42"));
        let stored = db::load_token_state(&pool).await.unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh"));
        assert_eq!(stored.user_id.as_deref(), Some("42"));
    }

    #[test]
    fn flatten_named_sorts_and_accepts_data_envelope() {
        let refs = flatten_named(&json!({"data": [
            {"id": "2", "name": "zeta"},
            {"id": 1, "title": "alpha"},
            {"name": "no id"}
        ]}));
        assert_eq!(
            refs,
            vec![
                NamedRef {
                    id: "1".into(),
                    name: "alpha".into()
                },
                NamedRef {
                    id: "2".into(),
                    name: "zeta".into()
                },
            ]
        );
    }

    #[test]
    fn merge_keeps_names_for_single_org() {
        let one = vec![NamedRef {
            id: "t".into(),
            name: "Tag".into(),
        }];
        assert_eq!(merge_org_lists(vec![("Org".into(), one.clone())]), one);
    }
}
