use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote object categories that can be imported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Article,
    Image,
    Video,
    Publication,
    PublicTag,
    PrivateTag,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::Article,
        ObjectType::Image,
        ObjectType::Video,
        ObjectType::Publication,
        ObjectType::PublicTag,
        ObjectType::PrivateTag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Article => "Article",
            ObjectType::Image => "Image",
            ObjectType::Video => "Video",
            ObjectType::Publication => "Publication",
            ObjectType::PublicTag => "PublicTag",
            ObjectType::PrivateTag => "PrivateTag",
        }
    }

    /// Accepts `Article`, `article`, `public-tag`, `public_tag` and friends.
    pub fn parse_type(s: &str) -> Option<Self> {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str().to_ascii_lowercase() == folded)
    }

    /// Path segment used by the remote API for this type.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ObjectType::Article => "articles",
            ObjectType::Image => "images",
            ObjectType::Video => "videos",
            ObjectType::Publication => "publications",
            ObjectType::PublicTag => "tags",
            ObjectType::PrivateTag => "private-tags",
        }
    }

    pub fn listing_uri(&self, org_id: &str) -> String {
        format!("organisations/{}/{}", org_id, self.endpoint())
    }

    pub fn object_uri(&self, hail_id: &str) -> String {
        format!("{}/{}", self.endpoint(), hail_id)
    }

    /// Listing entries for tags already carry every field we keep.
    pub fn listing_is_complete(&self) -> bool {
        matches!(self, ObjectType::PublicTag | ObjectType::PrivateTag)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a fetch job asked for, decoded from its `to_fetch` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    All,
    Type(ObjectType),
    Unknown(String),
}

impl FetchTarget {
    pub const WILDCARD: &'static str = "*";

    pub fn parse_target(s: &str) -> Self {
        if s.trim() == Self::WILDCARD {
            return FetchTarget::All;
        }
        match ObjectType::parse_type(s) {
            Some(t) => FetchTarget::Type(t),
            None => FetchTarget::Unknown(s.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            FetchTarget::All => Self::WILDCARD.to_string(),
            FetchTarget::Type(t) => t.as_str().to_string(),
            FetchTarget::Unknown(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchStatus {
    Starting,
    Running,
    Done,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Starting => "Starting",
            FetchStatus::Running => "Running",
            FetchStatus::Done => "Done",
            FetchStatus::Error => "Error",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "Starting" => Some(FetchStatus::Starting),
            "Running" => Some(FetchStatus::Running),
            "Done" => Some(FetchStatus::Done),
            "Error" => Some(FetchStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchStatus::Done | FetchStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: i64,
    pub to_fetch: String,
    pub status: FetchStatus,
    pub global_total: i64,
    pub global_done: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FetchJob {
    pub fn target(&self) -> FetchTarget {
        FetchTarget::parse_target(&self.to_fetch)
    }
}

/// OAuth client credentials. Never logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn is_configured(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Last observed outcome of talking to the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApiHealth {
    #[default]
    Unknown,
    Ok,
    Error(String),
}

impl ApiHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiHealth::Unknown => "unknown",
            ApiHealth::Ok => "ok",
            ApiHealth::Error(_) => "error",
        }
    }

    pub fn from_parts(status: &str, message: Option<String>) -> Self {
        match status {
            "ok" => ApiHealth::Ok,
            "error" => ApiHealth::Error(message.unwrap_or_default()),
            _ => ApiHealth::Unknown,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ApiHealth::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Immutable snapshot of the OAuth tokens and related settings.
///
/// Every change produces a new snapshot with `version + 1`; stores accept a
/// write only when the stored version is the one the snapshot was derived from.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    pub version: i64,
    pub access_token: Option<String>,
    pub access_token_expiry: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub organisations: Vec<String>,
    pub api_health: ApiHealth,
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("version", &self.version)
            .field("has_access_token", &self.access_token.is_some())
            .field("access_token_expiry", &self.access_token_expiry)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("user_id", &self.user_id)
            .field("organisations", &self.organisations)
            .field("api_health", &self.api_health)
            .finish()
    }
}

impl TokenState {
    pub fn is_authorised(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.access_token_expiry.is_some()
    }

    /// True when the access token expires in less than `window` from `now`.
    /// A missing expiry counts as already expired.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match self.access_token_expiry {
            Some(expiry) => expiry - now < window,
            None => true,
        }
    }

    fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn with_tokens(
        &self,
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            access_token_expiry: Some(now + Duration::seconds(expires_in_secs)),
            ..self.next()
        }
    }

    pub fn with_user(&self, user_id: String) -> Self {
        Self {
            user_id: Some(user_id),
            ..self.next()
        }
    }

    pub fn with_organisations(&self, organisations: Vec<String>) -> Self {
        Self {
            organisations,
            ..self.next()
        }
    }

    pub fn with_health(&self, api_health: ApiHealth) -> Self {
        Self {
            api_health,
            ..self.next()
        }
    }
}

/// A locally stored copy of a remote object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HailObject {
    pub object_type: ObjectType,
    pub hail_id: String,
    pub org_id: String,
    pub name: Option<String>,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

impl NoticeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        }
    }
}
