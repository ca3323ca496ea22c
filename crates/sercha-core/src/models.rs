//! Core data models used throughout Sercha.
//!
//! These types represent the sources, documents, chunks, sync state and
//! credentials that flow between connectors, the sync orchestrator, the
//! stores, and the search engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Open key/value metadata attached to documents and chunks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A configured connector instance (one filesystem root, one mail account, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    /// Connector type identifier, e.g. `"filesystem"` or `"github"`.
    pub source_type: String,
    pub name: String,
    pub config: BTreeMap<String, String>,
    pub authorization_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(id: impl Into<String>, source_type: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_type: source_type.into(),
            name: name.into(),
            config: BTreeMap::new(),
            authorization_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Display name for UI surfaces: `"Name - account"`, unless the account is
    /// already part of the name.
    pub fn display_name(&self, account_identifier: Option<&str>) -> String {
        match account_identifier {
            Some(account) if !account.is_empty() && !self.name.contains(account) => {
                format!("{} - {}", self.name, account)
            }
            _ => self.name.clone(),
        }
    }
}

/// Opaque incremental-sync resume token.
///
/// Issued and interpreted only by the connector that produced it; the core
/// persists and replays it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Cursor {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Cursor {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Sync progress for a source. Absence means "never synced".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub source_id: String,
    pub cursor: Cursor,
    pub last_sync: DateTime<Utc>,
}

/// A user veto preventing a URI from being (re-)indexed for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: String,
    pub source_id: String,
    pub document_id: String,
    pub uri: String,
    pub reason: String,
    pub excluded_at: DateTime<Utc>,
}

impl Exclusion {
    pub fn new(
        source_id: impl Into<String>,
        document_id: impl Into<String>,
        uri: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            document_id: document_id.into(),
            uri: uri.into(),
            reason: reason.into(),
            excluded_at: Utc::now(),
        }
    }
}

/// Normalised document, identified by (source, URI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub uri: String,
    pub title: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A searchable sub-unit of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Zero-based, contiguous within the document.
    pub position: usize,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
}

/// Pre-normalisation bytes fetched by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub source_id: String,
    pub uri: String,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub parent_uri: Option<String>,
    pub metadata: Metadata,
}

impl RawDocument {
    pub fn new(
        source_id: impl Into<String>,
        uri: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            uri: uri.into(),
            mime_type: mime_type.into(),
            content: content.into(),
            parent_uri: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// A change event yielded by a connector stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocumentChange {
    pub change_type: ChangeType,
    pub document: RawDocument,
    /// Resume token positioned just after this change, when the connector
    /// issues one.
    pub cursor: Option<Cursor>,
}

impl RawDocumentChange {
    pub fn created(document: RawDocument) -> Self {
        Self {
            change_type: ChangeType::Created,
            document,
            cursor: None,
        }
    }

    pub fn updated(document: RawDocument) -> Self {
        Self {
            change_type: ChangeType::Updated,
            document,
            cursor: None,
        }
    }

    pub fn deleted(source_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Deleted,
            document: RawDocument::new(source_id, uri, "", Vec::new()),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<Cursor>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// OAuth 2.0 tokens for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl OAuthTokens {
    /// Tokens without an expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| now > expiry)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Either OAuth tokens or a personal access token, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSecret {
    OAuth(OAuthTokens),
    Pat { token: String },
}

impl CredentialSecret {
    pub fn method(&self) -> crate::auth::AuthMethod {
        match self {
            CredentialSecret::OAuth(_) => crate::auth::AuthMethod::OAuth,
            CredentialSecret::Pat { .. } => crate::auth::AuthMethod::Pat,
        }
    }
}

/// User-specific authentication for exactly one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub source_id: String,
    pub account_identifier: Option<String>,
    pub secret: CredentialSecret,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(source_id: impl Into<String>, secret: CredentialSecret) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            account_identifier: None,
            secret,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn oauth(&self) -> Option<&OAuthTokens> {
        match &self.secret {
            CredentialSecret::OAuth(tokens) => Some(tokens),
            CredentialSecret::Pat { .. } => None,
        }
    }

    /// Bearer token to present to the provider, if any.
    pub fn access_token(&self) -> Option<&str> {
        let token = match &self.secret {
            CredentialSecret::OAuth(tokens) => tokens.access_token.as_str(),
            CredentialSecret::Pat { token } => token.as_str(),
        };
        (!token.is_empty()).then_some(token)
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    /// True iff the OAuth access token has expired and a refresh token exists.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        self.oauth()
            .is_some_and(|tokens| tokens.is_expired_at(now) && tokens.has_refresh_token())
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Utc::now())
    }
}

/// Live scheduling state of a named recurring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub interval: Duration,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            interval,
            enabled: false,
            last_run: None,
            next_run: None,
            last_error: None,
            last_success: None,
        }
    }

    /// Enabled tasks that never ran are due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.next_run {
            Some(next) => now >= next,
            None => true,
        }
    }

    /// Fold one execution record into the live state.
    pub fn apply_result(&mut self, result: &TaskResult) {
        self.last_run = Some(result.started_at);
        self.next_run = Some(add_interval(result.started_at, self.interval));
        if result.success {
            self.last_success = Some(result.ended_at);
        }
        self.last_error = result.error.clone();
    }
}

/// Append-only record of one task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub items_processed: usize,
    pub items_failed: usize,
}

/// `start + interval`, saturating at the maximum representable time.
pub fn add_interval(start: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Derive a stable UUID-formatted identifier from the given parts.
///
/// Used for document ids (source, URI) and chunk ids (document, position) so
/// that re-processing the same input yields the same identifiers.
pub fn derive_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn oauth(expiry: Option<DateTime<Utc>>, refresh: Option<&str>) -> Credentials {
        Credentials::new(
            "gmail-1",
            CredentialSecret::OAuth(OAuthTokens {
                access_token: "at".into(),
                refresh_token: refresh.map(String::from),
                token_type: "Bearer".into(),
                expiry,
            }),
        )
    }

    #[test]
    fn test_needs_refresh_requires_expiry_and_refresh_token() {
        let now = Utc::now();
        let past = Some(now - minutes(5));
        let future = Some(now + minutes(5));

        assert!(oauth(past, Some("rt")).needs_refresh_at(now));
        assert!(!oauth(past, None).needs_refresh_at(now));
        assert!(!oauth(past, Some("")).needs_refresh_at(now));
        assert!(!oauth(future, Some("rt")).needs_refresh_at(now));
        assert!(!oauth(None, Some("rt")).needs_refresh_at(now));
    }

    #[test]
    fn test_pat_never_needs_refresh() {
        let creds = Credentials::new(
            "gh-1",
            CredentialSecret::Pat {
                token: "ghp_x".into(),
            },
        );
        assert!(!creds.needs_refresh());
        assert_eq!(creds.access_token(), Some("ghp_x"));
    }

    #[test]
    fn test_display_name() {
        let source = Source::new("s1", "gmail", "Gmail");
        assert_eq!(source.display_name(Some("me@x.com")), "Gmail - me@x.com");
        assert_eq!(source.display_name(None), "Gmail");

        let named = Source::new("s2", "gmail", "Gmail me@x.com");
        assert_eq!(named.display_name(Some("me@x.com")), "Gmail me@x.com");
    }

    #[test]
    fn test_task_next_run_is_start_plus_interval() {
        let mut task = ScheduledTask::new("document-sync", "Document sync", Duration::from_secs(3600));
        let now = Utc::now();
        assert!(!task.is_due(now), "disabled tasks are never due");

        task.enabled = true;
        assert!(task.is_due(now), "never-run tasks are due immediately");

        let result = TaskResult {
            task_id: task.id.clone(),
            started_at: now,
            ended_at: now + minutes(2),
            success: false,
            error: Some("boom".into()),
            items_processed: 0,
            items_failed: 0,
        };
        task.apply_result(&result);
        assert_eq!(task.next_run, Some(now + minutes(60)));
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert_eq!(task.last_success, None);
        assert!(!task.is_due(now + minutes(59)));
        assert!(task.is_due(now + minutes(60)));
    }

    #[test]
    fn test_derive_id_is_stable_and_distinct() {
        let a = derive_id(&["fs-1", "/a.txt"]);
        assert_eq!(a, derive_id(&["fs-1", "/a.txt"]));
        assert_ne!(a, derive_id(&["fs-2", "/a.txt"]));
        // Separator prevents ("ab","c") colliding with ("a","bc").
        assert_ne!(derive_id(&["ab", "c"]), derive_id(&["a", "bc"]));
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
