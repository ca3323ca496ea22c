//! Built-in scheduled tasks: OAuth token refresh and document sync.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{CredentialSecret, Credentials, OAuthTokens, Source};
use crate::scheduler::{Task, TaskOutcome};
use crate::store::{CredentialStore, SourceStore};
use crate::sync::{SyncOrchestrator, SyncOutcome};

pub const OAUTH_REFRESH_TASK_ID: &str = "oauth-refresh";
pub const OAUTH_REFRESH_INTERVAL: Duration = Duration::from_secs(45 * 60);

pub const DOCUMENT_SYNC_TASK_ID: &str = "document-sync";
pub const DOCUMENT_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Exchanges a refresh token for fresh OAuth tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, source: &Source, credentials: &Credentials) -> Result<OAuthTokens>;
}

/// Refreshes every OAuth credential whose access token has expired.
pub struct OAuthRefreshTask {
    sources: Arc<dyn SourceStore>,
    credentials: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
}

impl OAuthRefreshTask {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        credentials: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            sources,
            credentials,
            refresher,
        }
    }

    async fn refresh_one(&self, credentials: &Credentials) -> Result<()> {
        let source = self.sources.get_source(&credentials.source_id).await?;
        let mut tokens = self.refresher.refresh(&source, credentials).await?;
        if !tokens.has_refresh_token() {
            tokens.refresh_token = credentials.oauth().and_then(|t| t.refresh_token.clone());
        }
        let mut updated = credentials.clone();
        updated.secret = CredentialSecret::OAuth(tokens);
        updated.updated_at = Utc::now();
        self.credentials.save_credentials(&updated).await
    }
}

#[async_trait]
impl Task for OAuthRefreshTask {
    fn id(&self) -> &str {
        OAUTH_REFRESH_TASK_ID
    }

    fn name(&self) -> &str {
        "OAuth token refresh"
    }

    fn default_interval(&self) -> Duration {
        OAUTH_REFRESH_INTERVAL
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let now = Utc::now();
        let due: Vec<Credentials> = self
            .credentials
            .list_credentials()
            .await?
            .into_iter()
            .filter(|c| c.needs_refresh_at(now))
            .collect();
        debug!(due = due.len(), "credentials needing refresh");

        let mut outcome = TaskOutcome::default();
        for credentials in &due {
            if cancel.is_cancelled() {
                outcome
                    .unit_failures
                    .push("cancelled before all credentials were refreshed".into());
                break;
            }
            match self.refresh_one(credentials).await {
                Ok(()) => {
                    info!(source_id = %credentials.source_id, "oauth tokens refreshed");
                    outcome.items_processed += 1;
                }
                Err(err) => {
                    warn!(source_id = %credentials.source_id, error = %err, "oauth refresh failed");
                    outcome.items_failed += 1;
                    outcome
                        .unit_failures
                        .push(format!("source {}: {err}", credentials.source_id));
                }
            }
        }
        Ok(outcome)
    }
}

/// Syncs every configured source through the orchestrator.
pub struct DocumentSyncTask {
    orchestrator: Arc<SyncOrchestrator>,
}

impl DocumentSyncTask {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Task for DocumentSyncTask {
    fn id(&self) -> &str {
        DOCUMENT_SYNC_TASK_ID
    }

    fn name(&self) -> &str {
        "Document sync"
    }

    fn default_interval(&self) -> Duration {
        DOCUMENT_SYNC_INTERVAL
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let mut outcome = TaskOutcome::default();
        for result in self.orchestrator.sync_all(cancel).await? {
            match result.outcome {
                SyncOutcome::Completed(report) => {
                    outcome.items_processed += report.items_processed;
                    outcome.items_failed += report.items_failed;
                    if let Some(summary) = report.error_summary() {
                        outcome.warnings.push(summary);
                    }
                }
                SyncOutcome::Skipped => outcome
                    .warnings
                    .push(format!("source {}: sync already in progress", result.source_id)),
                SyncOutcome::Failed(err) => outcome
                    .unit_failures
                    .push(format!("source {}: {err}", result.source_id)),
            }
        }
        Ok(outcome)
    }
}
