//! Source, credential and exclusion management.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::connector::ConnectorRegistry;
use crate::error::{Error, Result};
use crate::models::{CredentialSecret, Credentials, Document, Exclusion, Metadata, Source};
use crate::store::Stores;
use crate::sync::SyncOrchestrator;

/// Administrative operations over the entity stores.
#[derive(Clone)]
pub struct Catalog {
    stores: Stores,
    connectors: ConnectorRegistry,
    orchestrator: Option<Arc<SyncOrchestrator>>,
}

/// Counts of rows removed alongside a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedSource {
    pub documents: usize,
    pub exclusions: usize,
}

/// Display summary of one stored document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentDetails {
    pub id: String,
    pub source_id: String,
    /// `None` if the source row is gone.
    pub source_name: Option<String>,
    pub source_type: Option<String>,
    pub title: String,
    pub uri: String,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Catalog {
    pub fn new(stores: Stores, connectors: ConnectorRegistry) -> Self {
        Self {
            stores,
            connectors,
            orchestrator: None,
        }
    }

    /// Coordinate destructive operations with the orchestrator's runs.
    pub fn with_orchestrator(mut self, orchestrator: Arc<SyncOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub async fn add_source(&self, source: &Source) -> Result<()> {
        if source.id.trim().is_empty() {
            return Err(Error::invalid("source id must not be empty"));
        }
        if source.source_type.trim().is_empty() {
            return Err(Error::invalid("source type must not be empty"));
        }
        if source.name.trim().is_empty() {
            return Err(Error::invalid("source name must not be empty"));
        }
        if !self.connectors.contains(&source.source_type) {
            return Err(Error::UnsupportedType(format!(
                "connector type {:?}",
                source.source_type
            )));
        }
        match self.stores.sources.get_source(&source.id).await {
            Ok(_) => return Err(Error::AlreadyExists(format!("source {}", source.id))),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.stores.sources.save_source(source).await?;
        info!(source_id = %source.id, source_type = %source.source_type, "source added");
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> Result<Source> {
        self.stores.sources.get_source(id).await
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.stores.sources.list_sources().await
    }

    /// Remove a source and everything indexed or recorded for it. Fails with
    /// [`Error::SyncInProgress`] while the source is syncing.
    pub async fn remove_source(&self, id: &str) -> Result<RemovedSource> {
        self.stores.sources.get_source(id).await?;
        let _reservation = match &self.orchestrator {
            Some(orchestrator) => Some(orchestrator.reserve(id)?),
            None => None,
        };
        let documents = self.stores.documents.delete_documents_for_source(id).await?;
        self.stores.sync_states.delete_sync_state(id).await?;
        let exclusions = self.stores.exclusions.delete_exclusions_for_source(id).await?;
        self.stores.credentials.delete_credentials_for_source(id).await?;
        self.stores.sources.delete_source(id).await?;
        info!(source_id = id, documents, exclusions, "source removed");
        Ok(RemovedSource {
            documents,
            exclusions,
        })
    }

    pub async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>> {
        self.stores.documents.list_documents(source_id).await
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        self.stores.documents.get_document(id).await
    }

    /// Indexed text of a document: its chunks in position order, one per
    /// line.
    pub async fn document_content(&self, id: &str) -> Result<String> {
        self.stores.documents.get_document(id).await?;
        let mut chunks = self.stores.documents.get_chunks(id).await?;
        chunks.sort_by_key(|c| c.position);
        Ok(chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub async fn document_details(&self, id: &str) -> Result<DocumentDetails> {
        let doc = self.stores.documents.get_document(id).await?;
        let source = match self.stores.sources.get_source(&doc.source_id).await {
            Ok(source) => Some(source),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let chunk_count = self.stores.documents.get_chunks(id).await?.len();
        Ok(DocumentDetails {
            id: doc.id,
            source_id: doc.source_id,
            source_name: source.as_ref().map(|s| s.name.clone()),
            source_type: source.map(|s| s.source_type),
            title: doc.title,
            uri: doc.uri,
            chunk_count,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            metadata: doc.metadata,
        })
    }

    /// Store credentials for a source after checking the connector accepts
    /// the secret's method.
    pub async fn set_credentials(
        &self,
        source_id: &str,
        secret: CredentialSecret,
        account_identifier: Option<String>,
    ) -> Result<Credentials> {
        let source = self.stores.sources.get_source(source_id).await?;
        let connector = self.connectors.get(&source.source_type)?;
        let method = secret.method();
        if !connector.auth_capability().supports(method) {
            return Err(Error::invalid(format!(
                "connector {} does not accept {method} credentials",
                source.source_type
            )));
        }

        let mut credentials = match self.stores.credentials.credentials_for_source(source_id).await? {
            Some(mut existing) => {
                existing.secret = secret;
                existing.updated_at = chrono::Utc::now();
                existing
            }
            None => Credentials::new(source_id, secret),
        };
        if account_identifier.is_some() {
            credentials.account_identifier = account_identifier;
        }
        self.stores.credentials.save_credentials(&credentials).await?;
        if source.authorization_id.as_deref() != Some(credentials.id.as_str()) {
            let mut source = source;
            source.authorization_id = Some(credentials.id.clone());
            source.updated_at = chrono::Utc::now();
            self.stores.sources.save_source(&source).await?;
        }
        info!(source_id, method = %method, "credentials saved");
        Ok(credentials)
    }

    /// Exclude a document from indexing and remove it with its chunks.
    pub async fn exclude_document(&self, document_id: &str, reason: &str) -> Result<Exclusion> {
        let doc = self.stores.documents.get_document(document_id).await?;
        let exclusion = Exclusion::new(&doc.source_id, &doc.id, &doc.uri, reason);
        self.stores.exclusions.add_exclusion(&exclusion).await?;
        self.stores.documents.delete_document(&doc.id).await?;
        info!(source_id = %doc.source_id, uri = %doc.uri, "document excluded");
        Ok(exclusion)
    }

    /// The document is indexed again on the next sync that delivers it.
    pub async fn remove_exclusion(&self, id: &str) -> Result<()> {
        self.stores.exclusions.remove_exclusion(id).await
    }

    pub async fn list_exclusions(&self, source_id: Option<&str>) -> Result<Vec<Exclusion>> {
        self.stores.exclusions.list_exclusions(source_id).await
    }
}
