//! Wires the SQLite store, connectors, providers and core services together.

use std::sync::Arc;

use anyhow::{Context, Result};

use sercha_core::catalog::Catalog;
use sercha_core::connector::ConnectorRegistry;
use sercha_core::normalise::NormaliserRegistry;
use sercha_core::pipeline::{DocumentPipeline, ProcessorRegistry};
use sercha_core::scheduler::Scheduler;
use sercha_core::search::SearchEngine;
use sercha_core::store::Stores;
use sercha_core::sync::SyncOrchestrator;
use sercha_core::tasks::{DocumentSyncTask, OAuthRefreshTask};

use crate::config::Config;
use crate::connector_fs::FilesystemConnector;
use crate::db;
use crate::embedding::create_embedder;
use crate::llm::create_llm;
use crate::migrate::run_migrations;
use crate::oauth::HttpTokenRefresher;
use crate::sqlite_store::SqliteStore;

/// Every connector this binary ships with.
pub fn connectors() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register(Arc::new(FilesystemConnector::new()));
    registry
}

pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub stores: Stores,
    pub catalog: Catalog,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub search: SearchEngine,
    pub scheduler: Scheduler,
}

impl App {
    /// Open the database, run migrations and build the services.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        run_migrations(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));
        Self::from_store(config, store)
    }

    pub fn from_store(config: Config, store: Arc<SqliteStore>) -> Result<Self> {
        let stores = store.stores();
        let connectors = connectors();

        let embedder = create_embedder(&config.embedding).context("embedding provider")?;
        let llm = create_llm(&config.llm).context("llm provider")?;

        let processors = ProcessorRegistry::with_defaults()
            .build(&config.pipeline.processors)
            .map_err(|e| anyhow::anyhow!("pipeline: {e}"))?;
        let mut pipeline = DocumentPipeline::new(NormaliserRegistry::with_defaults(), processors);
        if let Some(embedder) = &embedder {
            pipeline = pipeline.with_embedder(embedder.clone());
        }

        let orchestrator = Arc::new(SyncOrchestrator::new(
            stores.clone(),
            connectors.clone(),
            Arc::new(pipeline),
        ));
        let catalog =
            Catalog::new(stores.clone(), connectors).with_orchestrator(orchestrator.clone());

        let mut search = SearchEngine::new(
            stores.documents.clone(),
            stores.sources.clone(),
            config.retrieval.to_fusion_params(),
        )
        .with_keyword_index(store.clone())
        .with_credentials(stores.credentials.clone());
        if let Some(embedder) = embedder {
            search = search
                .with_vector_index(store.clone())
                .with_embedder(embedder);
        }
        if let Some(llm) = llm {
            search = search.with_llm(llm);
        }

        let scheduler = Scheduler::new(config.scheduler.to_scheduler_config(), store.clone());
        scheduler.register(Arc::new(OAuthRefreshTask::new(
            stores.sources.clone(),
            stores.credentials.clone(),
            Arc::new(HttpTokenRefresher::new(config.oauth.clone())?),
        )));
        scheduler.register(Arc::new(DocumentSyncTask::new(orchestrator.clone())));

        tracing::debug!(
            db = %config.db.path.display(),
            embeddings = config.embedding.is_enabled(),
            llm = config.llm.is_enabled(),
            "app initialised"
        );

        Ok(Self {
            config,
            store,
            stores,
            catalog,
            orchestrator,
            search,
            scheduler,
        })
    }
}
