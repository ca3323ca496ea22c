//! Connector contract and registry.
//!
//! A connector turns one [`Source`] into a lazy stream of
//! [`RawDocumentChange`]s. Each change may carry a [`Cursor`] that resumes
//! the stream just after it; the orchestrator persists cursors verbatim and
//! hands the last committed one back on the next run.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use futures::stream::{self, StreamExt};
//! use sercha_core::connector::{ChangeStream, Connector};
//! use sercha_core::models::{Credentials, Cursor, RawDocument, RawDocumentChange, Source};
//! use sercha_core::Result;
//!
//! struct OneShot;
//!
//! #[async_trait]
//! impl Connector for OneShot {
//!     fn connector_type(&self) -> &str { "oneshot" }
//!
//!     async fn open(
//!         &self,
//!         source: &Source,
//!         _credentials: Option<&Credentials>,
//!         _cursor: Option<&Cursor>,
//!     ) -> Result<ChangeStream> {
//!         let raw = RawDocument::new(&source.id, "/hello.txt", "text/plain", b"hi".to_vec());
//!         Ok(stream::iter(vec![Ok(RawDocumentChange::created(raw).with_cursor("1"))]).boxed())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::auth::AuthCapability;
use crate::error::{Error, Result};
use crate::models::{Credentials, Cursor, RawDocumentChange, Source};

/// Lazy, possibly unbounded sequence of changes. An `Err` item terminates
/// the run.
pub type ChangeStream = BoxStream<'static, Result<RawDocumentChange>>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Matches [`Source::source_type`].
    fn connector_type(&self) -> &str;

    fn auth_capability(&self) -> AuthCapability {
        AuthCapability::NONE
    }

    /// Checks the source configuration before a stream is opened.
    async fn validate(&self, _source: &Source, _credentials: Option<&Credentials>) -> Result<()> {
        Ok(())
    }

    /// Open a change stream, starting after `cursor` or from the beginning
    /// when `cursor` is `None`.
    async fn open(
        &self,
        source: &Source,
        credentials: Option<&Credentials>,
        cursor: Option<&Cursor>,
    ) -> Result<ChangeStream>;
}

/// Connectors keyed by source type.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector, replacing any previous one for the same type.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.connector_type().to_string(), connector);
    }

    pub fn get(&self, source_type: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(source_type)
            .cloned()
            .ok_or_else(|| Error::UnsupportedType(format!("connector type {source_type:?}")))
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.connectors.contains_key(source_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.connectors.keys().cloned().collect();
        types.sort();
        types
    }
}
