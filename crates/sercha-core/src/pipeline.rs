//! Document processing pipeline.
//!
//! ```text
//! RawDocument ─▶ Normaliser ─▶ Document ─▶ PostProcessor chain ─▶ Chunks ─▶ (embed) ─▶ ProcessedDocument
//! ```
//!
//! Post-processors are configured by name through a [`ProcessorRegistry`];
//! each reads its settings from a typed [`ProcessorOptions`] lookup with
//! documented per-processor defaults.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::{chunk_id, chunk_text, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{Chunk, Document, RawDocument};
use crate::normalise::NormaliserRegistry;

/// A normalised document with its ordered chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

/// Turns raw connector output into a document and chunks.
///
/// Implementations must be deterministic for the same input and
/// configuration.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn process(&self, raw: &RawDocument) -> Result<ProcessedDocument>;
}

/// One step of the chunk chain. The first processor receives no chunks and
/// is expected to create them.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, doc: &Document, chunks: Vec<Chunk>) -> Result<Vec<Chunk>>;
}

/// Named options for a post-processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessorOptions(serde_json::Map<String, serde_json::Value>);

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Unsigned integer option, `default` when absent.
    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_u64()
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| {
                    Error::invalid(format!("option {key:?} must be a non-negative integer"))
                }),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| Error::invalid(format!("option {key:?} must be a boolean"))),
        }
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_str()
                .ok_or_else(|| Error::invalid(format!("option {key:?} must be a string"))),
        }
    }
}

/// A processor entry in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub name: String,
    #[serde(default)]
    pub options: ProcessorOptions,
}

impl ProcessorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ProcessorOptions::new(),
        }
    }
}

pub type ProcessorFactory =
    Arc<dyn Fn(&ProcessorOptions) -> Result<Arc<dyn PostProcessor>> + Send + Sync>;

/// Open-ended set of post-processors, keyed by name.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    factories: HashMap<String, ProcessorFactory>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `chunker`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ChunkerProcessor::NAME, |options| {
            Ok(Arc::new(ChunkerProcessor::from_options(options)?) as Arc<dyn PostProcessor>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ProcessorOptions) -> Result<Arc<dyn PostProcessor>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the chain described by `specs`, in order. An empty list yields
    /// a single default chunker.
    pub fn build(&self, specs: &[ProcessorSpec]) -> Result<Vec<Arc<dyn PostProcessor>>> {
        if specs.is_empty() {
            return Ok(vec![Arc::new(ChunkerProcessor::default())]);
        }
        specs
            .iter()
            .map(|spec| {
                let factory = self.factories.get(&spec.name).ok_or_else(|| {
                    Error::UnsupportedType(format!("post-processor {:?}", spec.name))
                })?;
                factory(&spec.options)
            })
            .collect()
    }
}

/// Built-in chunking processor.
///
/// Options: `chunk_size` (characters, default 1000) and `overlap`
/// (characters, default 200; must be smaller than `chunk_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerProcessor {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl ChunkerProcessor {
    pub const NAME: &'static str = "chunker";

    pub fn from_options(options: &ProcessorOptions) -> Result<Self> {
        let chunk_size = options.usize_or("chunk_size", DEFAULT_CHUNK_SIZE)?;
        let overlap = options.usize_or("overlap", DEFAULT_CHUNK_OVERLAP)?;
        if chunk_size == 0 {
            return Err(Error::invalid("chunker chunk_size must be > 0"));
        }
        if overlap >= chunk_size {
            return Err(Error::invalid(format!(
                "chunker overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }
}

impl Default for ChunkerProcessor {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl PostProcessor for ChunkerProcessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process(&self, doc: &Document, _chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
        Ok(chunk_text(&doc.id, &doc.content, self.chunk_size, self.overlap))
    }
}

/// Default [`Pipeline`]: normalise, run the post-processor chain, then embed
/// each chunk when an embedding provider is configured.
#[derive(Clone)]
pub struct DocumentPipeline {
    normalisers: NormaliserRegistry,
    processors: Vec<Arc<dyn PostProcessor>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl DocumentPipeline {
    pub fn new(normalisers: NormaliserRegistry, processors: Vec<Arc<dyn PostProcessor>>) -> Self {
        Self {
            normalisers,
            processors,
            embedder: None,
        }
    }

    /// Default normalisers and a single default chunker.
    pub fn with_defaults() -> Self {
        Self::new(
            NormaliserRegistry::with_defaults(),
            vec![Arc::new(ChunkerProcessor::default())],
        )
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

#[async_trait]
impl Pipeline for DocumentPipeline {
    async fn process(&self, raw: &RawDocument) -> Result<ProcessedDocument> {
        let document = self.normalisers.normalise(raw)?;

        let mut chunks = Vec::new();
        for processor in &self.processors {
            chunks = processor.process(&document, chunks).map_err(|e| match e {
                Error::Other(inner) => {
                    Error::Other(inner.context(format!("processor {}", processor.name())))
                }
                other => other,
            })?;
        }

        // Positions must be dense and ids stable whatever the chain did.
        chunks.sort_by_key(|c| c.position);
        for (position, chunk) in chunks.iter_mut().enumerate() {
            chunk.position = position;
            chunk.id = chunk_id(&document.id, position);
            chunk.document_id = document.id.clone();
        }

        if let Some(embedder) = &self.embedder {
            for chunk in &mut chunks {
                chunk.embedding = Some(embedder.embed(&chunk.content).await?);
            }
        }

        debug!(uri = %document.uri, chunks = chunks.len(), "processed document");
        Ok(ProcessedDocument { document, chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;

    impl PostProcessor for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn process(&self, _doc: &Document, chunks: Vec<Chunk>) -> Result<Vec<Chunk>> {
            Ok(chunks
                .into_iter()
                .map(|mut c| {
                    c.content = c.content.to_uppercase();
                    c
                })
                .collect())
        }
    }

    #[test]
    fn test_options_typed_lookup() {
        let options = ProcessorOptions::new()
            .set("chunk_size", 500)
            .set("lossy", true)
            .set("bad", "ten");
        assert_eq!(options.usize_or("chunk_size", 1).unwrap(), 500);
        assert_eq!(options.usize_or("missing", 7).unwrap(), 7);
        assert!(options.bool_or("lossy", false).unwrap());
        assert!(matches!(
            options.usize_or("bad", 1),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_chunker_defaults_and_validation() {
        let chunker = ChunkerProcessor::from_options(&ProcessorOptions::new()).unwrap();
        assert_eq!(chunker, ChunkerProcessor::default());
        assert_eq!((chunker.chunk_size, chunker.overlap), (1000, 200));

        let bad = ProcessorOptions::new()
            .set("chunk_size", 100)
            .set("overlap", 100);
        assert!(ChunkerProcessor::from_options(&bad).is_err());
    }

    #[test]
    fn test_registry_builds_in_order_and_rejects_unknown() {
        let mut registry = ProcessorRegistry::with_defaults();
        registry.register("uppercase", |_| Ok(Arc::new(Uppercase) as Arc<dyn PostProcessor>));
        assert_eq!(registry.names(), vec!["chunker", "uppercase"]);

        let chain = registry
            .build(&[ProcessorSpec::new("chunker"), ProcessorSpec::new("uppercase")])
            .unwrap();
        assert_eq!(
            chain.iter().map(|p| p.name()).collect::<Vec<_>>(),
            vec!["chunker", "uppercase"]
        );

        let err = registry
            .build(&[ProcessorSpec::new("stemmer")])
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedType(_)));
        assert_eq!(registry.build(&[]).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_runs_chain() {
        let pipeline = DocumentPipeline::new(
            NormaliserRegistry::with_defaults(),
            vec![Arc::new(ChunkerProcessor::default()), Arc::new(Uppercase)],
        );
        let raw = RawDocument::new("fs-1", "/a.txt", "text/plain", b"hello world".to_vec());
        let out = pipeline.process(&raw).await.unwrap();
        assert_eq!(out.document.content, "hello world");
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].content, "HELLO WORLD");
        assert_eq!(out.chunks[0].document_id, out.document.id);
    }
}
