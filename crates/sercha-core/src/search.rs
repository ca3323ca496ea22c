//! Multi-mode search with keyword, semantic, and LLM-expanded retrieval.
//!
//! | Mode | Keyword | Semantic | LLM expansion |
//! |------|---------|----------|---------------|
//! | `text_only` | yes | no | no |
//! | `hybrid` | yes | yes | no |
//! | `llm_assisted` | yes | no | yes |
//! | `full` | yes | yes | yes |
//!
//! # Fusion
//!
//! 1. Expand the query through the LLM when the mode asks for it; the
//!    variants are searched alongside the original and each chunk keeps its
//!    best raw keyword score across variants.
//! 2. Fetch `candidate_k_keyword` keyword candidates and, for semantic
//!    modes, `candidate_k_vector` candidates for the embedded original query.
//! 3. Min-max normalise each candidate set to `[0, 1]` on its own.
//! 4. `score = keyword_weight × keyword + semantic_weight × semantic`; a
//!    missing signal contributes 0. Both weights are at least
//!    [`MIN_WEIGHT`].
//! 5. Keep the best chunk per document (lower position on ties).
//! 6. Sort by score (desc), `updated_at` (desc), document id (asc).
//! 7. Apply offset and limit, then build highlights and source names.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{EmbeddingProvider, LlmProvider};
use crate::error::{Error, Result};
use crate::models::{Chunk, Document};
use crate::store::{ChunkCandidate, CredentialStore, DocumentStore, KeywordIndex, SourceStore, VectorIndex};

pub const DEFAULT_LIMIT: usize = 20;
const MAX_HIGHLIGHTS: usize = 3;
const HIGHLIGHT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    TextOnly,
    Hybrid,
    LlmAssisted,
    Full,
}

impl SearchMode {
    pub fn uses_semantic(self) -> bool {
        matches!(self, SearchMode::Hybrid | SearchMode::Full)
    }

    pub fn uses_llm(self) -> bool {
        matches!(self, SearchMode::LlmAssisted | SearchMode::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::TextOnly => "text_only",
            SearchMode::Hybrid => "hybrid",
            SearchMode::LlmAssisted => "llm_assisted",
            SearchMode::Full => "full",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text_only" | "text" | "keyword" => Ok(SearchMode::TextOnly),
            "hybrid" => Ok(SearchMode::Hybrid),
            "llm_assisted" | "llm" => Ok(SearchMode::LlmAssisted),
            "full" => Ok(SearchMode::Full),
            other => Err(Error::invalid(format!(
                "unknown search mode {other:?}; use text_only, hybrid, llm_assisted or full"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub mode: SearchMode,
    /// `None` or `0` uses the configured default limit.
    pub limit: Option<usize>,
    pub offset: usize,
    /// Restrict to these sources; empty means all.
    pub source_ids: Vec<String>,
}

impl SearchOptions {
    pub fn mode(mode: SearchMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn sources(mut self, source_ids: Vec<String>) -> Self {
        self.source_ids = source_ids;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub document: Document,
    /// Best-scoring chunk of the document.
    pub chunk: Chunk,
    pub score: f64,
    pub highlights: Vec<String>,
    pub source_name: String,
}

/// Smallest accepted fusion weight. With both weights at or above it a
/// chunk matching both signals never scores below either normalised signal.
pub const MIN_WEIGHT: f64 = 1.0;

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionParams {
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub candidate_k_keyword: usize,
    pub candidate_k_vector: usize,
    pub default_limit: usize,
    /// Degrade to the original query when expansion is impossible, instead
    /// of failing with [`Error::LlmUnavailable`].
    pub llm_fallback: bool,
    pub max_expansions: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            keyword_weight: 1.0,
            semantic_weight: 1.0,
            candidate_k_keyword: 100,
            candidate_k_vector: 100,
            default_limit: DEFAULT_LIMIT,
            llm_fallback: true,
            max_expansions: 3,
        }
    }
}

impl FusionParams {
    pub fn validate(&self) -> Result<()> {
        let finite = self.keyword_weight.is_finite() && self.semantic_weight.is_finite();
        if !finite || self.keyword_weight < MIN_WEIGHT || self.semantic_weight < MIN_WEIGHT {
            return Err(Error::invalid(format!(
                "fusion weights must be finite and >= {MIN_WEIGHT}"
            )));
        }
        if self.candidate_k_keyword == 0 || self.candidate_k_vector == 0 {
            return Err(Error::invalid("candidate counts must be > 0"));
        }
        Ok(())
    }

    /// Combined score of one chunk.
    pub fn fuse(&self, keyword: f64, semantic: f64) -> f64 {
        self.keyword_weight * keyword + self.semantic_weight * semantic
    }
}

/// Lowercased alphanumeric terms of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Min-max normalise raw scores to `[0.0, 1.0]`, keyed by chunk id.
///
/// If all scores are equal they normalise to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }
    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = s_max - s_min;

    candidates
        .iter()
        .map(|c| {
            let norm = if span.abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / span
            };
            (c.chunk_id.clone(), norm)
        })
        .collect()
}

/// Per chunk, keep the highest raw score across several candidate lists.
fn best_per_chunk(lists: Vec<Vec<ChunkCandidate>>) -> Vec<ChunkCandidate> {
    let mut best: HashMap<String, ChunkCandidate> = HashMap::new();
    for candidate in lists.into_iter().flatten() {
        match best.get_mut(&candidate.chunk_id) {
            Some(existing) if existing.raw_score >= candidate.raw_score => {}
            Some(existing) => *existing = candidate,
            None => {
                best.insert(candidate.chunk_id.clone(), candidate);
            }
        }
    }
    best.into_values().collect()
}

/// Up to three sentences containing any term of any of `queries`, each cut
/// to 200 characters.
pub fn highlights<S: AsRef<str>>(content: &str, queries: &[S]) -> Vec<String> {
    let mut terms: Vec<String> = queries.iter().flat_map(|q| tokenize(q.as_ref())).collect();
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return Vec::new();
    }
    split_sentences(content)
        .into_iter()
        .filter(|sentence| {
            let lower = sentence.to_lowercase();
            terms.iter().any(|t| lower.contains(t.as_str()))
        })
        .take(MAX_HIGHLIGHTS)
        .map(|sentence| {
            if sentence.chars().count() > HIGHLIGHT_CHARS {
                let cut: String = sentence.chars().take(HIGHLIGHT_CHARS).collect();
                format!("{cut}...")
            } else {
                sentence.to_string()
            }
        })
        .collect()
}

fn split_sentences(content: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in content.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let sentence = content[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = content[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

struct Scored {
    document: Document,
    chunk: Chunk,
    score: f64,
}

pub struct SearchEngine {
    documents: Arc<dyn DocumentStore>,
    sources: Arc<dyn SourceStore>,
    credentials: Option<Arc<dyn CredentialStore>>,
    keyword: Option<Arc<dyn KeywordIndex>>,
    vector: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    llm: Option<Arc<dyn LlmProvider>>,
    params: FusionParams,
}

impl SearchEngine {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        sources: Arc<dyn SourceStore>,
        params: FusionParams,
    ) -> Self {
        Self {
            documents,
            sources,
            credentials: None,
            keyword: None,
            vector: None,
            embedder: None,
            llm: None,
            params,
        }
    }

    pub fn with_keyword_index(mut self, index: Arc<dyn KeywordIndex>) -> Self {
        self.keyword = Some(index);
        self
    }

    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(index);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Credentials supply the account part of result source names.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let mode = options.mode;
        let keyword = self.keyword.as_ref().ok_or(Error::SearchUnavailable)?;
        let semantic = if mode.uses_semantic() {
            let embedder = self.embedder.as_ref().ok_or(Error::EmbeddingUnavailable)?;
            let vector = self.vector.as_ref().ok_or(Error::VectorIndexUnavailable)?;
            Some((embedder, vector))
        } else {
            None
        };

        let queries = if mode.uses_llm() {
            self.expand(query).await?
        } else {
            vec![query.to_string()]
        };

        let keyword_search = async {
            let lists = try_join_all(queries.iter().map(|q| {
                keyword.keyword_search(q, self.params.candidate_k_keyword, &options.source_ids)
            }))
            .await
            .map_err(|err| {
                warn!(error = %err, "keyword index failed");
                Error::SearchUnavailable
            })?;
            Ok::<_, Error>(best_per_chunk(lists))
        };
        let vector_search = async {
            let Some((embedder, vector)) = semantic else {
                return Ok(Vec::new());
            };
            let embedding = embedder.embed(query).await.map_err(|err| {
                warn!(error = %err, "query embedding failed");
                Error::EmbeddingUnavailable
            })?;
            vector
                .vector_search(&embedding, self.params.candidate_k_vector, &options.source_ids)
                .await
                .map_err(|err| {
                    warn!(error = %err, "vector index failed");
                    Error::VectorIndexUnavailable
                })
        };
        let (keyword_candidates, vector_candidates) =
            futures::try_join!(keyword_search, vector_search)?;

        debug!(
            mode = %mode,
            variants = queries.len(),
            keyword = keyword_candidates.len(),
            vector = vector_candidates.len(),
            "retrieved candidates"
        );

        let ranked = self
            .rank(&keyword_candidates, &vector_candidates, &options.source_ids)
            .await?;

        let limit = match options.limit {
            Some(limit) if limit > 0 => limit,
            _ => self.params.default_limit,
        };
        let mut names: HashMap<String, String> = HashMap::new();
        let mut results = Vec::new();
        for scored in ranked.into_iter().skip(options.offset).take(limit) {
            let source_id = scored.document.source_id.clone();
            let source_name = match names.get(&source_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self.source_name(&source_id).await?;
                    names.insert(source_id, name.clone());
                    name
                }
            };
            results.push(SearchResult {
                highlights: highlights(&scored.chunk.content, queries.as_slice()),
                document: scored.document,
                chunk: scored.chunk,
                score: scored.score,
                source_name,
            });
        }
        Ok(results)
    }

    /// Original query first, then distinct expansions.
    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        let mut queries = vec![query.to_string()];
        let Some(llm) = &self.llm else {
            if !self.params.llm_fallback {
                return Err(Error::LlmUnavailable);
            }
            debug!("no LLM configured, searching original query only");
            return Ok(queries);
        };
        match llm.expand(query).await {
            Ok(variants) => {
                for variant in variants {
                    if queries.len() > self.params.max_expansions {
                        break;
                    }
                    let variant = variant.trim().to_string();
                    let duplicate = queries.iter().any(|q| q.eq_ignore_ascii_case(&variant));
                    if !variant.is_empty() && !duplicate {
                        queries.push(variant);
                    }
                }
                Ok(queries)
            }
            Err(err) if self.params.llm_fallback => {
                warn!(error = %err, "query expansion failed, using original query");
                Ok(queries)
            }
            Err(err) => {
                warn!(error = %err, "query expansion failed");
                Err(Error::LlmUnavailable)
            }
        }
    }

    async fn rank(
        &self,
        keyword: &[ChunkCandidate],
        vector: &[ChunkCandidate],
        source_ids: &[String],
    ) -> Result<Vec<Scored>> {
        let keyword_norm = normalize_scores(keyword);
        let vector_norm = normalize_scores(vector);

        let mut chunk_ids: Vec<&str> = keyword.iter().map(|c| c.chunk_id.as_str()).collect();
        for c in vector {
            if !keyword_norm.contains_key(&c.chunk_id) {
                chunk_ids.push(c.chunk_id.as_str());
            }
        }

        let mut documents: HashMap<String, Option<Document>> = HashMap::new();
        let mut best: HashMap<String, Scored> = HashMap::new();
        for chunk_id in chunk_ids {
            let chunk = match self.documents.get_chunk(chunk_id).await {
                Ok(chunk) => chunk,
                Err(err) if err.is_not_found() => {
                    debug!(chunk_id, "stale index entry skipped");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !documents.contains_key(&chunk.document_id) {
                let doc = match self.documents.get_document(&chunk.document_id).await {
                    Ok(doc) => Some(doc),
                    Err(err) if err.is_not_found() => None,
                    Err(err) => return Err(err),
                };
                documents.insert(chunk.document_id.clone(), doc);
            }
            let Some(Some(document)) = documents.get(&chunk.document_id) else {
                continue;
            };
            if !source_ids.is_empty() && !source_ids.contains(&document.source_id) {
                continue;
            }

            let score = self.params.fuse(
                keyword_norm.get(chunk_id).copied().unwrap_or(0.0),
                vector_norm.get(chunk_id).copied().unwrap_or(0.0),
            );
            let better = match best.get(&document.id) {
                None => true,
                Some(current) => match score.partial_cmp(&current.score) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => chunk.position < current.chunk.position,
                    _ => false,
                },
            };
            if better {
                best.insert(
                    document.id.clone(),
                    Scored {
                        document: document.clone(),
                        chunk,
                        score,
                    },
                );
            }
        }

        let mut ranked: Vec<Scored> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        Ok(ranked)
    }

    async fn source_name(&self, source_id: &str) -> Result<String> {
        let source = match self.sources.get_source(source_id).await {
            Ok(source) => source,
            Err(err) if err.is_not_found() => return Ok(source_id.to_string()),
            Err(err) => return Err(err),
        };
        let account = match &self.credentials {
            Some(store) => store
                .credentials_for_source(source_id)
                .await?
                .and_then(|c| c.account_identifier),
            None => None,
        };
        Ok(source.display_name(account.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: id.into(),
            document_id: format!("doc-{id}"),
            raw_score: score,
        }
    }

    #[test]
    fn test_normalize_min_max() {
        let norm = normalize_scores(&[cand("a", 2.0), cand("b", 4.0), cand("c", 3.0)]);
        assert_eq!(norm["a"], 0.0);
        assert_eq!(norm["b"], 1.0);
        assert!((norm["c"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal_is_one() {
        let norm = normalize_scores(&[cand("a", 0.3), cand("b", 0.3)]);
        assert_eq!(norm["a"], 1.0);
        assert_eq!(norm["b"], 1.0);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_fused_score_dominates_each_signal() {
        let tilted = FusionParams {
            keyword_weight: 1.0,
            semantic_weight: 2.5,
            ..FusionParams::default()
        };
        let grid = [0.0, 0.1, 0.25, 0.5, 0.9, 1.0];
        for params in [FusionParams::default(), tilted] {
            params.validate().unwrap();
            for &k in &grid {
                for &s in &grid {
                    let fused = params.fuse(k, s);
                    assert!(fused >= k && fused >= s, "fuse({k}, {s}) = {fused}");
                }
            }
        }
    }

    #[test]
    fn test_weights_control_each_signal() {
        let semantic_heavy = FusionParams {
            keyword_weight: 1.0,
            semantic_weight: 2.0,
            ..FusionParams::default()
        };
        assert_eq!(semantic_heavy.fuse(1.0, 0.5), 2.0);
        assert_eq!(semantic_heavy.fuse(0.0, 0.5), 1.0);
        assert_eq!(semantic_heavy.fuse(0.5, 0.0), 0.5);
    }

    #[test]
    fn test_params_validation() {
        assert!(FusionParams::default().validate().is_ok());
        for (keyword_weight, semantic_weight) in
            [(-1.0, 1.0), (0.0, 0.0), (0.5, 0.5), (1.0, 0.0), (f64::NAN, 1.0)]
        {
            let params = FusionParams {
                keyword_weight,
                semantic_weight,
                ..FusionParams::default()
            };
            assert!(params.validate().is_err(), "{keyword_weight}/{semantic_weight}");
        }
    }

    #[test]
    fn test_best_per_chunk_keeps_max() {
        let merged = best_per_chunk(vec![
            vec![cand("a", 1.0), cand("b", 5.0)],
            vec![cand("a", 3.0)],
        ]);
        let a = merged.iter().find(|c| c.chunk_id == "a").unwrap();
        assert_eq!(a.raw_score, 3.0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_highlights() {
        let content = "The invoice is attached. Nothing else here! Pay the INVOICE soon?\nInvoice three. Invoice four.";
        let hl = highlights(content, &["invoice"]);
        assert_eq!(
            hl,
            vec![
                "The invoice is attached.",
                "Pay the INVOICE soon?",
                "Invoice three."
            ]
        );
        assert!(highlights(content, &["   "]).is_empty());
        assert_eq!(
            highlights(content, &["bill", "nothing"]),
            vec!["Nothing else here!"]
        );

        let long = format!("invoice {}", "x".repeat(300));
        let cut = highlights(&long, &["invoice"]);
        assert_eq!(cut[0].chars().count(), HIGHLIGHT_CHARS + 3);
        assert!(cut[0].ends_with("..."));
    }

    #[test]
    fn test_mode_parsing_and_signals() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert!(!SearchMode::TextOnly.uses_semantic());
        assert!(SearchMode::Full.uses_semantic() && SearchMode::Full.uses_llm());
        assert!(SearchMode::LlmAssisted.uses_llm() && !SearchMode::LlmAssisted.uses_semantic());
    }
}
