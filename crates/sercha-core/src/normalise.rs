//! MIME-type normalisers: turn [`RawDocument`] bytes into a [`Document`].
//!
//! A [`NormaliserRegistry`] picks the highest-priority normaliser that
//! supports a document's MIME type. Unknown types fail with
//! [`Error::UnsupportedType`].

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{derive_id, Document, RawDocument};

pub trait Normaliser: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, mime_type: &str) -> bool;

    /// Higher wins when several normalisers support a type.
    fn priority(&self) -> u8;

    fn normalise(&self, raw: &RawDocument) -> Result<Document>;
}

#[derive(Clone, Default)]
pub struct NormaliserRegistry {
    normalisers: Vec<Arc<dyn Normaliser>>,
}

impl NormaliserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain text, Markdown and HTML.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextNormaliser));
        registry.register(Arc::new(MarkdownNormaliser));
        registry.register(Arc::new(HtmlNormaliser));
        registry
    }

    pub fn register(&mut self, normaliser: Arc<dyn Normaliser>) {
        self.normalisers.push(normaliser);
    }

    pub fn select(&self, mime_type: &str) -> Option<&Arc<dyn Normaliser>> {
        let mime = base_mime(mime_type);
        self.normalisers
            .iter()
            .filter(|n| n.supports(&mime))
            .max_by_key(|n| n.priority())
    }

    pub fn normalise(&self, raw: &RawDocument) -> Result<Document> {
        let normaliser = self
            .select(&raw.mime_type)
            .ok_or_else(|| Error::UnsupportedType(format!("mime type {:?}", raw.mime_type)))?;
        normaliser.normalise(raw)
    }
}

/// `"Text/Plain; charset=utf-8"` → `"text/plain"`.
fn base_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Fallback for every `text/*` type plus JSON and XML.
pub struct PlainTextNormaliser;

impl Normaliser for PlainTextNormaliser {
    fn name(&self) -> &str {
        "plaintext"
    }

    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("text/")
            || matches!(
                mime_type,
                "application/json" | "application/xml" | "application/toml" | "image/svg+xml"
            )
    }

    fn priority(&self) -> u8 {
        5
    }

    fn normalise(&self, raw: &RawDocument) -> Result<Document> {
        let content = String::from_utf8_lossy(&raw.content).into_owned();
        let title = metadata_title(raw).unwrap_or_else(|| title_from_uri(&raw.uri));
        Ok(base_document(raw, title, content))
    }
}

/// Takes the first `# ` heading as the title and strips inline markup.
pub struct MarkdownNormaliser;

impl Normaliser for MarkdownNormaliser {
    fn name(&self) -> &str {
        "markdown"
    }

    fn supports(&self, mime_type: &str) -> bool {
        matches!(mime_type, "text/markdown" | "text/x-markdown")
    }

    fn priority(&self) -> u8 {
        50
    }

    fn normalise(&self, raw: &RawDocument) -> Result<Document> {
        let source = String::from_utf8_lossy(&raw.content);
        let title = metadata_title(raw)
            .or_else(|| {
                source
                    .lines()
                    .find_map(|l| l.strip_prefix("# "))
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
            })
            .unwrap_or_else(|| title_from_uri(&raw.uri));
        Ok(base_document(raw, title, strip_markdown(&source)))
    }
}

fn strip_markdown(source: &str) -> String {
    source
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .map(|line| {
            let line = line.trim_start_matches('#').trim_start();
            line.replace("**", "").replace("__", "").replace('`', "")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap width for rendered HTML; wide enough that sentences stay on one
/// line.
const HTML_WIDTH: usize = 10_000;

/// Renders HTML to text without scripts or styles. The title comes from
/// `<title>`, falling back to metadata and then the URI.
pub struct HtmlNormaliser;

impl Normaliser for HtmlNormaliser {
    fn name(&self) -> &str {
        "html"
    }

    fn supports(&self, mime_type: &str) -> bool {
        matches!(mime_type, "text/html" | "application/xhtml+xml")
    }

    fn priority(&self) -> u8 {
        50
    }

    fn normalise(&self, raw: &RawDocument) -> Result<Document> {
        let source = String::from_utf8_lossy(&raw.content);
        let title = html_title(&source)
            .or_else(|| metadata_title(raw))
            .unwrap_or_else(|| title_from_uri(&raw.uri));
        let body = ["head", "script", "style", "noscript"]
            .iter()
            .fold(source.to_string(), |html, tag| strip_elements(&html, tag));
        let text = html_to_text(&body)?;
        let content = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let mut doc = base_document(raw, title, content);
        doc.metadata.insert("format".into(), "html".into());
        Ok(doc)
    }
}

fn html_to_text(html: &str) -> Result<String> {
    html2text::from_read(html.as_bytes(), HTML_WIDTH)
        .map_err(|err| Error::invalid(format!("unreadable html: {err}")))
}

/// Text of the first `<title>` element, entities decoded.
fn html_title(source: &str) -> Option<String> {
    let (start, end) = element_span(source, "title")?;
    let inner = &source[start..end];
    let inner = inner.find('>').map(|i| &inner[i + 1..])?;
    let inner = inner
        .to_ascii_lowercase()
        .rfind("</title")
        .map(|i| &inner[..i])
        .unwrap_or(inner);
    let title = html_to_text(inner).ok()?;
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

/// `source` without any `<tag ...>...</tag>` element.
fn strip_elements(source: &str, tag: &str) -> String {
    let mut html = source.to_string();
    while let Some((start, end)) = element_span(&html, tag) {
        html.replace_range(start..end, " ");
    }
    html
}

/// Byte range covering the first `<tag>` element up to and including its
/// closing tag, matched ASCII case-insensitively.
fn element_span(source: &str, tag: &str) -> Option<(usize, usize)> {
    let lower = source.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = lower.match_indices(&open).find_map(|(i, _)| {
        let next = lower[i + open.len()..].chars().next()?;
        (next == '>' || next.is_ascii_whitespace()).then_some(i)
    })?;
    let end = lower[start..].find(&close)? + start + close.len();
    Some((start, end))
}

fn base_document(raw: &RawDocument, title: String, content: String) -> Document {
    let mut metadata = raw.metadata.clone();
    metadata.insert("mime_type".into(), raw.mime_type.clone().into());
    let updated_at = metadata_time(raw, "updated_at").unwrap_or_else(Utc::now);
    let created_at = metadata_time(raw, "created_at").unwrap_or(updated_at);
    Document {
        id: derive_id(&[&raw.source_id, &raw.uri]),
        source_id: raw.source_id.clone(),
        uri: raw.uri.clone(),
        title,
        content,
        parent_id: raw
            .parent_uri
            .as_deref()
            .map(|parent| derive_id(&[&raw.source_id, parent])),
        metadata,
        created_at,
        updated_at,
    }
}

fn metadata_title(raw: &RawDocument) -> Option<String> {
    raw.metadata
        .get("title")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// RFC 3339 timestamp stored under `key` by the connector, if any.
fn metadata_time(raw: &RawDocument, key: &str) -> Option<DateTime<Utc>> {
    raw.metadata
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// `"/notes/meeting_notes-2024.txt"` → `"meeting notes 2024"`.
fn title_from_uri(uri: &str) -> String {
    let file = uri
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(uri);
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    stem.replace(['_', '-'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(mime: &str, uri: &str, body: &str) -> RawDocument {
        RawDocument::new("fs-1", uri, mime, body.as_bytes().to_vec())
    }

    #[test]
    fn test_title_from_uri() {
        assert_eq!(title_from_uri("/notes/meeting_notes-2024.txt"), "meeting notes 2024");
        assert_eq!(title_from_uri("/a.txt"), "a");
        assert_eq!(title_from_uri(".bashrc"), ".bashrc");
        assert_eq!(title_from_uri("README"), "README");
    }

    #[test]
    fn test_selects_by_priority() {
        let registry = NormaliserRegistry::with_defaults();
        assert_eq!(registry.select("text/markdown").unwrap().name(), "markdown");
        assert_eq!(
            registry.select("Text/Plain; charset=utf-8").unwrap().name(),
            "plaintext"
        );
        assert!(registry.select("application/pdf").is_none());
    }

    #[test]
    fn test_unsupported_mime_fails() {
        let registry = NormaliserRegistry::with_defaults();
        let err = registry
            .normalise(&raw("application/pdf", "/x.pdf", ""))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn test_markdown_title_and_stripping() {
        let doc = MarkdownNormaliser
            .normalise(&raw(
                "text/markdown",
                "/guide.md",
                "# Setup Guide\n\nRun **cargo** `build`.\n```\ncode\n```",
            ))
            .unwrap();
        assert_eq!(doc.title, "Setup Guide");
        assert_eq!(doc.content, "Setup Guide\n\nRun cargo build.\ncode");
    }

    #[test]
    fn test_html_title_and_text() {
        let page = r#"<!DOCTYPE html>
<HTML><Head><TITLE>Fish &amp; Chips</TITLE>
<style>body { color: red; }</style></Head>
<body>
  <h1>Menu</h1>
  <p>Cod   served with <b>mushy</b> peas.</p>
  <script>var secret = "tracking";</script>
  <ul><li>Vinegar</li></ul>
</body></HTML>"#;
        let registry = NormaliserRegistry::with_defaults();
        assert_eq!(registry.select("text/html; charset=utf-8").unwrap().name(), "html");

        let doc = registry.normalise(&raw("text/html", "/menu.html", page)).unwrap();
        assert_eq!(doc.title, "Fish & Chips");
        assert!(doc.content.contains("Menu"));
        assert!(doc.content.contains("mushy"));
        assert!(doc.content.contains("Vinegar"));
        assert!(!doc.content.contains('<'));
        assert!(!doc.content.contains("color: red"));
        assert!(!doc.content.contains("tracking"));
        assert!(!doc.content.contains("Fish"));
        assert!(doc.content.lines().all(|l| !l.trim().is_empty()));
        assert_eq!(doc.metadata["format"], "html");
        assert_eq!(doc.metadata["mime_type"], "text/html");
    }

    #[test]
    fn test_html_without_title_uses_uri() {
        let doc = HtmlNormaliser
            .normalise(&raw("text/html", "/release-notes.htm", "<p>Shipped.</p>"))
            .unwrap();
        assert_eq!(doc.title, "release notes");
        assert_eq!(doc.content, "Shipped.");
        assert_eq!(element_span("<titles>x</titles>", "title"), None);
        assert_eq!(
            strip_elements("a<script>1</script>b<SCRIPT src=x></SCRIPT>c", "script"),
            "a b c"
        );
    }

    #[test]
    fn test_document_identity_and_metadata() {
        let mut input = raw("text/plain", "/a.txt", "hello");
        input
            .metadata
            .insert("updated_at".into(), "2024-05-01T10:00:00Z".into());
        input.parent_uri = Some("/".into());
        let doc = PlainTextNormaliser.normalise(&input).unwrap();

        assert_eq!(doc.id, derive_id(&["fs-1", "/a.txt"]));
        assert_eq!(doc.parent_id, Some(derive_id(&["fs-1", "/"])));
        assert_eq!(doc.updated_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(doc.created_at, doc.updated_at);
        assert_eq!(doc.metadata["mime_type"], "text/plain");
    }
}
