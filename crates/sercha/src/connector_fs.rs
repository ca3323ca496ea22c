//! Local filesystem connector.
//!
//! Walks a directory tree and emits one `Created` change per file matching
//! the include globs. Files are visited in `(mtime, path)` order and each
//! change carries a `<mtime_nanos>:<path>` cursor, so a resumed run only
//! revisits files modified after the last committed one.
//!
//! Source configuration keys:
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `root` | (required) | Directory to walk |
//! | `include_globs` | `**/*.md,**/*.txt` | Comma-separated globs relative to `root` |
//! | `exclude_globs` | (none) | Extra excludes on top of `.git`, `target`, `node_modules` |
//! | `follow_symlinks` | `false` | Follow symbolic links while walking |

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use sercha_core::connector::{ChangeStream, Connector};
use sercha_core::models::{Credentials, Cursor, RawDocument, RawDocumentChange, Source};
use sercha_core::{Error, Result};

pub const FILESYSTEM_TYPE: &str = "filesystem";

const DEFAULT_INCLUDES: &[&str] = &["**/*.md", "**/*.txt"];
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemConnector;

impl FilesystemConnector {
    pub fn new() -> Self {
        Self
    }
}

struct FsSettings {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FsSettings {
    fn from_source(source: &Source) -> Result<Self> {
        let root = source
            .config
            .get("root")
            .filter(|r| !r.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| Error::invalid(format!("source {}: missing `root`", source.id)))?;

        let includes = match source.config.get("include_globs") {
            Some(raw) => split_globs(raw),
            None => DEFAULT_INCLUDES.iter().map(|g| g.to_string()).collect(),
        };
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|g| g.to_string()).collect();
        if let Some(raw) = source.config.get("exclude_globs") {
            excludes.extend(split_globs(raw));
        }

        let follow_symlinks = match source.config.get("follow_symlinks").map(String::as_str) {
            None | Some("") | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(Error::invalid(format!(
                    "source {}: follow_symlinks must be true or false, got {other:?}",
                    source.id
                )))
            }
        };

        Ok(Self {
            root,
            include: build_globset(&includes)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks,
        })
    }
}

fn split_globs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(String::from)
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::invalid(format!("invalid glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::invalid(format!("invalid glob set: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FileEntry {
    mtime_nanos: i64,
    relative: String,
    path: PathBuf,
    size: u64,
}

impl FileEntry {
    fn cursor(&self) -> Cursor {
        Cursor::new(format!("{}:{}", self.mtime_nanos, self.relative))
    }

    fn after(&self, position: &(i64, String)) -> bool {
        (self.mtime_nanos, self.relative.as_str()) > (position.0, position.1.as_str())
    }
}

fn parse_cursor(cursor: &Cursor) -> Result<(i64, String)> {
    let (mtime, path) = cursor
        .as_str()
        .split_once(':')
        .ok_or_else(|| Error::invalid(format!("malformed filesystem cursor {:?}", cursor.as_str())))?;
    let mtime = mtime
        .parse::<i64>()
        .map_err(|_| Error::invalid(format!("malformed filesystem cursor {:?}", cursor.as_str())))?;
    Ok((mtime, path.to_string()))
}

fn mtime_nanos(modified: SystemTime) -> i64 {
    modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn scan(source_id: &str, settings: &FsSettings) -> Result<Vec<FileEntry>> {
    let connector_err = |message: String| Error::Connector {
        source_id: source_id.to_string(),
        message,
    };

    let mut entries = Vec::new();
    for entry in WalkDir::new(&settings.root).follow_links(settings.follow_symlinks) {
        let entry = entry.map_err(|e| connector_err(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(&settings.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if settings.exclude.is_match(&relative) || !settings.include.is_match(&relative) {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| connector_err(format!("{relative}: {e}")))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(FileEntry {
            mtime_nanos: mtime_nanos(modified),
            relative,
            path: path.to_path_buf(),
            size: metadata.len(),
        });
    }
    entries.sort();
    Ok(entries)
}

/// MIME type by file extension; unknown extensions are left to the
/// normaliser registry to reject.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" | "mdx" => "text/markdown",
        "txt" | "text" | "log" | "rst" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "yaml" | "yml" => "text/yaml",
        "json" => "application/json",
        "toml" => "application/toml",
        "xml" => "application/xml",
        "rs" | "py" | "go" | "js" | "ts" | "java" | "c" | "h" | "cpp" | "sh" | "rb" => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn read_change(source_id: String, entry: FileEntry) -> Option<Result<RawDocumentChange>> {
    let content = match tokio::fs::read(&entry.path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %entry.relative, "file vanished during sync, skipping");
            return None;
        }
        Err(e) => {
            return Some(Err(Error::Connector {
                source_id,
                message: format!("{}: {e}", entry.relative),
            }))
        }
    };

    let uri = format!("/{}", entry.relative);
    let mut raw = RawDocument::new(&source_id, uri, mime_for_path(&entry.path), content);
    let updated_at = DateTime::<Utc>::from_timestamp_nanos(entry.mtime_nanos);
    raw.metadata
        .insert("updated_at".into(), updated_at.to_rfc3339().into());
    raw.metadata
        .insert("path".into(), entry.path.to_string_lossy().to_string().into());
    raw.metadata.insert("size".into(), entry.size.into());

    Some(Ok(RawDocumentChange::created(raw).with_cursor(entry.cursor())))
}

#[async_trait]
impl Connector for FilesystemConnector {
    fn connector_type(&self) -> &str {
        FILESYSTEM_TYPE
    }

    async fn validate(&self, source: &Source, _credentials: Option<&Credentials>) -> Result<()> {
        let settings = FsSettings::from_source(source)?;
        if !settings.root.is_dir() {
            return Err(Error::invalid(format!(
                "source {}: root is not a directory: {}",
                source.id,
                settings.root.display()
            )));
        }
        Ok(())
    }

    async fn open(
        &self,
        source: &Source,
        _credentials: Option<&Credentials>,
        cursor: Option<&Cursor>,
    ) -> Result<ChangeStream> {
        let settings = FsSettings::from_source(source)?;
        let resume = cursor
            .filter(|c| !c.is_empty())
            .map(parse_cursor)
            .transpose()?;

        let source_id = source.id.clone();
        let scan_source = source_id.clone();
        let mut entries = tokio::task::spawn_blocking(move || scan(&scan_source, &settings))
            .await
            .map_err(anyhow::Error::from)??;
        if let Some(position) = &resume {
            entries.retain(|entry| entry.after(position));
        }
        tracing::debug!(source = %source_id, files = entries.len(), "filesystem scan complete");

        Ok(stream::iter(entries)
            .filter_map(move |entry| read_change(source_id.clone(), entry))
            .boxed())
    }
}
