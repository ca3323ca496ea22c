//! Filesystem source through sync, search, exclusion and the scheduler,
//! all backed by SQLite.

use std::fs;
use std::path::Path;
use std::process::Command;

use sercha::app::App;
use sercha::config::Config;
use sercha_core::models::Source;
use sercha_core::search::{SearchMode, SearchOptions};
use sercha_core::tasks::DOCUMENT_SYNC_TASK_ID;
use sercha_core::Error;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_corpus(root: &Path) {
    let files = root.join("files");
    fs::create_dir_all(files.join("nested")).unwrap();
    fs::write(
        files.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt covers cargo and crates.",
    )
    .unwrap();
    fs::write(
        files.join("beta.md"),
        "# Beta Document\n\nPython and machine learning with PyTorch.",
    )
    .unwrap();
    fs::write(
        files.join("nested/gamma.txt"),
        "Gamma notes about deployment, Kubernetes and Docker.",
    )
    .unwrap();
}

fn config_toml(root: &Path) -> String {
    let db = root.join("data/sercha.sqlite");
    format!(
        "[db]\npath = \"{}\"\n\n[scheduler]\nenabled = true\n",
        db.to_string_lossy().replace('\\', "/")
    )
}

async fn setup() -> (TempDir, App) {
    let tmp = TempDir::new().unwrap();
    write_corpus(tmp.path());
    let config = Config::from_toml(&config_toml(tmp.path())).unwrap();
    let app = App::open(config).await.unwrap();
    let source = Source::new("docs", "filesystem", "Docs")
        .with_config("root", tmp.path().join("files").to_string_lossy());
    app.catalog.add_source(&source).await.unwrap();
    (tmp, app)
}

#[tokio::test]
async fn test_sync_then_search() {
    let (_tmp, app) = setup().await;
    let report = app
        .orchestrator
        .sync_source("docs", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.items_processed, 3);
    assert_eq!(report.items_failed, 0);
    assert!(report.cursor.is_some());

    let results = app
        .search
        .search("rust cargo", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].document.uri, "/alpha.md");
    assert_eq!(results[0].document.title, "Alpha Document");
    assert_eq!(results[0].source_name, "Docs");
    assert!(!results[0].highlights.is_empty());

    // Second run resumes after the cursor and finds nothing new.
    let again = app
        .orchestrator
        .sync_source("docs", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.items_processed, 0);
    assert_eq!(app.store.document_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_hybrid_without_embedder_is_unavailable() {
    let (_tmp, app) = setup().await;
    let err = app
        .search
        .search("rust", &SearchOptions::mode(SearchMode::Hybrid))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_exclude_and_remove_source() {
    let (tmp, app) = setup().await;
    app.orchestrator
        .sync_source("docs", &CancellationToken::new())
        .await
        .unwrap();
    let beta = app
        .stores
        .documents
        .find_by_uri("docs", "/beta.md")
        .await
        .unwrap()
        .unwrap();
    app.catalog
        .exclude_document(&beta.id, "not relevant")
        .await
        .unwrap();
    assert!(app
        .search
        .search("pytorch", &SearchOptions::default())
        .await
        .unwrap()
        .is_empty());

    // A rewrite of the excluded file stays out of the index.
    fs::write(tmp.path().join("files/beta.md"), "# Beta\n\nPyTorch again.").unwrap();
    let file = fs::File::options()
        .write(true)
        .open(tmp.path().join("files/beta.md"))
        .unwrap();
    file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(5))
        .unwrap();
    let report = app
        .orchestrator
        .sync_source("docs", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.items_skipped, 1);
    assert_eq!(app.store.document_count().await.unwrap(), 2);

    let removed = app.catalog.remove_source("docs").await.unwrap();
    assert_eq!(removed.documents, 2);
    assert_eq!(removed.exclusions, 1);
    assert!(matches!(
        app.catalog.get_source("docs").await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(app
        .search
        .search("rust", &SearchOptions::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_scheduled_sync_persists_history() {
    let (_tmp, app) = setup().await;
    app.scheduler.init_tasks().await.unwrap();
    let result = app
        .scheduler
        .run_now(DOCUMENT_SYNC_TASK_ID)
        .unwrap()
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.items_processed, 3);

    let history = app.scheduler.history(DOCUMENT_SYNC_TASK_ID, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    let row = app.scheduler.task(DOCUMENT_SYNC_TASK_ID).await.unwrap();
    assert!(row.last_success.is_some());
    assert!(row.next_run.unwrap() > row.last_run.unwrap());
    assert_eq!(app.store.document_count().await.unwrap(), 3);
}

fn run_cli(config: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_sercha"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run sercha binary");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_cli_init_add_sync_search() {
    let tmp = TempDir::new().unwrap();
    write_corpus(tmp.path());
    let config = tmp.path().join("config/sercha.toml");
    fs::create_dir_all(config.parent().unwrap()).unwrap();
    fs::write(&config, config_toml(tmp.path())).unwrap();

    let (_, stderr, ok) = run_cli(&config, &["init"]);
    assert!(ok, "init failed: {stderr}");

    let root = format!("root={}", tmp.path().join("files").display());
    let (_, stderr, ok) = run_cli(
        &config,
        &["sources", "add", "docs", "filesystem", "Docs", "--set", &root],
    );
    assert!(ok, "sources add failed: {stderr}");

    let (stdout, stderr, ok) = run_cli(&config, &["sync", "docs"]);
    assert!(ok, "sync failed: {stderr}");
    assert!(stdout.contains("3 processed"), "unexpected output: {stdout}");

    let (stdout, _, ok) = run_cli(&config, &["search", "kubernetes", "--json"]);
    assert!(ok);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(results[0]["document"]["uri"], "/nested/gamma.txt");
    let id = results[0]["document"]["id"].as_str().unwrap().to_string();

    let (stdout, stderr, ok) = run_cli(&config, &["documents", "get", &id, "--content"]);
    assert!(ok, "documents get failed: {stderr}");
    assert!(stdout.contains("Kubernetes and Docker"));

    let (stdout, _, ok) = run_cli(&config, &["documents", "get", &id, "--json"]);
    assert!(ok);
    let details: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(details["source_name"], "Docs");
    assert_eq!(details["source_type"], "filesystem");
    assert_eq!(details["chunk_count"], 1);

    let (_, _, ok) = run_cli(&config, &["documents", "get", "missing"]);
    assert!(!ok);

    let (_, stderr, ok) = run_cli(&config, &["search", "x", "--mode", "bogus"]);
    assert!(!ok);
    assert!(stderr.contains("unknown search mode"));
}

#[test]
fn test_cli_init_writes_default_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("config/sercha.toml");
    let output = Command::new(env!("CARGO_BIN_EXE_sercha"))
        .current_dir(tmp.path())
        .arg("--config")
        .arg(&config)
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(config.exists());
    assert!(tmp.path().join("data/sercha.sqlite").exists());
}
