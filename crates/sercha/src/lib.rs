//! # Sercha
//!
//! **A local-first document search platform.**
//!
//! Sercha syncs documents from configured sources into SQLite, keeps them
//! current with a background scheduler, and answers queries with keyword,
//! hybrid, and LLM-assisted search. The domain logic lives in
//! [`sercha_core`]; this crate supplies the adapters and the `sercha` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Connectors  │──▶│   Pipeline    │──▶│  SQLite    │
//! │ filesystem  │   │ normalise +   │   │ FTS5 + blob│
//! └─────────────┘   │ chunk + embed │   │  vectors   │
//!                   └──────────────┘   └─────┬─────┘
//!        ┌───────────┐                       │
//!        │ Scheduler │── document-sync ──────┤
//!        │           │── oauth-refresh       ▼
//!        └───────────┘                 ┌──────────┐
//!                                      │  Search  │
//!                                      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sercha init
//! sercha sources add notes filesystem "My notes" --set root=~/notes
//! sercha sync notes
//! sercha search "quarterly invoice"
//! sercha daemon                 # scheduler in the foreground
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite pool setup (WAL, foreign keys) |
//! | [`migrate`] | Schema creation including the FTS5 index |
//! | [`sqlite_store`] | Every core store contract over SQLite |
//! | [`connector_fs`] | Filesystem connector with mtime cursors |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`llm`] | OpenAI and Ollama query expansion |
//! | [`oauth`] | OAuth2 refresh-token exchange |
//! | [`logging`] | Tracing subscriber setup |
//! | [`app`] | Service wiring shared by CLI commands |

pub mod app;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod oauth;
pub mod sqlite_store;
