//! # Sercha Core
//!
//! Domain logic for Sercha, a local-first personal search engine: data
//! models, the connector contract, the document pipeline, the sync
//! orchestrator, the task scheduler, and multi-mode search.
//!
//! The crate owns no database, HTTP client, or filesystem access. Those are
//! supplied by the host through the traits in [`store`], [`connector`],
//! [`embedding`] and [`tasks`]; [`store::memory`] provides in-process
//! implementations of every store.

pub mod auth;
pub mod catalog;
pub mod chunk;
pub mod connector;
pub mod embedding;
pub mod error;
pub mod models;
pub mod normalise;
pub mod pipeline;
pub mod scheduler;
pub mod search;
pub mod store;
pub mod sync;
pub mod tasks;

pub use error::{Error, Result};
