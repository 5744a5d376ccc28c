//! # Ragi
//!
//! Watched-folder document ingestion and interaction memory for local
//! retrieval-augmented chat.
//!
//! Files dropped into a folder are settled, extracted, chunked adaptively,
//! deduplicated by content fingerprint, written to a vector index, and
//! archived. Separately, chat exchanges are remembered and recalled with
//! importance weighting and time decay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────────────────────┐
//! │ watcher  │──▶│ coordinator │──▶│ stability → extract → chunk  │
//! │ (notify) │   │  (tokio)    │   │ → dedup → index → archive    │
//! └──────────┘   └─────────────┘   └──────────────┬───────────────┘
//!                                                 ▼
//!                                   ┌──────────────────────────┐
//!                                   │ SQLite: fingerprints,    │
//!                                   │ chunks, interactions     │
//!                                   └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragi init                      # create database
//! ragi watch                     # ingest files as they arrive
//! ragi ingest ./inbox/notes.md   # ingest one file now
//! ragi memory recall "deploy"    # recall past exchanges
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Ingestion error taxonomy |
//! | [`stability`] | Settle detection and validation |
//! | [`extract`] | Text extraction per format |
//! | [`chunk`] | Adaptive chunking |
//! | [`fingerprint`] | Content fingerprints |
//! | [`dedup`] | Fingerprint store and duplicate detection |
//! | [`index`] | Vector index sinks |
//! | [`archive`] | Moving processed files |
//! | [`watcher`] | Filesystem notifications |
//! | [`coordinator`] | Per-file state machine and scheduling |
//! | [`memory`] | Interaction memory |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Database statistics |
//! | [`docs`] | Managing indexed documents |
//! | [`ingest`] | `watch`, `scan`, and `ingest` commands |
//! | [`memory_cmd`] | `memory` commands |
//! | [`logging`] | Tracing setup |

pub mod archive;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dedup;
pub mod docs;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod memory;
pub mod memory_cmd;
pub mod migrate;
pub mod models;
pub mod stability;
pub mod stats;
pub mod watcher;
