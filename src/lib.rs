//! # Submission Index
//!
//! Indexes a repository pinned to an exact commit and retrieves the code
//! chunks most relevant to a free-text query, under strict size budgets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Snapshot │──▶│ Chunker │──▶│ Embed+Writer │──▶│ Vector index │
//! │ (zipball)│   │ (lines) │   │  (batched)   │   │ (namespace)  │
//! └──────────┘   └─────────┘   └──────────────┘   └──────┬───────┘
//!       ▲                                                │
//!       │            ┌───────────────┐                   ▼
//!       └────────────│ Control plane │◀────────────┌───────────┐
//!                    │ (status gate) │             │ Retriever │
//!                    └───────────────┘             └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! subidx init
//! subidx submit sub-42 acme/widgets@3f2a9c1
//! subidx index sub-42
//! subidx search sub-42 "where is the password hashed?"
//! subidx serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`snapshot`] | Archive download and safe extraction |
//! | [`chunk`] | Tree walk and line-window chunking |
//! | [`embedding`] | Embedding providers |
//! | [`vector_index`] | Vector index backends |
//! | [`writer`] | Batched embed and upsert |
//! | [`control`] | Index status records |
//! | [`pipeline`] | Single-flight indexing and client wiring |
//! | [`retrieval`] | Search with dedup and budgets |
//! | [`notify`] | Completion events |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod control;
pub mod db;
pub mod embedding;
pub mod error;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod retrieval;
pub mod server;
pub mod snapshot;
pub mod vector_index;
pub mod writer;
