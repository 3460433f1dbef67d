//! # Reqsolve
//!
//! A tiered requirement-resolution pipeline over a local SQLite store.
//!
//! Reqsolve answers batches of free-text requirements against an ingested
//! document corpus by trying progressively more expensive strategies and
//! stopping at the first one that is good enough: exact normalized match,
//! vector similarity, web search, then LLM generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────────┐
//! │ Requirements │──▶│        Task Tracker            │
//! │   (batch)    │   │  bounded workers, progress     │
//! └──────────────┘   └──────────────┬────────────────┘
//!                                   ▼
//!                    ┌───────────────────────────────┐
//!                    │       Tiered Resolver          │
//!                    │ exact ▸ semantic ▸ web ▸ llm   │
//!                    └──┬─────────┬─────────┬────────┘
//!                       ▼         ▼         ▼
//!                 ┌─────────┐ ┌────────┐ ┌──────────┐
//!                 │ Vector  │ │ Search │ │ Provider │
//!                 │ Store   │─▶ Cache  │ │ Registry │
//!                 └─────────┘ └────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! reqsolve init                              # create database
//! reqsolve provider add ...                  # register providers
//! reqsolve ingest --document spec-v2 doc.txt # index a document
//! reqsolve analyze --user alice reqs.txt     # resolve a batch
//! reqsolve results <task-id>                 # fetch answers
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and resolution policy |
//! | [`models`] | Core data types |
//! | [`store`] | Vector store with idempotent upsert and cosine search |
//! | [`cache`] | TTL'd search cache with change-feed invalidation |
//! | [`providers`] | Provider capability traits and HTTP implementations |
//! | [`registry`] | Persisted provider configs with per-kind defaults |
//! | [`resolve`] | Tiered resolution policy |
//! | [`task`] | Batch task tracking and bounded-concurrency execution |
//! | [`ingest`] | Document section ingestion, requirement file parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod providers;
pub mod registry;
pub mod resolve;
pub mod store;
pub mod task;
pub mod text;
pub mod vectors;
