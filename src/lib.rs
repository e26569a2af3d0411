//! # RAG Harness
//!
//! A local-first retrieval-augmented question answering pipeline.
//!
//! Every query runs three stages — plan, retrieve, generate — over a
//! SQLite-backed document store with hybrid retrieval (FTS5 keyword +
//! vector similarity). The pipeline works with or without a local model
//! runtime: planning and generation degrade to deterministic fallbacks,
//! and every query records a durable per-step trace.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌───────────┐
//! │ Question │──▶│  Planner  │──▶│ Retriever  │──▶│ Generator │
//! └──────────┘   │ sub-query │   │ dense+FTS5 │   │  + fall-  │
//!                │ decompose │   │ fuse/rerank│   │   backs   │
//!                └─────┬─────┘   └─────┬──────┘   └─────┬─────┘
//!                      │               │                │
//!                      └───────────────┼────────────────┘
//!                                      ▼
//!                               ┌────────────┐
//!                               │   Trace    │
//!                               │  recorder  │
//!                               └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag init                      # create database
//! rag add ./docs                # ingest markdown/text files
//! rag ask "How does X work?"    # answer through the pipeline
//! rag preset thorough           # switch retrieval preset
//! rag serve                     # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML deployment configuration |
//! | [`settings`] | Mutable runtime settings, presets, profiles |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking |
//! | [`store`] | Chunk storage and dense/sparse lookup |
//! | [`embedding`] | Embedding provider clients |
//! | [`planner`] | Sub-query decomposition |
//! | [`retriever`] | Hybrid retrieval, fusion, reranking, budgeting |
//! | [`generator`] | Answer generation with fallbacks |
//! | [`provider`] | Model runtime gateway (Ollama, LM Studio, cloud) |
//! | [`pipeline`] | Stage orchestration and metrics |
//! | [`trace`] | Durable query traces |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generator;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod retriever;
pub mod server;
pub mod settings;
pub mod store;
pub mod trace;
