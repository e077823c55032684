//! # repo-context
//!
//! A repository Q&A service: upload a source-code repository once, ingest
//! it into a hybrid searchable index, then ask natural-language questions
//! about the code and get streamed, citation-grounded answers.
//!
//! ## Architecture
//!
//! Ingestion runs once per repository; every question then fans out to two
//! search backends whose results are merged before composition:
//!
//! ```text
//!   upload ──▶ extract ──▶ chunk ──▶ embed ──▶ index        (per repository)
//!                │
//!                └── status: PENDING → EXTRACTING → CHUNKING →
//!                    EMBEDDING → INDEXING → READY | FAILED
//!
//!   question ──▶ ┌─────────────┐     ┌──────────────┐
//!                │ lexical (rg) │  ∥  │ semantic (kNN)│      (per question)
//!                └──────┬──────┘     └───────┬──────┘
//!                       └───── merge ────────┘
//!                               │  normalize · dedup · boost
//!                               ▼
//!                        LLM composer ──▶ token stream + citations
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-driven configuration with startup validation
//! - [`error`] - Structured error taxonomy shared by every component
//! - [`models`] - Shared data types: repositories, chunks, search results
//! - [`cache`] - TTL'd metadata/cache store with namespaced, sanitized keys
//! - [`ingest`] - Extraction, chunking, embedding, indexing, and the
//!   state machine driving them
//! - [`search`] - Hybrid retriever: ripgrep + vector backends and the
//!   result merger
//! - [`llm`] - Embedding and chat-completion clients
//! - [`chat`] - Bidirectional session orchestrator
//! - [`ratelimit`] - Per-tenant token buckets
//! - [`api`] - Axum handlers for upload, repositories, search, chat, health
//! - [`state`] - Shared application state wiring the components together

pub mod api;
pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod ratelimit;
pub mod search;
pub mod state;
