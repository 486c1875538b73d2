//! Document review issues: discovery, persistence and resolution.
//!
//! ## Overview
//!
//! A review request for a document either replays the issues already stored
//! for it or runs the text-generation backend over the document, persisting
//! each batch of findings before streaming it to the caller. Reviewers then
//! accept or dismiss individual issues.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (Router, TraceLayer, CORS)           │
//! │          │ <─────── │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘  frames  │         │                    │                   │
//!                       │         │ get_or_review()    │ accept/dismiss    │
//!                       │         v                    v                   │
//!                       │  orchestrator.rs        lifecycle.rs             │
//!                       │   (DocumentLocks)            │                   │
//!                       │         │                    │                   │
//!                       │         │ review() / next_batch()                │
//!                       │         v                    v                   │
//!                       │  inference.rs ──> huggingface.rs   store.rs      │
//!                       │                     └─ documents.rs  └─ db.rs    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `models`    | `Issue`, `RawIssue`, `IssueUpdate`, consolidator types  |
//! | `events`    | Event-stream frame encoding                             |
//! | `prompts`   | Agent and consolidator prompt text per `IssueType`     |
//! | `locks`     | `DocumentLocks`, one compute run per document           |
//!
//! ## Typical Request Flow (first review of a document)
//!
//! 1. `GET /api/v1/review/{doc_id}/issues` → `api::review_issues()`
//! 2. `ReviewOrchestrator::get_or_review()` finds no stored issues and spawns
//!    the compute task, which takes the document lock and re-reads the store.
//! 3. `HuggingFaceAdapter::review()` loads the document and splits it into
//!    paragraph chunks. Each `next_batch()` prompts the model once per issue
//!    type, plus a consolidator pass when enabled.
//! 4. Each batch is tagged with ids and audit fields, written with
//!    `IssueStore::upsert_many()` and only then sent to the caller as an
//!    `issues` frame. The run ends with a `complete` or `error` frame.

pub mod api;
pub mod db;
pub mod documents;
pub mod events;
pub mod huggingface;
pub mod inference;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod server;
pub mod store;
