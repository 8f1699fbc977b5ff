//! # Bridge Memory
//!
//! Tenant-scoped long-term memory for a chat bridge that puts an LLM agent
//! in a Matrix room.
//!
//! Each tenant (bridge, login, agent) owns a virtual tree of markdown
//! notes under `memory/` and session transcripts under `sessions/`. The
//! engine chunks those documents, embeds them, and answers hybrid
//! (keyword + vector) queries with line-addressed results the agent can
//! read back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Content store│──▶│  Sync pass  │──▶│  SQLite   │
//! │ notes + logs │   │ Chunk+Embed │   │ FTS5+Vec  │
//! └──────────────┘   └─────────────┘   └─────┬─────┘
//!                                            │
//!                         ┌──────────────────┤
//!                         ▼                  ▼
//!                   ┌──────────┐       ┌──────────┐
//!                   │  search  │       │  status  │
//!                   └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | `[memory]` parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`textfs`] | SQLite-backed content store |
//! | [`sqlite_store`] | SQLite-backed index store |
//! | [`backend`] | Per-tenant store construction |
//! | [`embedding`] | Providers, retry, batch jobs, fallback |
//! | [`sync`] | Incremental indexing and retention |
//! | [`manager`] | Per-tenant engine and scheduler |
//! | [`registry`] | Manager cache keyed by tenant |
//! | [`read`] | Line-window reads |
//! | [`status`] | Diagnostics |
//! | [`search`] | CLI output for search |
//! | [`logging`] | Tracing setup |

pub mod backend;
pub mod config;
pub mod db;
pub mod embedding;
pub mod logging;
pub mod manager;
pub mod migrate;
pub mod read;
pub mod registry;
pub mod search;
pub mod sqlite_store;
pub mod status;
pub mod sync;
pub mod textfs;
