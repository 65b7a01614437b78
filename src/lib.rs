//! # Devgraph
//!
//! A developer-activity knowledge graph. Devgraph ingests events from
//! the platforms a team already works in (GitHub, Slack, Discord),
//! extracts the decisions, discussions, features, and file changes
//! buried in them, and links everything into a queryable graph stored
//! in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐
//! │  Connectors  │──▶│ Scheduler │──▶│ Processor  │──▶│  SQLite   │
//! │ GH/Slack/Dis │   │ jobs+lease│   │ extract+tx │   │  graph    │
//! └──────────────┘   └───────────┘   └────────────┘   └────┬─────┘
//!                                                          │
//!                                      ┌───────────────────┤
//!                                      ▼                   ▼
//!                                ┌──────────┐        ┌──────────┐
//!                                │  query   │        │  search  │
//!                                │ (bundle) │        │ (vector) │
//!                                └──────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dvg init                          # create database
//! dvg sources                       # check connector health
//! dvg sync github:platform          # one-shot sync
//! dvg run                           # scheduler daemon
//! dvg query "auth flow"             # context bundle for a topic
//! dvg search "retry semantics"      # semantic search (needs embeddings)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`models`] | Events, jobs, entities, relationships |
//! | [`error`] | Failure taxonomy |
//! | [`connector`] | Connector trait, registry, HTTP helpers |
//! | [`connector_github`] | GitHub connector (commits, PRs, issues) |
//! | [`connector_slack`] | Slack channel connector |
//! | [`connector_discord`] | Discord channel connector |
//! | [`retry`] | Backoff controller and shutdown signal |
//! | [`jobs`] | Sync jobs, leases, checkpoints |
//! | [`scheduler`] | Worker pool and sync lifecycle |
//! | [`extract`] | Event grouping and knowledge extraction |
//! | [`processor`] | Batch processing and persistence |
//! | [`graph`] | Knowledge graph store and traversal |
//! | [`query`] | Bounded context queries |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`sources`] | Source and job listings for the CLI |
//! | [`db`] | SQLite pool setup |
//! | [`migrate`] | Idempotent schema migrations |

pub mod config;
pub mod connector;
pub mod connector_discord;
pub mod connector_github;
pub mod connector_slack;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod graph;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod processor;
pub mod query;
pub mod retry;
pub mod scheduler;
pub mod sources;
