//! Lifelog sync agent.
//!
//! Pulls lifelog records from a source API on a schedule, renders each one
//! into an annotated markdown memory, and delivers it to a memory store
//! at least once, deduplicated by record id. A local SQLite ledger
//! remembers what was delivered, where the incremental window stands, and
//! what failed.
//!
//! # Architecture
//!
//! - **Clients**: rate-limited, circuit-broken, retrying HTTP clients for the
//!   source ([`client::SourceClient`]) and destination
//!   ([`client::DestinationClient`]) APIs
//! - **State**: SQLite dedup ledger, watermark, error log and pass metrics
//!   behind an async [`state::StateStore`]
//! - **Transform**: classification and markdown rendering via
//!   [`transform::ContentProcessor`]
//! - **Sync**: one pass at a time through [`sync::SyncOrchestrator`], driven by
//!   [`sync::run_scheduler`]
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations and health checks
//! - [`record`]: Source record model
//! - [`resilience`]: Rate limiter, circuit breaker and retry policy
//! - [`client`]: Source and destination API clients
//! - [`state`]: Persistent sync state
//! - [`transform`]: Record to memory rendering
//! - [`notify`]: Alert delivery
//! - [`health`]: Health checks, transition alerts and HTTP endpoints
//! - [`sync`]: Pass orchestration and scheduling

pub mod client;
pub mod config;
pub mod db;
pub mod health;
pub mod notify;
pub mod record;
pub mod resilience;
pub mod state;
pub mod sync;
pub mod transform;
