/// kbforge: durable job queues, worker runtimes, and MCP tool-proxy registry
/// for a knowledge-base ingestion platform.
///
/// HTTP routing, request auth, DTOs, concrete LLM/embedding providers, the
/// blob storage client, and the database driver itself are all owned by the
/// host application; this crate only specifies and consumes the trait
/// surface for them (see `services`).

pub mod backup;
pub mod config;
pub mod errors;
pub mod extraction;
pub mod jobstore;
pub mod logging;
pub mod mcp;
pub mod queue;
pub mod retry;
pub mod services;
pub mod sweeper;
pub mod worker;
