//! # orchestrator - Control Plane for Multi-Agent Task Orchestration
//!
//! Accepts natural-language development requests, decomposes them into a DAG
//! of specialist subtasks, routes each subtask through the `taskgraph-core`
//! engine, streams partial results to callers, and gates high-risk work on
//! human approval.
//!
//! ## Components
//!
//! - [`planner`] - decomposition router with lenient sanitization of noisy
//!   planner output
//! - [`workflows`] - the static orchestration graph and the task records
//!   around it
//! - [`approval`] - pending → approved | rejected | expired state machine
//! - [`lifecycle`] - workflow TTL, parent chains, resource dedup
//! - [`gateway`] - SSE chat streaming with backpressure and cancellation
//! - [`catalogue`] - tool catalogue and per-request disclosure
//! - [`registry`] - specialist agent registry with heartbeats
//! - [`events`] - in-process pub/sub
//! - [`api`] - the HTTP surface
//! - [`runtime`] - startup wiring and graceful shutdown
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use orchestrator::config::{Environment, OrchestratorConfig};
//! use orchestrator::runtime::Runtime;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::defaults(Environment::Dev);
//! let runtime = Runtime::init(config).await?;
//! runtime.start_background();
//!
//! let app = orchestrator::api::create_router(runtime.clone());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod approval;
pub mod catalogue;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod planner;
pub mod registry;
pub mod runtime;
pub mod specialist;
pub mod workflows;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use runtime::Runtime;
