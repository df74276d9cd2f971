//! Gateway Bridge - RPC client for the orchestration gateway
//!
//! Lets the task board backend ask the agent orchestration gateway to start
//! work, without ever depending on it being up.
//!
//! ## Architecture
//!
//! - **gateway**: short-lived WebSocket sessions (handshake, one call, close)
//! - **actions**: task start and orchestrator run built on `gateway`
//! - **config**: CLI/env settings and the gateway's own JSON config file
//!
//! ## Per-Call Lifecycle
//!
//! ```text
//! call(method, params)
//!   │
//!   ├── resolve candidates   configured URL, default route, docker bridges
//!   ├── load credentials     device identity, else bearer token
//!   │
//!   └── for each candidate (in order, first success wins)
//!         connect ── [connect.challenge] ── connect ── method call ── close
//! ```
//!
//! ## Authentication
//!
//! | Device identity present | Handshake                                   |
//! |-------------------------|---------------------------------------------|
//! | yes                     | wait for nonce, send Ed25519-signed proof   |
//! | no                      | send `connect` with the gateway token       |

pub mod actions;
pub mod config;
pub mod error;
pub mod gateway;

pub use actions::{
    run_task_feed, OrchestratorRunOutcome, TaskRecord, TaskStartOutcome,
};
pub use config::{GatewaySettings, DEFAULT_ORCHESTRATOR_JOB};
pub use error::GatewayError;
pub use gateway::{CallOptions, GatewayClient};
