//! Orchestration Gateway Connection Module
//!
//! This module talks to the orchestration gateway over a short-lived WebSocket
//! per call.
//!
//! # Architecture
//!
//! The module is organized by concern, with each submodule having a single responsibility:
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `candidates` | Ordered, de-duplicated gateway URLs to try            |
//! | `device`     | Device identity loading and payload signing           |
//! | `auth`       | `connect` params for token or device-signed auth      |
//! | `protocol`   | JSON frame encoding/decoding                          |
//! | `transport`  | WebSocket connect/send/receive                        |
//! | `session`    | Handshake + request correlation state machine         |
//! | `client`     | High-level client with candidate failover             |
//!
//! # Key Design Principles
//!
//! ## 1. Protocol Logic Without I/O
//!
//! - `SessionMachine` decides what is terminal and what is not
//! - It never touches a socket, so every edge case is unit-testable
//! - `session::call_at()` only shuttles frames and timers into it
//!
//! ## 2. One Deadline Per Attempt
//!
//! - Connecting, the nonce round-trip and the call share one timer
//! - When it fires every outstanding call fails the same way
//!
//! ## 3. Fresh State Per Call
//!
//! - Candidates and credentials are re-read for every call
//! - Pending requests belong to one session and die with it
//!
//! # Usage
//!
//! ```ignore
//! use gateway_bridge::gateway::{CallOptions, GatewayClient};
//!
//! let client = GatewayClient::new(settings);
//! let payload = client
//!     .call("cron.run", json!({ "id": "nightly" }), CallOptions::default())
//!     .await?;
//! ```

pub mod auth;
pub mod candidates;
pub mod client;
pub mod device;
pub mod protocol;
pub mod session;
pub mod transport;

pub use auth::ConnectAuth;
pub use client::{CallOptions, ConnectionPlan, GatewayClient, SessionRunner, WebSocketRunner};
pub use device::{DeviceAuth, DeviceAuthPaths};
pub use session::{call_at, CallRequest, SessionMachine, SessionState};
