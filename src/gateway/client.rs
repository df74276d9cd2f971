//! Gateway Client with Candidate Failover
//!
//! Single responsibility: run one logical call, trying candidate URLs in order.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    GatewayClient                        │
//! │  - Exposes call() to callers                            │
//! │  - Resolves candidates and credentials per call         │
//! │  - Fails over across candidates, strictly in order      │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                 SessionRunner (trait)                   │
//! │  - One full session against one URL                     │
//! │  - WebSocketRunner drives session::call_at()            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failover Policy
//!
//! Candidates are never tried in parallel: two gateways receiving the same
//! `agent` call would start the same task twice. The first success wins and
//! no later candidate is contacted. When every candidate fails, the last
//! error is returned wrapped in `AllCandidatesExhausted`.
//!
//! Connections are not pooled. Every call pays for a fresh handshake.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::auth::ConnectAuth;
use super::candidates::{discover_default_gateway, resolve_candidates};
use super::device::{DeviceAuth, DeviceAuthPaths};
use super::session::{call_at, CallRequest};
use crate::config::{AgentRoster, GatewaySettings};
use crate::error::GatewayError;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured timeout
    pub timeout: Option<Duration>,
    pub expect_final: bool,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Runs one complete session (connect, handshake, call) against one URL.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run(
        &self,
        url: &str,
        call: CallRequest,
        auth: &ConnectAuth,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;
}

/// Session runner over a real WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketRunner;

#[async_trait]
impl SessionRunner for WebSocketRunner {
    async fn run(
        &self,
        url: &str,
        call: CallRequest,
        auth: &ConnectAuth,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        call_at(url, call, auth, timeout).await
    }
}

/// Candidates and credentials for one call.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    pub urls: Vec<String>,
    pub auth: ConnectAuth,
}

/// Gateway client. Cheap to share behind an `Arc`; holds no connections.
pub struct GatewayClient<R = WebSocketRunner> {
    settings: GatewaySettings,
    runner: R,
}

impl GatewayClient<WebSocketRunner> {
    pub fn new(settings: GatewaySettings) -> Self {
        Self::with_runner(settings, WebSocketRunner)
    }
}

impl<R: SessionRunner> GatewayClient<R> {
    pub fn with_runner(settings: GatewaySettings, runner: R) -> Self {
        Self { settings, runner }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Agents known to the gateway config, for assignee resolution.
    pub fn roster(&self) -> AgentRoster {
        self.settings.file_config().roster()
    }

    /// Resolve candidates and load credentials from the current host state.
    pub fn plan(&self) -> ConnectionPlan {
        let file = self.settings.file_config();
        let default_gateway = discover_default_gateway(&self.settings.route_table_path);
        let urls = resolve_candidates(self.settings.configured_url().as_deref(), default_gateway);

        let device = DeviceAuth::load(&DeviceAuthPaths {
            identity: self.settings.device_identity_path.clone(),
            device_auth: self.settings.device_auth_path.clone(),
            paired: self.settings.paired_devices_path.clone(),
        })
        .map(Arc::new);

        let auth = ConnectAuth {
            gateway_token: self.settings.resolve_gateway_token(&file),
            device,
            display_name: self.settings.client_display_name.clone(),
        };

        debug!(
            candidates = urls.len(),
            device_auth = auth.device.is_some(),
            bearer = auth.gateway_token.is_some(),
            "Gateway connection plan resolved"
        );
        ConnectionPlan { urls, auth }
    }

    /// Call a gateway method, failing over across candidates.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Value, GatewayError> {
        let plan = self.plan();
        let timeout = opts.timeout.unwrap_or(self.settings.request_timeout);
        let call = CallRequest::new(method, params).expect_final(opts.expect_final);
        self.call_with_plan(&plan, call, timeout).await
    }

    /// Try `call` against each URL of `plan` in order until one succeeds.
    pub async fn call_with_plan(
        &self,
        plan: &ConnectionPlan,
        call: CallRequest,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let mut last_error = None;

        for (attempt, url) in plan.urls.iter().enumerate() {
            match self.runner.run(url, call.clone(), &plan.auth, timeout).await {
                Ok(payload) => {
                    info!(url = %url, method = %call.method, attempt = attempt + 1, "Gateway call succeeded");
                    return Ok(payload);
                }
                Err(e) => {
                    warn!(url = %url, method = %call.method, attempt = attempt + 1, error = %e, "Gateway candidate failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(GatewayError::AllCandidatesExhausted {
                attempts: plan.urls.len(),
                last: Box::new(last),
            }),
            None => Err(GatewayError::NoCandidates(call.method)),
        }
    }
}
