//! Gateway Handshake Authentication
//!
//! Single responsibility: turn the available credentials into `connect` params.
//!
//! # Authentication Modes
//!
//! 1. **Device auth** (preferred)
//!    - Wait for the gateway's `connect.challenge` event
//!    - Sign the canonical payload (including the nonce) with the device key
//!    - Send the operator token plus the device proof
//!
//! 2. **Token auth**
//!    - Send `connect` as soon as the socket opens
//!    - Bearer token only, no device proof

use std::sync::Arc;
use uuid::Uuid;

use super::device::{DeviceAuth, SignaturePayload};
use super::protocol::{ClientInfo, ConnectParams, DeviceProof, TokenAuth, PROTOCOL_VERSION};
use crate::config::clean_str;

pub const OPERATOR_ROLE: &str = "operator";

/// Scopes requested when no device scopes are known.
pub const DEFAULT_OPERATOR_SCOPES: [&str; 4] = [
    "operator.admin",
    "operator.approvals",
    "operator.pairing",
    "operator.write",
];

/// Version reported in the client descriptor.
pub const CLIENT_VERSION: &str = "1.0.0";

/// Credentials for one call. Cheap to clone; the device context is shared.
#[derive(Debug, Clone, Default)]
pub struct ConnectAuth {
    pub gateway_token: Option<String>,
    pub device: Option<Arc<DeviceAuth>>,
    pub display_name: String,
}

impl ConnectAuth {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            gateway_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: Arc<DeviceAuth>) -> Self {
        self.device = Some(device);
        self
    }

    /// Whether the session must wait for a nonce challenge before connecting.
    pub fn expects_challenge(&self) -> bool {
        self.device.is_some()
    }

    /// Build `connect` params, signing with the device key when present.
    pub fn connect_params(&self, nonce: Option<&str>, signed_at_ms: i64) -> ConnectParams {
        let device = self.device.as_deref();

        let scopes: Vec<String> = match device {
            Some(d) if !d.scopes.is_empty() => d.scopes.clone(),
            _ => DEFAULT_OPERATOR_SCOPES.iter().map(|s| s.to_string()).collect(),
        };
        let client_id = descriptor(device.map(|d| d.client_id.as_str()), "gateway-client");
        let client_mode = descriptor(device.map(|d| d.client_mode.as_str()), "backend");
        let platform = descriptor(device.map(|d| d.platform.as_str()), "linux");

        let token = match device {
            Some(d) => Some(d.token.clone()),
            None => self.gateway_token.clone(),
        }
        .filter(|t| !t.is_empty());

        let proof = device.map(|d| {
            let nonce = nonce.filter(|n| !n.is_empty());
            let payload = SignaturePayload {
                device_id: &d.device_id,
                client_id: &client_id,
                client_mode: &client_mode,
                role: OPERATOR_ROLE,
                scopes: &scopes,
                signed_at_ms,
                token: token.as_deref(),
                nonce,
            };
            DeviceProof {
                id: d.device_id.clone(),
                public_key: d.public_key.clone(),
                signature: d.sign(&payload.canonical()),
                signed_at: signed_at_ms,
                nonce: nonce.map(str::to_string),
            }
        });

        let display_name = if self.display_name.is_empty() {
            "Mission Control Backend".to_string()
        } else {
            self.display_name.clone()
        };

        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: client_id,
                display_name,
                version: CLIENT_VERSION.to_string(),
                platform,
                mode: client_mode,
                instance_id: Uuid::new_v4().to_string(),
            },
            caps: Vec::new(),
            role: OPERATOR_ROLE.to_string(),
            scopes,
            auth: token.map(|token| TokenAuth { token }),
            device: proof,
        }
    }
}

fn descriptor(value: Option<&str>, fallback: &str) -> String {
    let value = value.map(|v| clean_str(v, 120)).unwrap_or_default();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
