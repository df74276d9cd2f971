//! Device Identity Authentication
//!
//! Single responsibility: load this host's device identity and sign handshake payloads.
//!
//! # Files
//!
//! | File        | Shape                                                          |
//! |-------------|----------------------------------------------------------------|
//! | identity    | `{deviceId, privateKeyPem, publicKeyPem}` (Ed25519, PKCS#8/SPKI) |
//! | device-auth | `{tokens: {operator: {token, scopes}}}`                          |
//! | paired      | `{<deviceId>: {tokens: {operator: {...}}, clientId, clientMode, platform}}` |
//!
//! Any missing piece makes the context absent and the session falls back to
//! plain bearer-token auth. Loading never returns an error.
//!
//! # Signed Payload
//!
//! ```text
//! v1|deviceId|clientId|clientMode|role|scope1,scope2|signedAtMs|token
//! v2|deviceId|clientId|clientMode|role|scope1,scope2|signedAtMs|token|nonce
//! ```
//!
//! The gateway rebuilds this string from the connect params and verifies the
//! signature against it, so the layout must not change.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::{clean_str, read_json_file};

/// Scope an operator token must carry for device auth to be used.
pub const ADMIN_SCOPE: &str = "operator.admin";

/// Where the device identity files live.
#[derive(Debug, Clone)]
pub struct DeviceAuthPaths {
    pub identity: PathBuf,
    pub device_auth: PathBuf,
    pub paired: PathBuf,
}

/// Signing identity and operator credentials of this device.
///
/// Immutable once loaded; share it behind an `Arc`.
pub struct DeviceAuth {
    pub device_id: String,
    signing_key: SigningKey,
    /// Raw 32-byte public key, base64url without padding
    pub public_key: String,
    pub token: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_mode: String,
    pub platform: String,
}

impl fmt::Debug for DeviceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAuth")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_mode", &self.client_mode)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

/// Inputs of the canonical signing string.
#[derive(Debug, Clone)]
pub struct SignaturePayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl SignaturePayload<'_> {
    /// Pipe-delimited canonical form, `v2` when a nonce is present.
    pub fn canonical(&self) -> String {
        let nonce = self.nonce.filter(|n| !n.is_empty());
        let mut parts = vec![
            if nonce.is_some() { "v2" } else { "v1" }.to_string(),
            self.device_id.to_string(),
            self.client_id.to_string(),
            self.client_mode.to_string(),
            self.role.to_string(),
            self.scopes.join(","),
            self.signed_at_ms.to_string(),
            self.token.unwrap_or_default().to_string(),
        ];
        if let Some(nonce) = nonce {
            parts.push(nonce.to_string());
        }
        parts.join("|")
    }
}

impl DeviceAuth {
    /// Build a context from parsed key material and credentials.
    ///
    /// Returns `None` if the token is blank or the admin scope is missing.
    pub fn new(
        device_id: &str,
        signing_key: SigningKey,
        token: &str,
        scopes: Vec<String>,
    ) -> Option<Self> {
        let device_id = clean_str(device_id, 512);
        let token = clean_str(token, 512);
        if device_id.is_empty() || token.is_empty() || !scopes.iter().any(|s| s == ADMIN_SCOPE) {
            return None;
        }
        let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        Some(Self {
            device_id,
            signing_key,
            public_key,
            token,
            scopes,
            client_id: "cli".to_string(),
            client_mode: "cli".to_string(),
            platform: "linux".to_string(),
        })
    }

    /// Override the client descriptor recorded in the paired registry.
    pub fn with_client(mut self, client_id: &str, client_mode: &str, platform: &str) -> Self {
        let pick = |value: &str, fallback: String| {
            let value = clean_str(value, 120);
            if value.is_empty() {
                fallback
            } else {
                value
            }
        };
        self.client_id = pick(client_id, self.client_id);
        self.client_mode = pick(client_mode, self.client_mode);
        self.platform = pick(platform, self.platform);
        self
    }

    /// Load the device context from disk.
    pub fn load(paths: &DeviceAuthPaths) -> Option<Self> {
        let identity = read_json_file(&paths.identity)?;
        let device_id = str_field(&identity, "/deviceId")?;
        let private_pem = pem_field(&identity, "/privateKeyPem")?;
        let public_pem = pem_field(&identity, "/publicKeyPem")?;

        let device_auth = read_json_file(&paths.device_auth).unwrap_or(Value::Null);
        let paired = read_json_file(&paths.paired).unwrap_or(Value::Null);
        let device = paired.get(&device_id).cloned().unwrap_or(Value::Null);

        let token = str_field(&device_auth, "/tokens/operator/token")
            .or_else(|| str_field(&device, "/tokens/operator/token"))
            .unwrap_or_default();
        let scopes = scopes_field(&device_auth)
            .or_else(|| scopes_field(&device))
            .unwrap_or_default();

        let signing_key = match SigningKey::from_pkcs8_pem(&private_pem) {
            Ok(key) => key,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Device private key unusable, using token auth");
                return None;
            }
        };
        let stored_public = match VerifyingKey::from_public_key_pem(&public_pem) {
            Ok(key) => key,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Device public key unusable, using token auth");
                return None;
            }
        };
        if stored_public != signing_key.verifying_key() {
            warn!(device_id = %device_id, "Device key pair mismatch, using token auth");
            return None;
        }

        let Some(auth) = Self::new(&device_id, signing_key, &token, scopes) else {
            debug!(device_id = %device_id, "Device has no admin operator token");
            return None;
        };

        let descriptor = |key: &str| device.get(key).and_then(Value::as_str).unwrap_or_default();
        let auth = auth.with_client(
            descriptor("clientId"),
            descriptor("clientMode"),
            descriptor("platform"),
        );
        debug!(device_id = %auth.device_id, client_id = %auth.client_id, "Device auth loaded");
        Some(auth)
    }

    /// Sign a UTF-8 payload, returning base64url without padding.
    pub fn sign(&self, payload: &str) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.sign(payload.as_bytes()).to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

fn str_field(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(|s| clean_str(s, 512))
        .filter(|s| !s.is_empty())
}

fn pem_field(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn scopes_field(value: &Value) -> Option<Vec<String>> {
    value
        .pointer("/tokens/operator/scopes")
        .and_then(Value::as_array)
        .map(|scopes| {
            scopes
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
}
