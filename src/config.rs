//! Configuration for gateway-bridge
//!
//! CLI arguments and environment variable handling using clap, plus the
//! gateway's own JSON config file (bearer token fallbacks and agent roster).
//! Everything here is supplied by the hosting process; the client only reads it.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default per-call timeout when the caller does not pick one.
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Agent that receives tasks whose assignee does not name a known agent.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Scheduled orchestrator job fired when a task start cannot be delivered.
pub const DEFAULT_ORCHESTRATOR_JOB: &str = "atlas-task-orchestrator-5min";

/// gateway-bridge - RPC client for the orchestration gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "gateway-bridge")]
#[command(about = "Notify the orchestration gateway about task starts and scheduled runs")]
pub struct Args {
    #[command(flatten)]
    pub gateway: GatewayArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the ordered candidate endpoint list
    Candidates,

    /// Start a task on its assignee agent (task JSON from a file, or - for stdin)
    StartTask {
        #[arg(long)]
        task: String,

        /// Log and fall back to an orchestrator run instead of failing
        #[arg(long)]
        best_effort: bool,
    },

    /// Trigger a scheduled orchestrator run
    RunJob {
        #[arg(long, default_value = DEFAULT_ORCHESTRATOR_JOB)]
        job: String,
    },

    /// Issue a raw gateway method call
    Call {
        method: String,

        /// JSON object with method parameters
        #[arg(long, default_value = "{}")]
        params: String,

        /// Wait past an intermediate "accepted" status for the final result
        #[arg(long)]
        expect_final: bool,
    },
}

/// Gateway connection configuration
#[derive(Parser, Debug, Clone)]
pub struct GatewayArgs {
    /// Explicit gateway URL, tried before any discovered or fallback address
    #[arg(long, env = "OPENCLAW_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Bearer token used when no device identity is available
    #[arg(long, env = "OPENCLAW_GATEWAY_TOKEN")]
    pub gateway_token: Option<String>,

    /// Gateway config file (token fallbacks and agent roster)
    #[arg(long, env = "OPENCLAW_CONFIG", default_value = "/data/.openclaw/openclaw.json")]
    pub config_path: PathBuf,

    /// Paired device registry
    #[arg(
        long,
        env = "OPENCLAW_PAIRED_DEVICES",
        default_value = "/data/.openclaw/devices/paired.json"
    )]
    pub paired_devices_path: PathBuf,

    /// Device identity (id and Ed25519 key pair in PEM)
    #[arg(
        long,
        env = "OPENCLAW_DEVICE_IDENTITY",
        default_value = "/data/.openclaw/identity/device.json"
    )]
    pub device_identity_path: PathBuf,

    /// Operator token and scopes issued to this device
    #[arg(
        long,
        env = "OPENCLAW_DEVICE_AUTH",
        default_value = "/data/.openclaw/identity/device-auth.json"
    )]
    pub device_auth_path: PathBuf,

    /// Kernel routing table inspected for the default gateway address
    #[arg(long, env = "GATEWAY_ROUTE_TABLE", default_value = "/proc/net/route")]
    pub route_table_path: PathBuf,

    /// Per-call timeout in milliseconds (covers handshake and request)
    #[arg(long, env = "GATEWAY_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Agent id used for unassigned or unknown assignees
    #[arg(long, env = "GATEWAY_DEFAULT_AGENT", default_value = DEFAULT_AGENT_ID)]
    pub default_agent: String,
}

/// Runtime settings for [`crate::GatewayClient`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub config_path: PathBuf,
    pub paired_devices_path: PathBuf,
    pub device_identity_path: PathBuf,
    pub device_auth_path: PathBuf,
    pub route_table_path: PathBuf,
    pub request_timeout: Duration,
    pub default_agent: String,
    /// Agent names that always map to `default_agent`
    pub default_agent_aliases: Vec<String>,
    pub client_display_name: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            gateway_url: None,
            gateway_token: None,
            config_path: PathBuf::from("/data/.openclaw/openclaw.json"),
            paired_devices_path: PathBuf::from("/data/.openclaw/devices/paired.json"),
            device_identity_path: PathBuf::from("/data/.openclaw/identity/device.json"),
            device_auth_path: PathBuf::from("/data/.openclaw/identity/device-auth.json"),
            route_table_path: PathBuf::from("/proc/net/route"),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            default_agent: DEFAULT_AGENT_ID.to_string(),
            default_agent_aliases: vec!["atlas".to_string(), "main".to_string()],
            client_display_name: "Mission Control Backend".to_string(),
        }
    }
}

impl From<GatewayArgs> for GatewaySettings {
    fn from(args: GatewayArgs) -> Self {
        Self {
            gateway_url: args.gateway_url,
            gateway_token: args.gateway_token,
            config_path: args.config_path,
            paired_devices_path: args.paired_devices_path,
            device_identity_path: args.device_identity_path,
            device_auth_path: args.device_auth_path,
            route_table_path: args.route_table_path,
            request_timeout: Duration::from_millis(args.timeout_ms),
            default_agent: args.default_agent,
            ..Self::default()
        }
    }
}

impl GatewaySettings {
    /// Configured gateway URL, if non-blank.
    pub fn configured_url(&self) -> Option<String> {
        self.gateway_url
            .as_deref()
            .map(|url| clean_str(url, 512))
            .filter(|url| !url.is_empty())
    }

    /// Read the gateway config file. Missing or unreadable files yield an empty config.
    pub fn file_config(&self) -> GatewayFileConfig {
        GatewayFileConfig(read_json_file(&self.config_path).unwrap_or(Value::Null))
    }

    /// Bearer token: explicit setting first, then `gateway.auth.token`, then `proxy.auth.token`.
    pub fn resolve_gateway_token(&self, file: &GatewayFileConfig) -> Option<String> {
        self.gateway_token
            .as_deref()
            .map(|t| clean_str(t, 512))
            .filter(|t| !t.is_empty())
            .or_else(|| file.string_at("/gateway/auth/token"))
            .or_else(|| file.string_at("/proxy/auth/token"))
    }
}

/// The gateway's JSON config file, read leniently.
#[derive(Debug, Clone, Default)]
pub struct GatewayFileConfig(Value);

impl GatewayFileConfig {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    fn string_at(&self, pointer: &str) -> Option<String> {
        self.0
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(|s| clean_str(s, 512))
            .filter(|s| !s.is_empty())
    }

    /// Agents listed under `agents.list`. Entries without an id are skipped.
    pub fn roster(&self) -> AgentRoster {
        let agents = self
            .0
            .pointer("/agents/list")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|entry| {
                        let id = entry.get("id").and_then(Value::as_str)?.trim();
                        if id.is_empty() {
                            return None;
                        }
                        Some(AgentEntry {
                            id: id.to_string(),
                            name: entry
                                .get("name")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        AgentRoster { agents }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEntry {
    pub id: String,
    pub name: Option<String>,
}

/// Configured agents, used to map human-entered assignee names to agent ids.
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    pub agents: Vec<AgentEntry>,
}

impl AgentRoster {
    pub fn new(agents: Vec<AgentEntry>) -> Self {
        Self { agents }
    }
}

/// Trim and cap a free-form string at `max` characters.
pub(crate) fn clean_str(value: &str, max: usize) -> String {
    value.trim().chars().take(max).collect()
}

/// Read and parse a JSON file, treating absence or bad content as "not there".
pub(crate) fn read_json_file(path: &Path) -> Option<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "JSON file not readable");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "JSON file not parseable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_default() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.request_timeout, Duration::from_secs(15));
        assert_eq!(settings.default_agent, "main");
        assert_eq!(settings.route_table_path, PathBuf::from("/proc/net/route"));
        assert!(settings.configured_url().is_none());
    }

    #[test]
    fn test_args_parse_with_subcommand() {
        let args = Args::try_parse_from([
            "gateway-bridge",
            "--gateway-url",
            "ws://10.0.0.5:47100",
            "--timeout-ms",
            "500",
            "run-job",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::RunJob { ref job } if job == DEFAULT_ORCHESTRATOR_JOB));

        let settings = GatewaySettings::from(args.gateway);
        assert_eq!(settings.configured_url().as_deref(), Some("ws://10.0.0.5:47100"));
        assert_eq!(settings.request_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_gateway_token_precedence() {
        let file = GatewayFileConfig::from_value(json!({
            "gateway": { "auth": { "token": " from-gateway " } },
            "proxy": { "auth": { "token": "from-proxy" } }
        }));

        let mut settings = GatewaySettings::default();
        assert_eq!(settings.resolve_gateway_token(&file).as_deref(), Some("from-gateway"));

        settings.gateway_token = Some("explicit".into());
        assert_eq!(settings.resolve_gateway_token(&file).as_deref(), Some("explicit"));

        settings.gateway_token = Some("   ".into());
        let proxy_only = GatewayFileConfig::from_value(json!({
            "proxy": { "auth": { "token": "from-proxy" } }
        }));
        assert_eq!(settings.resolve_gateway_token(&proxy_only).as_deref(), Some("from-proxy"));
        assert!(settings.resolve_gateway_token(&GatewayFileConfig::default()).is_none());
    }

    #[test]
    fn test_roster_skips_entries_without_id() {
        let file = GatewayFileConfig::from_value(json!({
            "agents": { "list": [
                { "id": "scout", "name": "Scout Bot" },
                { "name": "nameless" },
                "garbage",
                { "id": "forge" }
            ]}
        }));
        let roster = file.roster();
        assert_eq!(roster.agents.len(), 2);
        assert_eq!(roster.agents[0].name.as_deref(), Some("Scout Bot"));
        assert_eq!(roster.agents[1].id, "forge");
    }

    #[test]
    fn test_missing_config_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = GatewaySettings {
            config_path: dir.path().join("absent.json"),
            ..GatewaySettings::default()
        };
        assert!(settings.file_config().roster().agents.is_empty());

        std::fs::write(&settings.config_path, "{ not json").unwrap();
        assert!(settings.file_config().roster().agents.is_empty());
    }

    #[test]
    fn test_clean_str_trims_and_caps() {
        assert_eq!(clean_str("  abc  ", 512), "abc");
        assert_eq!(clean_str("abcdef", 3), "abc");
    }
}
