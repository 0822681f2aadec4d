//! Persisted rule rows. Every worker is parameterized by one of these.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a rule's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum RuleStatus {
    Stopped,
    Starting,
    Running,
    Error(String),
}

impl Default for RuleStatus {
    fn default() -> Self {
        RuleStatus::Stopped
    }
}

/// What a port-forward rule listens as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenKind {
    Tcp,
    Udp,
    Http,
    Https,
    Ws,
    Socks5,
}

impl Default for ListenKind {
    fn default() -> Self {
        ListenKind::Tcp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Tcp,
    Udp,
    Http,
    Https,
}

impl Default for TargetKind {
    fn default() -> Self {
        TargetKind::Tcp
    }
}

fn default_max_conns() -> u32 {
    256
}

fn default_udp_packet_size() -> usize {
    1500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    pub listen_port: u16,
    #[serde(default)]
    pub listen_kind: ListenKind,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub target_kind: TargetKind,
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    #[serde(default = "default_udp_packet_size")]
    pub udp_packet_size: usize,
    /// PEM cert/key paths, required when `listen_kind` is `https`.
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,

    // runtime telemetry
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub traffic_in: u64,
    #[serde(default)]
    pub traffic_out: u64,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

impl PortForwardRule {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    Proxy,
    Direct,
}

impl Default for ForwardMode {
    fn default() -> Self {
        ForwardMode::Proxy
    }
}

/// Refined penetration state while a STUN rule is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StunStatus {
    Penetrating,
    Timeout,
    Failed,
}

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunRule {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub forward_mode: ForwardMode,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    /// "tcp" or "udp", selects the UPnP mapping protocol.
    #[serde(default = "default_target_proto")]
    pub target_proto: String,
    #[serde(default)]
    pub stun_server: String,
    #[serde(default)]
    pub use_upnp: bool,
    #[serde(default)]
    pub use_natmap: bool,
    /// Skip NAT classification, run the bare Binding Request only.
    #[serde(default)]
    pub disable_validation: bool,
    #[serde(default)]
    pub callback_task_id: u64,

    // runtime telemetry
    #[serde(default)]
    pub current_ip: String,
    #[serde(default)]
    pub current_port: u16,
    #[serde(default)]
    pub nat_type: String,
    #[serde(default)]
    pub stun_status: Option<StunStatus>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub last_error: String,
}

fn default_target_proto() -> String {
    "tcp".to_string()
}

impl StunRule {
    pub fn stun_server_or_default(&self) -> &str {
        if self.stun_server.is_empty() {
            DEFAULT_STUN_SERVER
        } else {
            &self.stun_server
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpFamily {
    V4,
    V6,
}

impl Default for IpFamily {
    fn default() -> Self {
        IpFamily::V4
    }
}

impl IpFamily {
    pub fn record_type(&self) -> &'static str {
        match self {
            IpFamily::V4 => "A",
            IpFamily::V6 => "AAAA",
        }
    }
}

/// Where a DDNS task reads its current IP from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IpSource {
    /// Probe each URL in order, extract the first IP-looking match.
    Url { urls: Vec<String> },
    /// First non-loopback, non-link-local address of the named interface.
    Interface { name: String },
    /// Fixed value, stored verbatim.
    Custom { ip: String },
}

impl Default for IpSource {
    fn default() -> Self {
        IpSource::Url { urls: Vec::new() }
    }
}

/// Optional notification fired after a successful DDNS cycle.
/// `{ip}`, `{domain}` and `{type}` expand in both URL and body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub body: String,
}

fn default_interval() -> u64 {
    300
}

fn default_ttl() -> u32 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdnsTask {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub family: IpFamily,
    #[serde(default)]
    pub provider: String,
    /// Linked credential row; 0 means the task carries its own credentials.
    #[serde(default)]
    pub account_id: u64,
    #[serde(default)]
    pub access_id: String,
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ip_source: IpSource,
    #[serde(default)]
    pub ip_regex: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,

    // runtime telemetry
    #[serde(default)]
    pub current_ip: String,
    #[serde(default)]
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub last_error: String,
}

impl DdnsTask {
    /// Effective check interval: clamped to at least 30 s, defaulting to
    /// 300 s when unset.
    pub fn effective_interval(&self) -> std::time::Duration {
        let secs = if self.interval_secs == 0 {
            300
        } else {
            self.interval_secs.max(30)
        };
        std::time::Duration::from_secs(secs)
    }
}

/// DNS provider credential row a DDNS task may link to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsAccount {
    pub id: u64,
    pub name: String,
    pub provider: String,
    pub access_id: String,
    pub access_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdnsHistory {
    pub id: u64,
    pub task_id: u64,
    pub old_ip: String,
    pub new_ip: String,
    pub domain: String,
    pub provider: String,
    pub success: bool,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackTask {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    /// Matched against an event's trigger type: "stun" / "frp" / "easytier".
    pub trigger_type: String,
    /// 0 matches every source; anything else must equal the event's source.
    #[serde(default)]
    pub trigger_source_id: u64,
    pub account_id: u64,
    #[serde(default)]
    pub last_trigger_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackAccount {
    pub id: u64,
    pub name: String,
    /// "webhook" / "cf_origin" / "ali_esa" / "tencent_eo"
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}
