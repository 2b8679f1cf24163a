use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HuddleConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// STUN endpoints handed to peers for connectivity checks. No TURN relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
}

/// Client-side peer lifecycle knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Upper bound on simultaneous peer connections; oldest-first eviction
    /// beyond this.
    #[serde(default = "default_max_peer_connections")]
    pub max_peer_connections: usize,
    /// Period of the stale-connection sweep
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Age past which a disconnected/failed peer is swept
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Debounce applied to negotiation-needed bursts
    #[serde(default = "default_negotiation_debounce_ms")]
    pub negotiation_debounce_ms: u64,
    /// Grace period before a disconnected peer is torn down
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,
    /// Delay before re-initiating a removed peer
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Settle time between tearing peers down and rebuilding them on a
    /// local-stream swap
    #[serde(default = "default_stream_swap_delay_ms")]
    pub stream_swap_delay_ms: u64,
}

/// Transport keepalive. Missed pongs terminate the socket, which triggers
/// the registry disconnect sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peer_connections: default_max_peer_connections(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            negotiation_debounce_ms: default_negotiation_debounce_ms(),
            disconnect_grace_secs: default_disconnect_grace_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            stream_swap_delay_ms: default_stream_swap_delay_ms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

impl PeerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn negotiation_debounce(&self) -> Duration {
        Duration::from_millis(self.negotiation_debounce_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn stream_swap_delay(&self) -> Duration {
        Duration::from_millis(self.stream_swap_delay_ms)
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl HuddleConfig {
    /// Semantic checks beyond what serde enforces. Returns a list of
    /// `WARN:`/`ERROR:` strings; the caller decides how loud to be.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.peer.max_peer_connections == 0 {
            issues.push("ERROR: peer.max_peer_connections must be at least 1".to_string());
        }
        if self.heartbeat.ping_timeout_secs <= self.heartbeat.ping_interval_secs {
            issues.push(
                "ERROR: heartbeat.ping_timeout_secs must exceed ping_interval_secs".to_string(),
            );
        }
        if self.ice.stun_urls.is_empty() {
            issues.push(
                "WARN: ice.stun_urls is empty; peers behind NAT will not connect".to_string(),
            );
        }
        if self.peer.stale_threshold_secs < self.peer.cleanup_interval_secs {
            issues.push(
                "WARN: peer.stale_threshold_secs is shorter than the cleanup interval; \
                 peers may be swept on their first sweep"
                    .to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_max_peer_connections() -> usize {
    10
}
fn default_cleanup_interval_secs() -> u64 {
    30
}
fn default_stale_threshold_secs() -> u64 {
    60
}
fn default_negotiation_debounce_ms() -> u64 {
    300
}
fn default_disconnect_grace_secs() -> u64 {
    5
}
fn default_reconnect_delay_secs() -> u64 {
    2
}
fn default_stream_swap_delay_ms() -> u64 {
    500
}
fn default_ping_interval_secs() -> u64 {
    25
}
fn default_ping_timeout_secs() -> u64 {
    60
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
