//! Version information for copter-swarm.

/// Crate version from Cargo.toml
pub const SWARM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// copter-swarm version.
    pub swarm: &'static str,
    /// Build identifier stamped in at compile time (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    /// Capability broker the service talks to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            swarm: SWARM_VERSION,
            build: option_env!("SWARM_BUILD_ID").map(str::to_string),
            broker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, broker: String) -> Self {
        self.broker = Some(broker);
        self
    }
}
