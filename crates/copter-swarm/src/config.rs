//! Service configuration: defaults overridden by `SWARM_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Which unit kinds the broker is asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitKinds {
    pub copter: String,
    pub station: String,
    /// Index of the well-known charging station.
    pub station_index: usize,
}

impl Default for UnitKinds {
    fn default() -> Self {
        Self {
            copter: "VirtualCopter".to_string(),
            station: "ChargingStation".to_string(),
            station_index: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub kinds: UnitKinds,
    /// Battery percentage below which a copter is sent to charge.
    pub battery_threshold: f64,
    pub maintenance_interval: Duration,
    /// Upper bound for blocking remote calls.
    pub remote_timeout: Duration,
    /// Bootstrap to this many copters at start.
    pub initial_swarm_size: Option<usize>,
    pub broker_url: String,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            kinds: UnitKinds::default(),
            battery_threshold: 25.0,
            maintenance_interval: Duration::from_secs(2),
            remote_timeout: Duration::from_secs(10),
            initial_swarm_size: None,
            broker_url: "http://127.0.0.1:9999".to_string(),
        }
    }
}

impl SwarmConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            kinds: UnitKinds {
                copter: lookup("SWARM_COPTER_KIND").unwrap_or(defaults.kinds.copter),
                station: lookup("SWARM_STATION_KIND").unwrap_or(defaults.kinds.station),
                station_index: parsed(
                    &lookup,
                    "SWARM_STATION_INDEX",
                    defaults.kinds.station_index,
                ),
            },
            battery_threshold: parsed(
                &lookup,
                "SWARM_BATTERY_THRESHOLD",
                defaults.battery_threshold,
            ),
            maintenance_interval: seconds(
                &lookup,
                "SWARM_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            ),
            remote_timeout: seconds(&lookup, "SWARM_REMOTE_TIMEOUT_SECS", defaults.remote_timeout),
            initial_swarm_size: lookup("SWARM_INITIAL_SIZE").and_then(|raw| {
                raw.parse()
                    .inspect_err(|_| {
                        tracing::warn!(value = %raw, "Ignoring invalid SWARM_INITIAL_SIZE");
                    })
                    .ok()
            }),
            broker_url: lookup("SWARM_BROKER_URL").unwrap_or(defaults.broker_url),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            default
        }),
        None => default,
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match lookup(key).map(|raw| (raw.parse::<f64>(), raw)) {
        Some((Ok(secs), _)) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Some((_, raw)) => {
            tracing::warn!(key, value = %raw, "Invalid duration, using default");
            default
        }
        None => default,
    }
}
