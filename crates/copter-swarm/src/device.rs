//! Device references handed out by the capability broker.
//!
//! A [`Device`] is an opaque handle to one remote unit. Two references denote
//! the same unit iff their [`DeviceIdentity`] compares equal; copies that went
//! through a serialization round-trip (as every check-in does) must still match
//! the reference stored in the registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Capability requirements advertised by a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Capability kind the unit provides, e.g. `VirtualCopter`.
    pub capability: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Requirements {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Reference to a remote unit (copter or charging station).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub external_id: String,
    pub requirements: Requirements,
    /// Broker-side address of the unit. Not part of identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Broker metadata we carry through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    pub fn new(external_id: impl Into<String>, requirements: Requirements) -> Self {
        Self {
            external_id: external_id.into(),
            requirements,
            uri: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            external_id: self.external_id.clone(),
            requirements: self.requirements.clone(),
        }
    }

    /// True if both references denote the same unit.
    pub fn is_same_unit(&self, other: &Device) -> bool {
        self.external_id == other.external_id && self.requirements == other.requirements
    }
}

/// The fields that decide whether two references denote the same unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub external_id: String,
    pub requirements: Requirements,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.external_id, self.requirements.capability)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DevicePayload {
    Inline(Device),
    Encoded(String),
}

/// Accepts a device either as a JSON object or as a JSON-encoded string.
///
/// Callers of the swarm frequently pass back the string form they received.
pub fn deserialize_payload<'de, D>(deserializer: D) -> Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    match DevicePayload::deserialize(deserializer)? {
        DevicePayload::Inline(device) => Ok(device),
        DevicePayload::Encoded(raw) => serde_json::from_str(&raw).map_err(D::Error::custom),
    }
}
