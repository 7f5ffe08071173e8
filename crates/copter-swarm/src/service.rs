//! SwarmService: transport-agnostic front door to the swarm.
//!
//! This service owns:
//! - The registry (pool state, charging station)
//! - The collaborator handles used for provisioning
//! - Shutdown coordination (the running flag checkout waits on)
//!
//! Transports hand it a named operation plus an argument bag and get back a
//! result bag or a typed error.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::UnitKinds;
use crate::device::{self, Device};
use crate::registry::{SwarmError, SwarmRegistry, SwarmSnapshot};
use crate::remote::Remote;
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("invalid arguments for {operation}: {message}")]
    InvalidArguments {
        operation: &'static str,
        message: String,
    },
    #[error(transparent)]
    Swarm(#[from] SwarmError),
}

impl ServiceError {
    /// Stable name for the error, reported to callers next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::UnknownOperation(_) => "UnknownOperation",
            ServiceError::InvalidArguments { .. } => "InvalidArguments",
            ServiceError::Swarm(SwarmError::EmptyPool) => "EmptyPool",
            ServiceError::Swarm(SwarmError::Unavailable) => "Unavailable",
            ServiceError::Swarm(SwarmError::UnknownDevice(_)) => "UnknownDevice",
            ServiceError::Swarm(SwarmError::Remote(_)) => "RemoteOperationFailure",
        }
    }
}

/// Operations callers can invoke by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddSlot,
    Checkout,
    CheckIn,
    Bootstrap,
    Status,
}

impl Operation {
    /// Parse a canonical name or one of the legacy aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "AddSlot" | "AddCopter" => Some(Self::AddSlot),
            "Checkout" | "GetAvailableCopter" => Some(Self::Checkout),
            "CheckIn" | "FreeCopter" => Some(Self::CheckIn),
            "Bootstrap" | "InitializeSwarm" => Some(Self::Bootstrap),
            "Status" => Some(Self::Status),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddSlot => "AddSlot",
            Self::Checkout => "Checkout",
            Self::CheckIn => "CheckIn",
            Self::Bootstrap => "Bootstrap",
            Self::Status => "Status",
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceArgs {
    #[serde(
        rename = "Device",
        alias = "device",
        deserialize_with = "device::deserialize_payload"
    )]
    device: Device,
}

#[derive(Debug, Deserialize)]
struct BootstrapArgs {
    #[serde(rename = "int", alias = "count")]
    count: usize,
}

/// Overall service state reported by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwarmStatus {
    /// Not bootstrapped yet
    Starting,
    /// Bootstrapped with at least one free copter
    Ready,
    /// Bootstrapped but every copter is borrowed or charging
    Busy,
    /// Shutdown requested
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: SwarmStatus,
    pub swarm: SwarmSnapshot,
    pub version: VersionInfo,
}

pub struct SwarmService {
    registry: Arc<SwarmRegistry>,
    remote: Remote,
    kinds: UnitKinds,
    shutdown: CancellationToken,
    version: VersionInfo,
}

impl SwarmService {
    pub fn new(remote: Remote, kinds: UnitKinds) -> Self {
        Self {
            registry: Arc::new(SwarmRegistry::new()),
            remote,
            kinds,
            shutdown: CancellationToken::new(),
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn registry(&self) -> &Arc<SwarmRegistry> {
        &self.registry
    }

    /// Token fired when the service stops. Checkout waiters observe it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn trigger_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Swarm shutdown requested");
            self.shutdown.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn add_slot(&self, device: Device) -> Vec<Device> {
        self.registry.register(device);
        self.registry.devices()
    }

    pub async fn checkout(&self) -> Result<Device, SwarmError> {
        self.registry.checkout(&self.shutdown).await
    }

    pub fn check_in(&self, device: &Device) -> Result<Device, SwarmError> {
        self.registry.check_in(device)
    }

    pub async fn bootstrap(&self, target: usize) -> Result<Vec<Device>, SwarmError> {
        self.registry
            .bootstrap(&self.remote, &self.kinds, target)
            .await?;
        Ok(self.registry.devices())
    }

    pub fn health(&self) -> HealthSnapshot {
        let swarm = self.registry.snapshot();
        let status = if !self.is_running() {
            SwarmStatus::Stopping
        } else if !swarm.bootstrapped {
            SwarmStatus::Starting
        } else if swarm.available == 0 {
            SwarmStatus::Busy
        } else {
            SwarmStatus::Ready
        };
        HealthSnapshot {
            status,
            swarm,
            version: self.version.clone(),
        }
    }

    /// Dispatch a named operation with a JSON argument bag.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ServiceError> {
        let operation =
            Operation::parse(name).ok_or_else(|| ServiceError::UnknownOperation(name.to_string()))?;
        tracing::debug!(operation = operation.as_str(), "Invoking operation");

        match operation {
            Operation::AddSlot => {
                let DeviceArgs { device } = parse_args(operation, args)?;
                Ok(json!({ "DeviceList": self.add_slot(device) }))
            }
            Operation::Checkout => {
                let device = self.checkout().await?;
                Ok(json!({ "Device": device }))
            }
            Operation::CheckIn => {
                let DeviceArgs { device } = parse_args(operation, args)?;
                let device = self.check_in(&device)?;
                Ok(json!({ "Device": device }))
            }
            Operation::Bootstrap => {
                let BootstrapArgs { count } = parse_args(operation, args)?;
                Ok(json!({ "DeviceList": self.bootstrap(count).await? }))
            }
            Operation::Status => Ok(json!(self.registry.snapshot())),
        }
    }
}

fn parse_args<T: DeserializeOwned>(
    operation: Operation,
    args: Value,
) -> Result<T, ServiceError> {
    serde_json::from_value(args).map_err(|e| ServiceError::InvalidArguments {
        operation: operation.as_str(),
        message: e.to_string(),
    })
}
