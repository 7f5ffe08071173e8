//! Contracts for the external collaborators the swarm talks to.
//!
//! The broker owns the wire format. The swarm only needs two things from it:
//! - [`Provisioner`]: hand out a new unit of a given kind
//! - [`DeviceClient`]: invoke a named operation on a unit
//!
//! [`Remote`] bundles both with the timeout policy and the typed operations
//! the pool and the maintenance loop use.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::device::Device;

/// Remote operation names understood by copters and charging stations.
pub mod ops {
    pub const GET_BATTERY_CHARGE_LEVEL: &str = "GetBatteryChargeLevel";
    pub const GET_POSITION: &str = "GetPosition";
    pub const SET_POSITION: &str = "SetPosition";
    pub const CHARGE_DEVICE: &str = "ChargeDevice";
    pub const REQUEST_UNIT: &str = "RequestUnit";
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("{operation} timed out")]
    Timeout { operation: String },
    #[error("{operation} failed: {message}")]
    Failed { operation: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected {operation} response: {message}")]
    Decode { operation: String, message: String },
}

impl RemoteError {
    pub fn failed(operation: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn decode(operation: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Invokes operations on remote units.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn invoke(&self, device: &Device, operation: &str, args: Value)
    -> Result<Value, RemoteError>;
}

/// Hands out new units.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request a unit of `kind`. `index` pins a specific well-known unit.
    async fn request_unit(&self, kind: &str, index: Option<usize>) -> Result<Device, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct BatteryLevel {
    #[serde(alias = "float", alias = "BatteryChargeLevel")]
    level: f64,
}

/// Collaborator handles plus the timeout applied to blocking calls.
#[derive(Clone)]
pub struct Remote {
    devices: Arc<dyn DeviceClient>,
    provisioner: Arc<dyn Provisioner>,
    timeout: Duration,
}

impl Remote {
    pub fn new(
        devices: Arc<dyn DeviceClient>,
        provisioner: Arc<dyn Provisioner>,
        timeout: Duration,
    ) -> Self {
        Self {
            devices,
            provisioner,
            timeout,
        }
    }

    pub async fn request_unit(&self, kind: &str, index: Option<usize>) -> Result<Device, RemoteError> {
        bounded(
            ops::REQUEST_UNIT,
            self.timeout,
            self.provisioner.request_unit(kind, index),
        )
        .await
    }

    /// Invoke an operation and wait for its result.
    pub async fn invoke(
        &self,
        device: &Device,
        operation: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        bounded(
            operation,
            self.timeout,
            self.devices.invoke(device, operation, args),
        )
        .await
    }

    /// Invoke an operation without waiting for it.
    ///
    /// `on_complete` runs exactly once on a runtime task, with either the
    /// result or the error. No timeout applies; long-running operations such
    /// as charging report whenever the unit is done.
    pub fn invoke_detached<F>(
        &self,
        device: Device,
        operation: &'static str,
        args: Value,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Value, RemoteError>) + Send + 'static,
    {
        let devices = Arc::clone(&self.devices);
        tokio::spawn(async move {
            let result = devices.invoke(&device, operation, args).await;
            on_complete(result);
        })
    }

    /// Current battery charge in percent.
    pub async fn battery_level(&self, device: &Device) -> Result<f64, RemoteError> {
        let value = self
            .invoke(device, ops::GET_BATTERY_CHARGE_LEVEL, json!({}))
            .await?;
        let parsed: BatteryLevel = serde_json::from_value(value)
            .map_err(|e| RemoteError::decode(ops::GET_BATTERY_CHARGE_LEVEL, e.to_string()))?;
        if !parsed.level.is_finite() {
            return Err(RemoteError::decode(
                ops::GET_BATTERY_CHARGE_LEVEL,
                "level is not a finite number",
            ));
        }
        Ok(parsed.level)
    }

    /// Position payload of a unit. Opaque to the swarm.
    pub async fn position(&self, device: &Device) -> Result<Value, RemoteError> {
        self.invoke(device, ops::GET_POSITION, json!({})).await
    }

    pub async fn set_position(&self, device: &Device, position: Value) -> Result<(), RemoteError> {
        self.invoke(device, ops::SET_POSITION, position).await?;
        Ok(())
    }
}

async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            operation: operation.to_string(),
        }),
    }
}
