//! copter-swarm: pool manager for interchangeable copters.
//!
//! Callers borrow one copter at a time ([`SwarmService::checkout`]) and hand
//! it back ([`SwarmService::check_in`]). A background loop
//! ([`maintenance`]) watches battery levels and routes weak copters through
//! the shared charging station without handing them out meanwhile.

mod version;

pub mod broker;
pub mod config;
pub mod device;
pub mod maintenance;
pub mod registry;
pub mod remote;
pub mod service;
pub mod slot;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broker::HttpBroker;
pub use config::{SwarmConfig, UnitKinds};
pub use device::{Device, DeviceIdentity, Requirements};
pub use maintenance::{CompletionHandler, CycleReport, MaintenanceTasks, Maintainer};
pub use registry::{SwarmError, SwarmRegistry, SwarmSnapshot};
pub use remote::{DeviceClient, Provisioner, Remote, RemoteError};
pub use service::{HealthSnapshot, Operation, ServiceError, SwarmService, SwarmStatus};
pub use slot::{ClaimRefused, DeviceSlot, MaintenanceClaim, SlotState};
pub use version::{SWARM_VERSION, VersionInfo};
