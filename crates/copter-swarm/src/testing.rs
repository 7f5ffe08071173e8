//! In-memory broker used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use crate::device::{Device, Requirements};
use crate::remote::{DeviceClient, Provisioner, RemoteError, ops};

pub(crate) const COPTER_KIND: &str = "VirtualCopter";
pub(crate) const STATION_KIND: &str = "ChargingStation";

pub(crate) struct FakeFleet {
    batteries: Mutex<HashMap<String, f64>>,
    canned: Mutex<HashMap<(String, String), Value>>,
    stalled: Mutex<HashSet<(String, String)>>,
    failing: Mutex<HashSet<(String, String)>>,
    calls: Mutex<Vec<(String, String, Value)>>,
    fail_charges: AtomicBool,
    charge_gate: Semaphore,
    charges_started: AtomicUsize,
    unit_requests: AtomicUsize,
    station_requests: AtomicUsize,
    unit_limit: Mutex<Option<usize>>,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(Semaphore::MAX_PERMITS))
    }

    /// Charges block until released with [`FakeFleet::release_charges`].
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(0))
    }

    fn build(charge_permits: usize) -> Self {
        Self {
            batteries: Mutex::new(HashMap::new()),
            canned: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            fail_charges: AtomicBool::new(false),
            charge_gate: Semaphore::new(charge_permits),
            charges_started: AtomicUsize::new(0),
            unit_requests: AtomicUsize::new(0),
            station_requests: AtomicUsize::new(0),
            unit_limit: Mutex::new(None),
        }
    }

    pub fn copter(&self, id: &str) -> Device {
        Device::new(id, Requirements::new(COPTER_KIND))
    }

    pub fn station(&self, index: usize) -> Device {
        Device::new(
            format!("station-{index}"),
            Requirements::new(STATION_KIND),
        )
    }

    pub fn set_battery(&self, id: &str, level: f64) {
        self.batteries
            .lock()
            .unwrap()
            .insert(id.to_string(), level);
    }

    pub fn respond_with(&self, id: &str, operation: &str, value: Value) {
        self.canned
            .lock()
            .unwrap()
            .insert((id.to_string(), operation.to_string()), value);
    }

    pub fn stall(&self, id: &str, operation: &str) {
        self.stalled
            .lock()
            .unwrap()
            .insert((id.to_string(), operation.to_string()));
    }

    pub fn fail(&self, id: &str, operation: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((id.to_string(), operation.to_string()));
    }

    pub fn fail_charges(&self, fail: bool) {
        self.fail_charges.store(fail, Ordering::SeqCst);
    }

    pub fn release_charges(&self, n: usize) {
        self.charge_gate.add_permits(n);
    }

    pub fn limit_units(&self, n: usize) {
        *self.unit_limit.lock().unwrap() = Some(n);
    }

    pub fn charges_started(&self) -> usize {
        self.charges_started.load(Ordering::SeqCst)
    }

    pub fn unit_requests(&self) -> usize {
        self.unit_requests.load(Ordering::SeqCst)
    }

    pub fn station_requests(&self) -> usize {
        self.station_requests.load(Ordering::SeqCst)
    }

    /// Calls made against one unit, as `(operation, args)`.
    pub fn calls_to(&self, id: &str) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(device, _, _)| device == id)
            .map(|(_, op, args)| (op.clone(), args.clone()))
            .collect()
    }

    /// Wait until `n` charges have reached the station.
    pub async fn wait_for_charges(&self, n: usize) {
        while self.charges_started() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl DeviceClient for FakeFleet {
    async fn invoke(
        &self,
        device: &Device,
        operation: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        let key = (device.external_id.clone(), operation.to_string());
        self.calls.lock().unwrap().push((
            device.external_id.clone(),
            operation.to_string(),
            args,
        ));

        if self.stalled.lock().unwrap().contains(&key) {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(&key) {
            return Err(RemoteError::failed(operation, "unit unreachable"));
        }
        if let Some(value) = self.canned.lock().unwrap().get(&key) {
            return Ok(value.clone());
        }

        match operation {
            ops::GET_BATTERY_CHARGE_LEVEL => {
                let level = self
                    .batteries
                    .lock()
                    .unwrap()
                    .get(&device.external_id)
                    .copied()
                    .unwrap_or(100.0);
                Ok(json!({ "level": level }))
            }
            ops::GET_POSITION => Ok(json!({ "x": 1.0, "y": 2.0, "z": 0.0 })),
            ops::SET_POSITION => Ok(Value::Null),
            ops::CHARGE_DEVICE => {
                self.charges_started.fetch_add(1, Ordering::SeqCst);
                if let Ok(permit) = self.charge_gate.acquire().await {
                    permit.forget();
                }
                if self.fail_charges.load(Ordering::SeqCst) {
                    Err(RemoteError::failed(operation, "station fault"))
                } else {
                    Ok(Value::Null)
                }
            }
            other => Err(RemoteError::failed(other, "unsupported operation")),
        }
    }
}

#[async_trait]
impl Provisioner for FakeFleet {
    async fn request_unit(&self, kind: &str, index: Option<usize>) -> Result<Device, RemoteError> {
        if kind == STATION_KIND {
            self.station_requests.fetch_add(1, Ordering::SeqCst);
            return Ok(self.station(index.unwrap_or(0)));
        }

        let issued = self.unit_requests.load(Ordering::SeqCst);
        if let Some(limit) = *self.unit_limit.lock().unwrap()
            && issued >= limit
        {
            return Err(RemoteError::failed(ops::REQUEST_UNIT, "no unit available"));
        }
        let n = self.unit_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.copter(&format!("copter-{n}")))
    }
}
