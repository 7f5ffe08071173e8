//! SwarmRegistry - the authoritative set of pooled copters.
//!
//! Slots are only ever appended; an index, once handed out, names the same
//! slot for the lifetime of the process. Readers take a snapshot of the slot
//! list under a short read lock and then work on the per-slot atomics, so
//! checkout scans never block bootstrap appends for longer than a clone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::config::UnitKinds;
use crate::device::{Device, DeviceIdentity};
use crate::remote::{Remote, RemoteError};
use crate::slot::{ClaimRefused, DeviceSlot, MaintenanceClaim, SlotState};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SwarmError {
    #[error("no units available: the swarm is empty")]
    EmptyPool,
    #[error("no unit obtained: the swarm is shutting down")]
    Unavailable,
    #[error("device not found: {0}")]
    UnknownDevice(DeviceIdentity),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Point-in-time view of the pool for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwarmSnapshot {
    pub total: usize,
    pub available: usize,
    pub checked_out: usize,
    pub in_maintenance: usize,
    pub bootstrapped: bool,
    pub maintenance_failures: usize,
}

pub struct SwarmRegistry {
    slots: RwLock<Vec<Arc<DeviceSlot>>>,
    /// Woken whenever a slot may have become free.
    released: Arc<Notify>,
    station: OnceCell<Device>,
    bootstrapped: AtomicBool,
    bootstrap_lock: Mutex<()>,
    maintenance_failures: AtomicUsize,
}

impl Default for SwarmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            released: Arc::new(Notify::new()),
            station: OnceCell::new(),
            bootstrapped: AtomicBool::new(false),
            bootstrap_lock: Mutex::new(()),
            maintenance_failures: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the slot list. Slots appended afterwards are not included.
    pub fn slots(&self) -> Vec<Arc<DeviceSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn devices(&self) -> Vec<Device> {
        self.slots().iter().map(|s| s.device().clone()).collect()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// The charging station, once bootstrap has resolved it.
    pub fn station(&self) -> Option<&Device> {
        self.station.get()
    }

    /// Append a slot for `device`, both locks free. Returns its index.
    ///
    /// No uniqueness check: registering the same unit twice yields two slots.
    pub fn register(&self, device: Device) -> usize {
        let index = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let index = slots.len();
            slots.push(Arc::new(DeviceSlot::new(index, device)));
            index
        };
        tracing::info!(slot = index, "Registered copter");
        self.released.notify_waiters();
        index
    }

    /// Populate the pool up to `target` slots.
    ///
    /// Resolves the charging station on first call. Only the delta above the
    /// current size is provisioned. A provisioning failure leaves the slots
    /// added so far in place.
    pub async fn bootstrap(
        &self,
        remote: &Remote,
        kinds: &UnitKinds,
        target: usize,
    ) -> Result<(), SwarmError> {
        let _serialized = self.bootstrap_lock.lock().await;

        let station = self
            .station
            .get_or_try_init(|| remote.request_unit(&kinds.station, Some(kinds.station_index)))
            .await?;
        tracing::debug!(station = %station.identity(), "Charging station resolved");

        while self.len() < target {
            let device = remote.request_unit(&kinds.copter, None).await.map_err(|e| {
                tracing::error!(error = %e, have = self.len(), target, "Provisioning failed");
                e
            })?;
            self.register(device);
        }

        if !self.bootstrapped.swap(true, Ordering::AcqRel) {
            tracing::info!(slots = self.len(), "Swarm bootstrapped");
        }
        Ok(())
    }

    /// Borrow the lowest-index free copter, waiting until one frees up.
    ///
    /// Fails with [`SwarmError::EmptyPool`] right away if nothing is
    /// registered, and with [`SwarmError::Unavailable`] once `shutdown` fires.
    /// Waiters are not served in arrival order.
    pub async fn checkout(&self, shutdown: &CancellationToken) -> Result<Device, SwarmError> {
        loop {
            // Register interest before scanning so a release between the scan
            // and the wait is not lost.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let slots = self.slots();
            if slots.is_empty() {
                return Err(SwarmError::EmptyPool);
            }
            if shutdown.is_cancelled() {
                return Err(SwarmError::Unavailable);
            }

            if let Some(slot) = slots.iter().find(|s| s.try_acquire()) {
                tracing::debug!(slot = slot.index(), device = %slot.device().external_id, "Checked out");
                return Ok(slot.device().clone());
            }

            tokio::select! {
                _ = &mut released => {}
                _ = shutdown.cancelled() => return Err(SwarmError::Unavailable),
            }
        }
    }

    /// Non-blocking checkout. `None` if every slot is taken or none exist.
    pub fn try_checkout(&self) -> Option<Device> {
        self.slots()
            .iter()
            .find(|s| s.try_acquire())
            .map(|s| s.device().clone())
    }

    /// Return a borrowed copter, matched by identity.
    ///
    /// Releasing an already-free slot succeeds. A slot held by the
    /// maintenance loop is left alone; it returns to the pool when its charge
    /// completes.
    pub fn check_in(&self, device: &Device) -> Result<Device, SwarmError> {
        let slots = self.slots();
        let mut matching = slots.iter().filter(|s| s.device().is_same_unit(device));
        let Some(first) = matching.next() else {
            tracing::warn!(device = %device.identity(), "Check-in for unknown device");
            return Err(SwarmError::UnknownDevice(device.identity()));
        };

        // With duplicate registrations, prefer the copy a caller actually holds.
        let slot = std::iter::once(first)
            .chain(matching)
            .find(|s| s.state() == SlotState::Borrowed)
            .unwrap_or(first);

        match slot.release() {
            Ok(()) => {
                tracing::debug!(slot = slot.index(), device = %slot.device().external_id, "Checked in");
                self.released.notify_waiters();
            }
            Err(SlotState::Servicing) => {
                tracing::warn!(slot = slot.index(), "Check-in while in maintenance; slot stays held");
            }
            Err(_) => {
                tracing::debug!(slot = slot.index(), "Check-in for slot that was already free");
            }
        }

        Ok(slot.device().clone())
    }

    /// Take both locks of `slot` for a maintenance run.
    pub fn claim_for_maintenance(
        &self,
        slot: &Arc<DeviceSlot>,
    ) -> Result<MaintenanceClaim, ClaimRefused> {
        MaintenanceClaim::try_new(Arc::clone(slot), Arc::clone(&self.released))
    }

    pub(crate) fn record_maintenance_failure(&self) {
        self.maintenance_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SwarmSnapshot {
        let slots = self.slots();
        let mut snapshot = SwarmSnapshot {
            total: slots.len(),
            bootstrapped: self.is_bootstrapped(),
            maintenance_failures: self.maintenance_failures.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in &slots {
            match slot.state() {
                SlotState::Free => snapshot.available += 1,
                SlotState::Borrowed => snapshot.checked_out += 1,
                SlotState::Servicing => snapshot.in_maintenance += 1,
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::testing::{COPTER_KIND, FakeFleet, STATION_KIND};

    fn kinds() -> UnitKinds {
        UnitKinds {
            copter: COPTER_KIND.to_string(),
            station: STATION_KIND.to_string(),
            station_index: 0,
        }
    }

    fn remote(fleet: &Arc<FakeFleet>) -> Remote {
        Remote::new(fleet.clone(), fleet.clone(), Duration::from_secs(1))
    }

    fn registry_with(fleet: &FakeFleet, n: usize) -> Arc<SwarmRegistry> {
        let registry = Arc::new(SwarmRegistry::new());
        for i in 0..n {
            registry.register(fleet.copter(&format!("copter-{i}")));
        }
        registry
    }

    #[tokio::test]
    async fn checkout_on_empty_pool_fails_immediately() {
        let registry = SwarmRegistry::new();
        let shutdown = CancellationToken::new();

        let result = tokio::time::timeout(Duration::from_secs(1), registry.checkout(&shutdown))
            .await
            .expect("empty pool must not wait");
        assert!(matches!(result, Err(SwarmError::EmptyPool)));
    }

    #[tokio::test]
    async fn checkout_prefers_low_indices() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 3);
        let shutdown = CancellationToken::new();

        let first = registry.checkout(&shutdown).await.unwrap();
        let second = registry.checkout(&shutdown).await.unwrap();
        assert_eq!(first.external_id, "copter-0");
        assert_eq!(second.external_id, "copter-1");

        registry.check_in(&first).unwrap();
        let third = registry.checkout(&shutdown).await.unwrap();
        assert_eq!(third.external_id, "copter-0");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checkouts_never_share_a_unit() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 4);
        let shutdown = CancellationToken::new();
        let held = Arc::new(std::sync::Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            let held = Arc::clone(&held);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let device = registry.checkout(&shutdown).await.unwrap();
                    assert!(
                        held.lock().unwrap().insert(device.external_id.clone()),
                        "{} handed out twice",
                        device.external_id
                    );
                    tokio::task::yield_now().await;
                    held.lock().unwrap().remove(&device.external_id);
                    registry.check_in(&device).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.snapshot().available, 4);
    }

    #[tokio::test]
    async fn blocked_checkout_resumes_after_check_in() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 1);
        let shutdown = CancellationToken::new();

        let held = registry.checkout(&shutdown).await.unwrap();
        let waiter = {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.checkout(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Round-trip through JSON: check-in matches on identity, not on the object.
        let returned: Device =
            serde_json::from_str(&serde_json::to_string(&held).unwrap()).unwrap();
        registry.check_in(&returned).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap()
            .unwrap();
        assert!(got.is_same_unit(&held));
    }

    #[tokio::test]
    async fn blocked_checkout_resumes_when_slot_is_added() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 1);
        let shutdown = CancellationToken::new();
        let _held = registry.checkout(&shutdown).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.checkout(&shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(fleet.copter("copter-late"));

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.external_id, "copter-late");
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_checkout() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 1);
        let shutdown = CancellationToken::new();
        let _held = registry.checkout(&shutdown).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.checkout(&shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SwarmError::Unavailable)));
    }

    #[tokio::test]
    async fn check_in_is_idempotent() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 2);
        let shutdown = CancellationToken::new();

        let device = registry.checkout(&shutdown).await.unwrap();
        assert!(registry.check_in(&device).is_ok());
        assert!(registry.check_in(&device).is_ok());
        assert_eq!(registry.snapshot().available, 2);
    }

    #[test]
    fn check_in_of_unknown_device_fails_without_mutation() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 2);
        assert!(registry.try_checkout().is_some());
        let before = registry.snapshot();

        let stranger = fleet.copter("copter-99");
        assert_eq!(
            registry.check_in(&stranger).unwrap_err(),
            SwarmError::UnknownDevice(stranger.identity())
        );
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn check_in_with_duplicates_releases_the_held_copy() {
        let fleet = FakeFleet::new();
        let registry = SwarmRegistry::new();
        registry.register(fleet.copter("copter-0"));
        registry.register(fleet.copter("copter-0"));

        let slots = registry.slots();
        assert!(slots[1].try_acquire());

        registry.check_in(&fleet.copter("copter-0")).unwrap();
        assert!(slots[0].is_available());
        assert!(slots[1].is_available());
    }

    #[test]
    fn check_in_does_not_release_slot_in_maintenance() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 1);
        let slot = registry.slots().remove(0);

        let claim = registry.claim_for_maintenance(&slot).unwrap();
        registry.check_in(slot.device()).unwrap();
        assert!(!slot.is_available());
        assert!(registry.try_checkout().is_none());

        drop(claim);
        assert!(registry.try_checkout().is_some());
    }

    #[test]
    fn check_in_during_refused_claim_still_releases() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 1);
        let slot = registry.slots().remove(0);
        let held = registry.try_checkout().unwrap();

        // A maintenance claim has marked the slot pending but not yet found
        // it borrowed when the holder checks it back in.
        assert!(slot.try_mark_pending());
        registry.check_in(&held).unwrap();
        assert!(slot.is_available());

        // The claim now backs off the way it does for a borrowed unit.
        assert!(slot.clear_pending());
        assert_eq!(registry.try_checkout().map(|d| d.external_id), Some(held.external_id));
    }

    #[tokio::test]
    async fn bootstrap_adds_only_the_delta_and_resolves_station_once() {
        let fleet = FakeFleet::new();
        let remote = remote(&fleet);
        let registry = SwarmRegistry::new();

        registry.bootstrap(&remote, &kinds(), 5).await.unwrap();
        registry.bootstrap(&remote, &kinds(), 8).await.unwrap();
        registry.bootstrap(&remote, &kinds(), 3).await.unwrap();

        assert_eq!(registry.len(), 8);
        assert_eq!(fleet.unit_requests(), 8);
        assert_eq!(fleet.station_requests(), 1);
        assert!(registry.is_bootstrapped());
        assert_eq!(registry.station().unwrap().external_id, "station-0");
    }

    #[tokio::test]
    async fn bootstrap_counts_ad_hoc_registrations() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 2);

        registry.bootstrap(&remote(&fleet), &kinds(), 3).await.unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(fleet.unit_requests(), 1);
    }

    #[tokio::test]
    async fn bootstrap_failure_keeps_partial_population() {
        let fleet = FakeFleet::new();
        fleet.limit_units(2);
        let registry = SwarmRegistry::new();

        let err = registry
            .bootstrap(&remote(&fleet), &kinds(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::Remote(RemoteError::Failed { .. })));
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_bootstrapped());
        assert!(registry.station().is_some());
    }

    #[tokio::test]
    async fn concurrent_bootstraps_do_not_overshoot() {
        let fleet = FakeFleet::new();
        let remote = remote(&fleet);
        let registry = SwarmRegistry::new();

        let kinds = kinds();
        let (a, b) = tokio::join!(
            registry.bootstrap(&remote, &kinds, 4),
            registry.bootstrap(&remote, &kinds, 4),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(fleet.station_requests(), 1);
    }

    #[test]
    fn snapshot_counts_slot_states() {
        let fleet = FakeFleet::new();
        let registry = registry_with(&fleet, 3);
        let slots = registry.slots();

        assert!(slots[0].try_acquire());
        let _claim = registry.claim_for_maintenance(&slots[2]).unwrap();
        registry.record_maintenance_failure();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.checked_out, 1);
        assert_eq!(snapshot.in_maintenance, 1);
        assert_eq!(snapshot.available, 1);
        assert_eq!(snapshot.maintenance_failures, 1);
        assert!(!snapshot.bootstrapped);
    }
}
