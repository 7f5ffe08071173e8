//! Battery maintenance loop.
//!
//! Every cycle walks the slots in index order and checks each copter's battery.
//! A copter below threshold is claimed (both locks), flown to the charging
//! station and handed to the station's `ChargeDevice` operation. The charge
//! runs detached; its outcome is sent to the [`CompletionHandler`], which drops
//! the claim and so returns the copter to the pool.
//!
//! Failures on one slot never stop the scan of the others.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::Device;
use crate::registry::SwarmRegistry;
use crate::remote::{Remote, RemoteError, ops};
use crate::slot::{ClaimRefused, DeviceSlot, MaintenanceClaim};

/// Result of a detached charge, carrying the claim it releases.
pub struct ChargeOutcome {
    claim: MaintenanceClaim,
    result: Result<Value, RemoteError>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub inspected: usize,
    pub scheduled: Vec<usize>,
    /// Below threshold but already pending.
    pub already_pending: usize,
    /// Below threshold but borrowed; retried next cycle.
    pub deferred: usize,
    /// Health query or reposition failed.
    pub failed: usize,
}

pub struct Maintainer {
    registry: Arc<SwarmRegistry>,
    remote: Remote,
    threshold: f64,
    completions: mpsc::UnboundedSender<ChargeOutcome>,
}

impl Maintainer {
    pub fn new(
        registry: Arc<SwarmRegistry>,
        remote: Remote,
        threshold: f64,
    ) -> (Self, CompletionHandler) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = CompletionHandler {
            registry: Arc::clone(&registry),
            rx,
        };
        let maintainer = Self {
            registry,
            remote,
            threshold,
            completions: tx,
        };
        (maintainer, handler)
    }

    /// Run one scan. No-op until the swarm is bootstrapped.
    ///
    /// A low-battery copter that a caller is holding is not waited for: it
    /// is counted as deferred and picked up by a later cycle once returned.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        if !self.registry.is_bootstrapped() {
            return report;
        }
        let Some(station) = self.registry.station().cloned() else {
            return report;
        };

        for slot in self.registry.slots() {
            report.inspected += 1;
            match self.inspect(&slot, &station).await {
                Ok(SlotAction::Healthy) => {}
                Ok(SlotAction::Scheduled) => report.scheduled.push(slot.index()),
                Ok(SlotAction::Refused(ClaimRefused::AlreadyPending)) => {
                    report.already_pending += 1
                }
                Ok(SlotAction::Refused(ClaimRefused::Borrowed)) => report.deferred += 1,
                Err(e) => {
                    tracing::warn!(
                        slot = slot.index(),
                        device = %slot.device().external_id,
                        error = %e,
                        "Maintenance check failed, skipping slot"
                    );
                    report.failed += 1;
                }
            }
        }

        if !report.scheduled.is_empty() || report.failed > 0 {
            tracing::info!(
                scheduled = ?report.scheduled,
                failed = report.failed,
                deferred = report.deferred,
                "Maintenance cycle complete"
            );
        }
        report
    }

    async fn inspect(
        &self,
        slot: &Arc<DeviceSlot>,
        station: &Device,
    ) -> Result<SlotAction, RemoteError> {
        let level = self.remote.battery_level(slot.device()).await?;
        if level >= self.threshold {
            tracing::trace!(slot = slot.index(), level, "Battery ok");
            return Ok(SlotAction::Healthy);
        }

        // Cheap check first; the claim re-checks atomically.
        if slot.is_maintenance_pending() {
            return Ok(SlotAction::Refused(ClaimRefused::AlreadyPending));
        }
        let claim = match self.registry.claim_for_maintenance(slot) {
            Ok(claim) => claim,
            Err(refused) => {
                tracing::debug!(slot = slot.index(), level, ?refused, "Low battery, not claimed");
                return Ok(SlotAction::Refused(refused));
            }
        };
        tracing::info!(slot = slot.index(), level, "Low battery, sending copter to charge");

        // Dropping `claim` on error releases both locks.
        let position = self.remote.position(station).await?;
        self.remote.set_position(slot.device(), position).await?;

        let completions = self.completions.clone();
        let registry = Arc::clone(&self.registry);
        self.remote.invoke_detached(
            station.clone(),
            ops::CHARGE_DEVICE,
            json!({ "Device": slot.device() }),
            move |result| {
                if let Err(mpsc::error::SendError(outcome)) =
                    completions.send(ChargeOutcome { claim, result })
                {
                    tracing::debug!("Completion handler gone, settling charge in place");
                    settle(&registry, outcome);
                }
            },
        );
        Ok(SlotAction::Scheduled)
    }
}

enum SlotAction {
    Healthy,
    Scheduled,
    Refused(ClaimRefused),
}

/// Receives charge outcomes and returns charged copters to the pool.
///
/// Runs until every sender is gone: the maintainer and all in-flight charges.
pub struct CompletionHandler {
    registry: Arc<SwarmRegistry>,
    rx: mpsc::UnboundedReceiver<ChargeOutcome>,
}

impl CompletionHandler {
    pub async fn run(mut self) {
        while let Some(outcome) = self.rx.recv().await {
            settle(&self.registry, outcome);
        }
        tracing::debug!("Charge completion handler stopped");
    }

}

/// Record a charge outcome and return the copter to the pool.
fn settle(registry: &SwarmRegistry, outcome: ChargeOutcome) {
    let ChargeOutcome { claim, result } = outcome;
    let slot = claim.slot();
    match result {
        Ok(_) => tracing::info!(slot = slot.index(), "Charge complete"),
        Err(e) => {
            registry.record_maintenance_failure();
            tracing::warn!(
                slot = slot.index(),
                device = %slot.device().external_id,
                error = %e,
                "Charge failed, returning copter to pool"
            );
        }
    }
    drop(claim);
}

/// Handles for the spawned maintenance tasks.
pub struct MaintenanceTasks {
    cycle: JoinHandle<()>,
    completions: JoinHandle<()>,
}

impl MaintenanceTasks {
    /// Wait for the loop to stop, then give in-flight charges up to `grace`
    /// to report.
    pub async fn join(self, grace: Duration) {
        if let Err(e) = self.cycle.await {
            tracing::error!(error = %e, "Maintenance loop task failed");
        }
        match tokio::time::timeout(grace, self.completions).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Completion handler task failed"),
            Err(_) => tracing::warn!("Charges still in flight at shutdown"),
        }
    }
}

/// Spawn the loop and its completion handler.
///
/// The loop ticks every `interval` until `shutdown` fires. The completion
/// handler outlives it and keeps releasing slots for charges that finish later.
pub fn spawn(
    maintainer: Maintainer,
    handler: CompletionHandler,
    interval: Duration,
    shutdown: CancellationToken,
) -> MaintenanceTasks {
    let completions = tokio::spawn(handler.run());
    let cycle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    maintainer.run_cycle().await;
                }
            }
        }
        tracing::info!("Maintenance loop stopped");
    });
    MaintenanceTasks { cycle, completions }
}
