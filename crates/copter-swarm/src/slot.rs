//! DeviceSlot - a pooled unit, its availability state and its maintenance lock.
//!
//! - `state`: who holds the unit. `Free`, `Borrowed` by a checkout holder, or
//!   `Servicing` by the maintenance loop. Every transition is a single CAS, so
//!   a check-in can only undo a checkout and never a maintenance hold.
//! - `maintenance_pending`: the unit is en route to or at the charging
//!   station. Gates re-scheduling across maintenance cycles.
//!
//! No two callers can take the same slot out of `Free`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::Notify;

use crate::device::Device;

/// Holder of a slot's availability lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Borrowed = 1,
    Servicing = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Borrowed,
            2 => Self::Servicing,
            _ => Self::Free,
        }
    }
}

pub struct DeviceSlot {
    index: usize,
    device: Device,
    state: AtomicU8,
    maintenance_pending: AtomicBool,
}

impl DeviceSlot {
    pub fn new(index: usize, device: Device) -> Self {
        Self {
            index,
            device,
            state: AtomicU8::new(SlotState::Free as u8),
            maintenance_pending: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SlotState, to: SlotState) -> Result<(), SlotState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SlotState::from_u8)
    }

    /// Borrow a free unit. Returns `false` if anyone already holds it.
    pub fn try_acquire(&self) -> bool {
        self.transition(SlotState::Free, SlotState::Borrowed).is_ok()
    }

    /// Return a borrowed unit.
    ///
    /// On refusal, reports who holds it instead: `Free` if nobody did,
    /// `Servicing` if the maintenance loop does.
    pub fn release(&self) -> Result<(), SlotState> {
        self.transition(SlotState::Borrowed, SlotState::Free)
    }

    pub fn is_available(&self) -> bool {
        self.state() == SlotState::Free
    }

    pub fn is_maintenance_pending(&self) -> bool {
        self.maintenance_pending.load(Ordering::Acquire)
    }

    pub(crate) fn try_mark_pending(&self) -> bool {
        self.maintenance_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_pending(&self) -> bool {
        self.maintenance_pending.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("index", &self.index)
            .field("device", &self.device.external_id)
            .field("state", &self.state())
            .field("maintenance_pending", &self.is_maintenance_pending())
            .finish()
    }
}

/// Why a slot could not be claimed for maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRefused {
    /// Already queued for or undergoing maintenance.
    AlreadyPending,
    /// Currently borrowed by a checkout holder.
    Borrowed,
}

/// Both locks of one slot, held for the duration of a maintenance run.
///
/// On drop: availability is released first, then maintenance-pending, and
/// checkout waiters are woken.
#[must_use = "dropping the claim immediately returns the slot to the pool"]
pub struct MaintenanceClaim {
    slot: Arc<DeviceSlot>,
    released: Arc<Notify>,
}

impl MaintenanceClaim {
    /// Take maintenance-pending, then move the slot from `Free` to `Servicing`.
    ///
    /// If the unit is borrowed, maintenance-pending is handed back so the
    /// next cycle can try again.
    pub fn try_new(slot: Arc<DeviceSlot>, released: Arc<Notify>) -> Result<Self, ClaimRefused> {
        if !slot.try_mark_pending() {
            return Err(ClaimRefused::AlreadyPending);
        }
        if slot
            .transition(SlotState::Free, SlotState::Servicing)
            .is_err()
        {
            slot.clear_pending();
            return Err(ClaimRefused::Borrowed);
        }
        Ok(Self { slot, released })
    }

    pub fn slot(&self) -> &DeviceSlot {
        &self.slot
    }
}

impl Drop for MaintenanceClaim {
    fn drop(&mut self) {
        self.slot
            .state
            .store(SlotState::Free as u8, Ordering::Release);
        self.slot.clear_pending();
        self.released.notify_waiters();
        tracing::debug!(slot = self.slot.index, "Maintenance claim released");
    }
}
