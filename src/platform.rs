//! Kernel services consumed by the drivers
//!
//! The drivers do not own interrupt routing, memory management or timing.
//! The host kernel supplies them through [`Platform`]. Locks that interrupt
//! handlers also take are acquired through [`lock_at`], which raises the run
//! level first and only then spins on the lock.

use crate::drivers::usb::{TransferHandle, TransferOutcome};
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

/// Execution priority levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    /// Normal thread execution
    Low,
    /// Deferred work runs here; the scheduler cannot preempt it
    Dispatch,
    /// The controller's own interrupt line is masked
    Device,
    /// All interrupts masked
    High,
}

/// A physically contiguous, DMA-capable buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub virtual_address: usize,
    pub physical_address: u64,
    pub size: usize,
}

/// Services the host kernel provides to a controller driver.
pub trait Platform {
    /// Raise the current processor to `level`, returning the previous level.
    fn raise_run_level(&self, level: RunLevel) -> RunLevel;

    /// Return to a level previously returned by `raise_run_level`.
    fn lower_run_level(&self, previous: RunLevel);

    /// Queue the controller's deferred interrupt work to run at dispatch
    /// level.
    fn queue_deferred_work(&self);

    /// Busy-wait or sleep for at least `microseconds`.
    fn delay_us(&self, microseconds: u64);

    /// Allocate a physically contiguous buffer.
    fn allocate_dma(&self, size: usize, alignment: usize) -> Option<DmaRegion>;

    /// The root port's status changed.
    fn port_changed(&self);

    /// An asynchronously submitted transfer finished.
    fn transfer_completed(&self, transfer: TransferHandle, outcome: TransferOutcome);

    /// Block the calling thread briefly while waiting for a completion.
    fn wait(&self) {
        core::hint::spin_loop();
    }
}

impl<P: Platform + ?Sized> Platform for &P {
    fn raise_run_level(&self, level: RunLevel) -> RunLevel {
        (**self).raise_run_level(level)
    }

    fn lower_run_level(&self, previous: RunLevel) {
        (**self).lower_run_level(previous)
    }

    fn queue_deferred_work(&self) {
        (**self).queue_deferred_work()
    }

    fn delay_us(&self, microseconds: u64) {
        (**self).delay_us(microseconds)
    }

    fn allocate_dma(&self, size: usize, alignment: usize) -> Option<DmaRegion> {
        (**self).allocate_dma(size, alignment)
    }

    fn port_changed(&self) {
        (**self).port_changed()
    }

    fn transfer_completed(&self, transfer: TransferHandle, outcome: TransferOutcome) {
        (**self).transfer_completed(transfer, outcome)
    }

    fn wait(&self) {
        (**self).wait()
    }
}

/// Restores the saved run level when dropped.
struct RunLevelRestore<'a, P: Platform + ?Sized> {
    platform: &'a P,
    previous: RunLevel,
}

impl<P: Platform + ?Sized> Drop for RunLevelRestore<'_, P> {
    fn drop(&mut self) {
        self.platform.lower_run_level(self.previous);
    }
}

/// A spinlock guard held at a raised run level.
///
/// The lock is released before the run level is lowered.
pub struct LevelGuard<'a, T, P: Platform + ?Sized> {
    // Field order is drop order: unlock, then lower.
    guard: MutexGuard<'a, T>,
    _restore: RunLevelRestore<'a, P>,
}

/// Raise to `level`, then acquire `lock`.
pub fn lock_at<'a, T, P: Platform + ?Sized>(
    lock: &'a Mutex<T>,
    platform: &'a P,
    level: RunLevel,
) -> LevelGuard<'a, T, P> {
    let previous = platform.raise_run_level(level);
    let restore = RunLevelRestore { platform, previous };
    LevelGuard {
        guard: lock.lock(),
        _restore: restore,
    }
}

impl<T, P: Platform + ?Sized> Deref for LevelGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, P: Platform + ?Sized> DerefMut for LevelGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
