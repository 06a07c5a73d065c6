//! Simple peripheral bus arbitration
//!
//! Several client devices (SPI chips, I2C targets) can sit on one bus
//! controller, but only one of them may own the bus at a time. [`BusLock`]
//! grants ownership in request order. When the owner unlocks, ownership
//! passes straight to the next queued client; the bus is never observed
//! free in between, so a newcomer cannot jump the queue.

use alloc::collections::VecDeque;
use core::fmt;
use spin::Mutex;

/// Identifies one client device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u32);

/// Bus lock usage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpbError {
    /// The client already owns the bus or is already waiting for it
    AlreadyOwner,
    /// The client does not own the bus
    NotOwner,
}

impl fmt::Display for SpbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpbError::AlreadyOwner => f.write_str("bus already locked by this client"),
            SpbError::NotOwner => f.write_str("bus not locked by this client"),
        }
    }
}

/// Controller-specific actions around ownership changes.
pub trait BusHooks {
    /// `client` now owns the bus, e.g. assert its chip select.
    fn bus_locked(&self, client: ClientHandle);

    /// The owner is giving the bus up, e.g. deassert chip select.
    fn bus_unlocked(&self);

    /// Block briefly while waiting for ownership.
    fn wait(&self) {
        core::hint::spin_loop();
    }
}

struct BusState {
    owner: Option<ClientHandle>,
    waiters: VecDeque<ClientHandle>,
}

/// A queued, single-owner bus lock.
pub struct BusLock<H> {
    hooks: H,
    state: Mutex<BusState>,
}

impl<H: BusHooks> BusLock<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            state: Mutex::new(BusState {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Current owner, if any
    pub fn owner(&self) -> Option<ClientHandle> {
        self.state.lock().owner
    }

    /// Take the bus for `client`, waiting behind earlier requests.
    pub fn lock(&self, client: ClientHandle) -> Result<(), SpbError> {
        {
            let mut state = self.state.lock();
            if state.owner == Some(client) || state.waiters.contains(&client) {
                return Err(SpbError::AlreadyOwner);
            }

            if state.owner.is_none() {
                state.owner = Some(client);
            } else {
                state.waiters.push_back(client);
            }
        }

        while self.state.lock().owner != Some(client) {
            self.hooks.wait();
        }

        log::trace!("SPB: client {} owns the bus", client.0);
        self.hooks.bus_locked(client);
        Ok(())
    }

    /// Release the bus held by `client`, handing it to the next waiter.
    pub fn unlock(&self, client: ClientHandle) -> Result<(), SpbError> {
        let mut state = self.state.lock();
        if state.owner != Some(client) {
            return Err(SpbError::NotOwner);
        }

        // Still the owner while the controller is told.
        self.hooks.bus_unlocked();
        state.owner = state.waiters.pop_front();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    #[derive(Default)]
    struct Recorder {
        locked: std::sync::Mutex<Vec<ClientHandle>>,
        unlocks: AtomicUsize,
    }

    impl BusHooks for Recorder {
        fn bus_locked(&self, client: ClientHandle) {
            self.locked.lock().unwrap().push(client);
        }

        fn bus_unlocked(&self) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
        }

        fn wait(&self) {
            std::thread::yield_now();
        }
    }

    const A: ClientHandle = ClientHandle(1);
    const B: ClientHandle = ClientHandle(2);
    const C: ClientHandle = ClientHandle(3);

    #[test]
    fn free_bus_is_taken_immediately() {
        let bus = BusLock::new(Recorder::default());
        assert_eq!(bus.lock(A), Ok(()));
        assert_eq!(bus.owner(), Some(A));
        assert_eq!(bus.unlock(A), Ok(()));
        assert_eq!(bus.owner(), None);
        assert_eq!(*bus.hooks().locked.lock().unwrap(), [A]);
        assert_eq!(bus.hooks().unlocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recursive_lock_is_rejected() {
        let bus = BusLock::new(Recorder::default());
        bus.lock(A).unwrap();
        assert_eq!(bus.lock(A), Err(SpbError::AlreadyOwner));
        assert_eq!(bus.owner(), Some(A));
    }

    #[test]
    fn only_the_owner_may_unlock() {
        let bus = BusLock::new(Recorder::default());
        assert_eq!(bus.unlock(A), Err(SpbError::NotOwner));
        bus.lock(A).unwrap();
        assert_eq!(bus.unlock(B), Err(SpbError::NotOwner));
        assert_eq!(bus.hooks().unlocks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unlock_hands_the_bus_to_waiters_in_order() {
        let bus = BusLock::new(Recorder::default());
        bus.lock(A).unwrap();
        let bus = &bus;

        let (release_b, b_released) = std::sync::mpsc::channel::<()>();
        std::thread::scope(|scope| {
            let waiter_b = scope.spawn(move || {
                bus.lock(B).unwrap();
                b_released.recv().unwrap();
                bus.unlock(B).unwrap();
            });
            while !bus.state.lock().waiters.contains(&B) {
                std::thread::yield_now();
            }

            let waiter_c = scope.spawn(|| {
                bus.lock(C).unwrap();
                bus.unlock(C).unwrap();
            });
            while !bus.state.lock().waiters.contains(&C) {
                std::thread::yield_now();
            }

            bus.unlock(A).unwrap();
            // Ownership moved without the bus going free.
            assert_eq!(bus.owner(), Some(B));
            release_b.send(()).unwrap();

            waiter_b.join().unwrap();
            waiter_c.join().unwrap();
        });

        assert_eq!(bus.owner(), None);
        assert_eq!(*bus.hooks().locked.lock().unwrap(), [A, B, C]);
        assert_eq!(bus.hooks().unlocks.load(Ordering::SeqCst), 3);
    }
}
