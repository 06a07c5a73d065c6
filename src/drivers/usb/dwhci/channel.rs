//! Host channel pool
//!
//! Channels are the controller's DMA execution slots. Each is owned by at
//! most one endpoint at a time. Free channels are handed out in FIFO order,
//! and periodic endpoints may never take the last free channel so bulk and
//! control traffic always has a way forward.

use crate::config::MAX_CHANNELS;
use crate::drivers::usb::EndpointHandle;
use heapless::{Deque, Vec};

/// Index of a host channel
pub type ChannelNumber = u8;

pub(crate) struct ChannelPool {
    owners: Vec<Option<EndpointHandle>, MAX_CHANNELS>,
    free: Deque<ChannelNumber, MAX_CHANNELS>,
}

impl ChannelPool {
    /// Create a pool of `count` channels, all free.
    pub fn new(count: usize) -> Self {
        let count = count.min(MAX_CHANNELS);
        let mut owners = Vec::new();
        let mut free = Deque::new();
        for number in 0..count {
            // Capacity is MAX_CHANNELS and count is clamped to it.
            let _ = owners.push(None);
            let _ = free.push_back(number as ChannelNumber);
        }
        Self { owners, free }
    }

    /// Number of channels in the pool
    pub fn count(&self) -> usize {
        self.owners.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Claim a channel for `endpoint`.
    ///
    /// Returns `None` when no channel is free, or when only one is free and
    /// the endpoint is periodic.
    pub fn allocate(&mut self, endpoint: EndpointHandle, periodic: bool) -> Option<ChannelNumber> {
        if self.free.is_empty() || (periodic && self.free.len() == 1) {
            return None;
        }

        let number = self.free.pop_front()?;
        let owner = &mut self.owners[number as usize];
        debug_assert!(owner.is_none(), "channel {} assigned twice", number);
        *owner = Some(endpoint);
        Some(number)
    }

    /// Return a channel to the back of the free list, dropping its owner.
    pub fn free(&mut self, number: ChannelNumber) -> Option<EndpointHandle> {
        let owner = self.owners.get_mut(number as usize)?.take();
        debug_assert!(owner.is_some(), "channel {} freed while free", number);
        if owner.is_some() {
            let _ = self.free.push_back(number);
        }
        owner
    }

    /// Endpoint that owns `number`, if any.
    pub fn owner(&self, number: ChannelNumber) -> Option<EndpointHandle> {
        self.owners.get(number as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_fifo_and_exclusive() {
        let mut pool = ChannelPool::new(3);
        let a = pool.allocate(EndpointHandle(10), false).unwrap();
        let b = pool.allocate(EndpointHandle(11), false).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.owner(a), Some(EndpointHandle(10)));
        assert_eq!(pool.owner(b), Some(EndpointHandle(11)));

        assert_eq!(pool.free(a), Some(EndpointHandle(10)));
        assert_eq!(pool.owner(a), None);

        // Channel 2 was free before `a` came back, so it goes first.
        assert_eq!(pool.allocate(EndpointHandle(12), false), Some(2));
        assert_eq!(pool.allocate(EndpointHandle(13), false), Some(a));
        assert_eq!(pool.owner(a), Some(EndpointHandle(13)));
        assert_eq!(pool.allocate(EndpointHandle(14), false), None);
    }

    #[test]
    fn last_channel_is_reserved_for_non_periodic() {
        let mut pool = ChannelPool::new(2);
        assert!(pool.allocate(EndpointHandle(1), true).is_some());
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.allocate(EndpointHandle(2), true), None);
        assert!(pool.allocate(EndpointHandle(3), false).is_some());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn no_channel_is_ever_shared() {
        let mut pool = ChannelPool::new(4);
        let mut held = std::vec::Vec::new();
        for round in 0..32usize {
            if round % 3 == 2 {
                if let Some(number) = held.pop() {
                    pool.free(number);
                }
            } else if let Some(number) = pool.allocate(EndpointHandle(round), round % 2 == 0) {
                assert!(!held.contains(&number));
                held.push(number);
            }
            assert_eq!(held.len() + pool.free_count(), pool.count());
        }
    }
}
