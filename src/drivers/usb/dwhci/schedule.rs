//! Endpoint and channel scheduler
//!
//! [`Schedule`] owns every endpoint, transfer set and hardware transfer of a
//! controller, the channel pool, and the five schedule lists. All of it is
//! guarded by the controller lock; methods take the register window as a
//! parameter so the lock only ever wraps plain data.
//!
//! Endpoint life cycle:
//!
//! ```text
//!  non-periodic:  (idle) -> NonPeriodicReady -> NonPeriodicActive -> (idle)
//!  periodic:      (idle) -> PeriodicInactive -> PeriodicReady -> PeriodicActive
//!                                ^                                   |
//!                                +-----------------------------------+
//! ```
//!
//! An endpoint on an active list owns a channel. Completed transfer sets are
//! collected in [`Schedule::take_completions`] so the caller can report them
//! after dropping the lock.

use super::channel::{ChannelNumber, ChannelPool};
use super::endpoint::{Endpoint, ScheduleList};
use super::frame::FrameNumber;
use super::hw::Hardware;
use super::ping::ping_required_after;
use super::regs::{
    CHANNEL_CONTROL, CHANNEL_SPLIT_CONTROL, CHANNEL_TOKEN, ChannelInterrupts, ChannelRegister, Pid,
};
use super::split::process_split;
use super::transfer::{Transfer, TransferPlan, TransferSet, TransferSlot, reserved_transfer_count};
use crate::block_allocator::BlockAllocator;
use crate::config::{ControllerConfig, DebugFlags, MAX_CHANNELS, debug_flags};
use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::{
    EndpointHandle, EndpointRequest, TransferFlags, TransferHandle, TransferOutcome, TransferRequest,
    TransferType, UsbError,
};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use tock_registers::LocalRegisterCopy;

/// Growth step of each object pool
const ENDPOINT_EXPANSION: usize = 16;
const TRANSFER_SET_EXPANSION: usize = 16;
const TRANSFER_EXPANSION: usize = 64;

/// Interrupt start splits may not be issued in this microframe.
const FORBIDDEN_START_SPLIT_MICROFRAME: u16 = 6;

const LIST_COUNT: usize = 5;

/// A transfer set that finished and still has to be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    pub transfer: TransferHandle,
    pub outcome: TransferOutcome,
}

/// What channel processing decided for one endpoint.
struct ChannelDecision {
    remove_set: Option<TransferHandle>,
    advance: bool,
}

impl ChannelDecision {
    const NOTHING: Self = Self {
        remove_set: None,
        advance: false,
    };
}

/// Map channel error bits to a transfer error, most specific first.
fn classify_error(errors: ChannelInterrupts) -> UsbError {
    if errors.contains(ChannelInterrupts::STALL) {
        UsbError::Stall
    } else if errors.contains(ChannelInterrupts::TRANSACTION_ERROR) {
        UsbError::CrcOrTimeout
    } else if errors.contains(ChannelInterrupts::BABBLE_ERROR) {
        UsbError::Babble
    } else if errors.contains(ChannelInterrupts::DMA_BUFFER_NOT_AVAILABLE) {
        UsbError::DataBuffer
    } else if errors.contains(ChannelInterrupts::FRAME_OVERRUN) {
        UsbError::FrameOverrun
    } else if errors.contains(ChannelInterrupts::DATA_TOGGLE_ERROR) {
        UsbError::DataToggle
    } else {
        UsbError::DeviceIo
    }
}

/// Current set and transfer slot of `endpoint`.
fn head_slot(
    sets: &BlockAllocator<TransferSet>,
    endpoint: &Endpoint,
) -> Option<(TransferHandle, TransferSlot)> {
    let set = endpoint.head_set()?;
    let slot = *sets.get(set.0)?.queue.front()?;
    Some((set, slot))
}

pub(crate) struct Schedule {
    config: ControllerConfig,
    /// Physical address of the scratch buffer for control status stages
    status_buffer: u64,
    endpoints: BlockAllocator<Endpoint>,
    sets: BlockAllocator<TransferSet>,
    transfers: BlockAllocator<Transfer>,
    channels: ChannelPool,
    lists: [VecDeque<EndpointHandle>; LIST_COUNT],
    /// Earliest `next_frame` of the periodic inactive endpoints
    next_frame: Option<FrameNumber>,
    completed: Vec<Completion>,
}

impl Schedule {
    pub fn new(config: ControllerConfig, status_buffer: u64) -> Self {
        Self {
            channels: ChannelPool::new(config.channel_count),
            config,
            status_buffer,
            endpoints: BlockAllocator::new(ENDPOINT_EXPANSION),
            sets: BlockAllocator::new(TRANSFER_SET_EXPANSION),
            transfers: BlockAllocator::new(TRANSFER_EXPANSION),
            lists: Default::default(),
            next_frame: None,
            completed: Vec::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Channels currently without an owner
    pub fn free_channel_count(&self) -> usize {
        self.channels.free_count()
    }

    /// Endpoint that owns `channel`, if any.
    pub fn channel_owner(&self, channel: ChannelNumber) -> Option<EndpointHandle> {
        self.channels.owner(channel)
    }

    pub fn endpoint(&self, handle: EndpointHandle) -> Option<&Endpoint> {
        self.endpoints.get(handle.0)
    }

    /// Hand the finished asynchronous sets to the caller.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        core::mem::take(&mut self.completed)
    }

    /// Collect the result of a finished synchronous submission.
    pub fn take_outcome(&mut self, set: TransferHandle) -> Option<TransferOutcome> {
        self.sets.get_mut(set.0)?.outcome.take()
    }

    // ========================================================================
    // Schedule Lists
    // ========================================================================

    fn list(&self, list: ScheduleList) -> &VecDeque<EndpointHandle> {
        &self.lists[list as usize]
    }

    fn insert(&mut self, handle: EndpointHandle, list: ScheduleList) {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return;
        };
        debug_assert!(endpoint.list.is_none(), "endpoint on two lists");
        endpoint.list = Some(list);
        self.lists[list as usize].push_back(handle);

        if debug_flags().contains(DebugFlags::SCHEDULE) {
            log::debug!("DWHCI: endpoint {} -> {:?}", handle.0, list);
        }
    }

    fn unlink(&mut self, handle: EndpointHandle) {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return;
        };
        if let Some(list) = endpoint.list.take() {
            let queue = &mut self.lists[list as usize];
            if let Some(position) = queue.iter().position(|&entry| entry == handle) {
                queue.remove(position);
            }
        }
    }

    fn set_next_frame<R: RegisterAccess>(&mut self, hw: &Hardware<R>, frame: Option<FrameNumber>) {
        self.next_frame = frame;
        hw.publish_next_frame(frame);
    }

    /// Move the controller deadline earlier if `frame` comes first.
    fn pull_next_frame_in<R: RegisterAccess>(&mut self, hw: &Hardware<R>, frame: FrameNumber) {
        let next = self.next_frame.map_or(frame, |current| current.earliest(frame));
        self.set_next_frame(hw, Some(next));
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    pub fn create_endpoint(&mut self, request: &EndpointRequest) -> Result<EndpointHandle, UsbError> {
        let endpoint = Endpoint::new(request, &self.config)?;
        let index = self
            .endpoints
            .allocate(endpoint)
            .map_err(|_| UsbError::NoResources)?;
        Ok(EndpointHandle(index))
    }

    pub fn reset_endpoint(&mut self, handle: EndpointHandle, max_packet_size: u32) -> Result<(), UsbError> {
        let endpoint = self
            .endpoints
            .get_mut(handle.0)
            .ok_or(UsbError::InvalidParameter)?;
        endpoint.reset(max_packet_size, &self.config)
    }

    /// Release an endpoint. It must have no queued transfer sets.
    pub fn destroy_endpoint(&mut self, handle: EndpointHandle) -> Result<(), UsbError> {
        let endpoint = self.endpoints.get(handle.0).ok_or(UsbError::InvalidParameter)?;
        if !endpoint.transfer_sets.is_empty() || endpoint.list.is_some() || endpoint.channel.is_some() {
            return Err(UsbError::InvalidParameter);
        }

        self.endpoints
            .free(handle.0)
            .map_err(|_| UsbError::InvalidParameter)?;
        Ok(())
    }

    // ========================================================================
    // Transfer Sets
    // ========================================================================

    /// Create a transfer set for `endpoint` with room for the largest request
    /// of up to `max_buffer_size` bytes.
    pub fn create_transfer(
        &mut self,
        endpoint: EndpointHandle,
        max_buffer_size: u32,
        flags: TransferFlags,
    ) -> Result<TransferHandle, UsbError> {
        let state = self.endpoints.get(endpoint.0).ok_or(UsbError::InvalidParameter)?;
        let count = reserved_transfer_count(state, max_buffer_size, flags)?;

        let set_index = self
            .sets
            .allocate(TransferSet::new(endpoint, Vec::new()))
            .map_err(|_| UsbError::NoResources)?;
        let set = TransferHandle(set_index);

        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            match self.transfers.allocate(Transfer::empty(set)) {
                Ok(slot) => reserved.push(slot),
                Err(_) => {
                    for slot in reserved {
                        let _ = self.transfers.free(slot);
                    }
                    let _ = self.sets.free(set_index);
                    return Err(UsbError::NoResources);
                }
            }
        }

        if let Some(entry) = self.sets.get_mut(set_index) {
            *entry = TransferSet::new(endpoint, reserved);
        }
        Ok(set)
    }

    /// Release a transfer set and its reserved transfers. It must not be
    /// queued.
    pub fn destroy_transfer(&mut self, set: TransferHandle) -> Result<(), UsbError> {
        let state = self.sets.get(set.0).ok_or(UsbError::InvalidParameter)?;
        if state.queued {
            return Err(UsbError::InvalidParameter);
        }

        let state = self.sets.free(set.0).map_err(|_| UsbError::InvalidParameter)?;
        for slot in state.reserved {
            let _ = self.transfers.free(slot);
        }
        Ok(())
    }

    /// Cut `request` into hardware transfers and queue them on the set's
    /// endpoint, starting the endpoint if it was idle.
    pub fn submit<R: RegisterAccess>(
        &mut self,
        hw: &Hardware<R>,
        handle: TransferHandle,
        request: &TransferRequest,
        synchronous: bool,
    ) -> Result<(), UsbError> {
        let set = self.sets.get_mut(handle.0).ok_or(UsbError::InvalidParameter)?;
        if set.queued {
            return Err(UsbError::InvalidParameter);
        }

        let endpoint_handle = set.endpoint;
        let endpoint = self
            .endpoints
            .get_mut(endpoint_handle.0)
            .ok_or(UsbError::InvalidParameter)?;
        if endpoint.transfer_type == TransferType::Isochronous {
            return Err(UsbError::NotImplemented);
        }

        let plan = TransferPlan::new(endpoint, handle, request, self.status_buffer)?;
        if TransferPlan::count(&plan) > set.reserved.len() {
            return Err(UsbError::InvalidParameter);
        }

        // The address only changes while the endpoint is quiet, e.g. right
        // after SET_ADDRESS on the default control endpoint.
        if request.device_address != endpoint.device_address() {
            debug_assert!(endpoint.transfer_sets.is_empty());
            endpoint.set_device_address(request.device_address);
        }

        set.prepare(*request, synchronous);
        for (&slot, transfer) in set.reserved.iter().zip(plan) {
            if let Some(entry) = self.transfers.get_mut(slot) {
                *entry = transfer;
            }
            set.queue.push_back(slot);
        }
        set.queued = true;
        endpoint.transfer_sets.push_back(handle);

        if endpoint.list.is_some() {
            return Ok(());
        }
        debug_assert!(!endpoint.scheduled);

        if !endpoint.is_periodic() {
            self.insert(endpoint_handle, ScheduleList::NonPeriodicReady);
            self.process_schedule(hw, false);
            return Ok(());
        }

        // Start periodic endpoints a little in the future, but no later than
        // one poll interval out.
        let frame = hw.frame_number();
        let offset = self.config.frame_offset.min(endpoint.poll_rate);
        let mut next = frame.wrapping_add(offset);
        if endpoint.uses_split() && endpoint.transfer_type == TransferType::Interrupt {
            next = next.last_microframe();
        }
        endpoint.next_frame = next;

        self.pull_next_frame_in(hw, next);
        if self.list(ScheduleList::PeriodicInactive).is_empty() {
            hw.set_start_of_frame_interrupt(true);
        }
        self.insert(endpoint_handle, ScheduleList::PeriodicInactive);
        Ok(())
    }

    /// Cancel a queued transfer set.
    ///
    /// Fails with `TooLate` if the set already finished, or if its transfer
    /// is on the wire and the channel halt has to be confirmed by interrupt.
    /// In the latter case the set completes as `Cancelled` later.
    pub fn cancel<R: RegisterAccess>(
        &mut self,
        hw: &Hardware<R>,
        handle: TransferHandle,
        port_connected: bool,
    ) -> Result<(), UsbError> {
        let set = self.sets.get_mut(handle.0).ok_or(UsbError::InvalidParameter)?;
        if !set.queued {
            return Err(UsbError::TooLate);
        }

        let endpoint_handle = set.endpoint;
        let endpoint = self
            .endpoints
            .get(endpoint_handle.0)
            .ok_or(UsbError::InvalidParameter)?;
        if endpoint.transfer_type == TransferType::Isochronous {
            return Err(UsbError::NotImplemented);
        }

        let first = endpoint.head_set() == Some(handle);
        set.error = Some(UsbError::Cancelled);

        if port_connected && first && endpoint.scheduled {
            if let Some(channel) = endpoint.channel {
                if !hw.halt_channel(channel) {
                    return Err(UsbError::TooLate);
                }
            }
        }

        self.remove_set(handle);
        if first {
            self.advance_endpoint(hw, endpoint_handle);
            self.process_schedule(hw, false);
        }
        Ok(())
    }

    /// Take a finished set off its endpoint and record its outcome.
    fn remove_set(&mut self, handle: TransferHandle) {
        let Some(set) = self.sets.get_mut(handle.0) else {
            return;
        };
        if !set.queued {
            return;
        }

        set.queued = false;
        set.queue.clear();
        let outcome = TransferOutcome {
            length_transferred: set.length_transferred,
            result: set.error.map_or(Ok(()), Err),
        };

        if let Some(endpoint) = self.endpoints.get_mut(set.endpoint.0) {
            if let Some(position) = endpoint.transfer_sets.iter().position(|&h| h == handle) {
                endpoint.transfer_sets.remove(position);
            }
        }

        if debug_flags().contains(DebugFlags::TRANSFERS) {
            log::debug!(
                "DWHCI: transfer set {} done, {} bytes, {:?}",
                handle.0,
                outcome.length_transferred,
                outcome.result
            );
        }

        if set.synchronous {
            set.outcome = Some(outcome);
        } else {
            self.completed.push(Completion {
                transfer: handle,
                outcome,
            });
        }
    }

    // ========================================================================
    // Channels
    // ========================================================================

    fn allocate_channel<R: RegisterAccess>(&mut self, hw: &Hardware<R>, handle: EndpointHandle) -> bool {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return false;
        };
        debug_assert!(endpoint.channel.is_none());

        match self.channels.allocate(handle, endpoint.is_periodic()) {
            Some(channel) => {
                endpoint.channel = Some(channel);
                hw.mark_channel_assigned(channel, true);
                true
            }
            None => false,
        }
    }

    fn release_channel<R: RegisterAccess>(&mut self, hw: &Hardware<R>, handle: EndpointHandle) {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return;
        };
        if let Some(channel) = endpoint.channel.take() {
            hw.mark_channel_assigned(channel, false);
            self.channels.free(channel);
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Hand channels to ready endpoints and program every active endpoint
    /// that has nothing on the wire. Periodic endpoints go first.
    pub fn process_schedule<R: RegisterAccess>(&mut self, hw: &Hardware<R>, periodic_only: bool) {
        self.activate(hw, ScheduleList::PeriodicReady, ScheduleList::PeriodicActive);
        self.schedule_list(hw, ScheduleList::PeriodicActive);
        if periodic_only {
            return;
        }

        self.activate(hw, ScheduleList::NonPeriodicReady, ScheduleList::NonPeriodicActive);
        self.schedule_list(hw, ScheduleList::NonPeriodicActive);
    }

    fn activate<R: RegisterAccess>(&mut self, hw: &Hardware<R>, ready: ScheduleList, active: ScheduleList) {
        while let Some(&handle) = self.list(ready).front() {
            if !self.allocate_channel(hw, handle) {
                break;
            }
            self.unlink(handle);
            self.insert(handle, active);
        }
    }

    fn schedule_list<R: RegisterAccess>(&mut self, hw: &Hardware<R>, list: ScheduleList) {
        // Each active endpoint owns a channel, so this never overflows.
        let mut pending = heapless::Vec::<EndpointHandle, MAX_CHANNELS>::new();
        for &handle in self.list(list) {
            if self.endpoints.get(handle.0).is_some_and(|endpoint| !endpoint.scheduled) {
                let _ = pending.push(handle);
            }
        }

        for handle in pending {
            self.schedule_transfer(hw, handle);
        }
    }

    /// Program the endpoint's current transfer into its channel.
    fn schedule_transfer<R: RegisterAccess>(&mut self, hw: &Hardware<R>, handle: EndpointHandle) {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return;
        };
        let Some(channel) = endpoint.channel else {
            return;
        };
        let Some((_, slot)) = head_slot(&self.sets, endpoint) else {
            return;
        };
        let Some(transfer) = self.transfers.get(slot) else {
            return;
        };

        hw.write_channel(ChannelRegister::Interrupt, channel, u32::MAX);
        hw.write_channel(ChannelRegister::InterruptMask, channel, transfer.interrupt_mask.bits());
        hw.set_channel_interrupt(channel, true);

        let mut token = transfer.token;
        let mut split = endpoint.split_control;
        if endpoint.uses_split() {
            if transfer.complete_split_count != 0 {
                if !transfer.in_transfer {
                    token.modify(CHANNEL_TOKEN::TRANSFER_SIZE.val(0));
                }
                split.modify(CHANNEL_SPLIT_CONTROL::COMPLETE_SPLIT::SET);
            } else if endpoint.transfer_type == TransferType::Interrupt {
                let frame = hw.frame_number();
                if frame.microframe() == FORBIDDEN_START_SPLIT_MICROFRAME {
                    self.defer_start_split(hw, handle, channel, frame);
                    return;
                }
                endpoint.start_frame = frame;
            }
        }

        // DATA0 in a prepared token means "continue the endpoint's toggle".
        if transfer.pid() == Pid::Data0 {
            token.modify(CHANNEL_TOKEN::PID.val(endpoint.data_toggle as u32));
        }

        if endpoint.ping_required {
            debug_assert!(!transfer.in_transfer);
            token.modify(CHANNEL_TOKEN::PING::SET);
            endpoint.ping_required = false;
        }

        debug_assert!(transfer.physical_address <= u32::MAX as u64);
        hw.write_channel(ChannelRegister::Token, channel, token.get());
        hw.write_channel(ChannelRegister::DmaAddress, channel, transfer.physical_address as u32);
        hw.write_channel(ChannelRegister::SplitControl, channel, split.get());

        let mut control = endpoint.channel_control;
        if transfer.in_transfer {
            control.modify(CHANNEL_CONTROL::ENDPOINT_DIRECTION_IN::SET);
        }
        if endpoint.is_periodic() && hw.frame_number().is_even() {
            control.modify(CHANNEL_CONTROL::ODD_FRAME::SET);
        }
        hw.write_channel(ChannelRegister::Control, channel, control.get());
        endpoint.scheduled = true;

        if debug_flags().contains(DebugFlags::TRANSFERS) {
            log::debug!(
                "DWHCI: channel {} token {:#010x} control {:#010x} split {:#010x}",
                channel,
                token.get(),
                control.get(),
                split.get()
            );
        }
    }

    /// Park an interrupt endpoint whose start split fell on a forbidden
    /// microframe until the last microframe of the frame.
    fn defer_start_split<R: RegisterAccess>(
        &mut self,
        hw: &Hardware<R>,
        handle: EndpointHandle,
        channel: ChannelNumber,
        frame: FrameNumber,
    ) {
        hw.write_channel(ChannelRegister::InterruptMask, channel, 0);
        hw.set_channel_interrupt(channel, false);

        self.unlink(handle);
        if self.list(ScheduleList::PeriodicInactive).is_empty() {
            hw.set_start_of_frame_interrupt(true);
        }

        let next = frame.last_microframe();
        if let Some(endpoint) = self.endpoints.get_mut(handle.0) {
            endpoint.next_frame = next;
            endpoint.scheduled = false;
        }
        self.pull_next_frame_in(hw, next);
        self.insert(handle, ScheduleList::PeriodicInactive);
        self.release_channel(hw, handle);
    }

    /// Move an endpoint past its current transfer: requeue it if more work
    /// remains, idle it otherwise. The channel is released unless a periodic
    /// endpoint is already due again.
    ///
    /// The caller runs [`Schedule::process_schedule`] afterwards.
    fn advance_endpoint<R: RegisterAccess>(&mut self, hw: &Hardware<R>, handle: EndpointHandle) {
        let Some(endpoint) = self.endpoints.get(handle.0) else {
            return;
        };
        let channel = endpoint.channel;
        if let Some(channel) = channel {
            hw.quiesce_channel(channel);
        }

        let mut release = channel.is_some();
        let inactive_was_empty = self.list(ScheduleList::PeriodicInactive).is_empty();
        self.unlink(handle);

        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return;
        };
        endpoint.scheduled = false;

        if endpoint.transfer_sets.is_empty() {
            endpoint.next_frame = FrameNumber::default();
            endpoint.start_frame = FrameNumber::default();
        } else if !endpoint.is_periodic() {
            self.insert(handle, ScheduleList::NonPeriodicReady);
        } else {
            let complete_split_count = head_slot(&self.sets, endpoint)
                .and_then(|(_, slot)| self.transfers.get(slot))
                .map_or(0, |transfer| transfer.complete_split_count);

            let frame = hw.frame_number();
            let mut next = if complete_split_count != 0 {
                // Complete splits follow the start split one microframe
                // apart.
                endpoint.start_frame.wrapping_add(1 + complete_split_count)
            } else {
                frame.wrapping_add(endpoint.poll_rate)
            };
            if endpoint.uses_split()
                && endpoint.transfer_type == TransferType::Interrupt
                && complete_split_count == 0
            {
                next = next.last_microframe();
            }
            endpoint.next_frame = next;

            if channel.is_some() && frame.has_reached(next) {
                self.insert(handle, ScheduleList::PeriodicActive);
                release = false;
            } else {
                self.pull_next_frame_in(hw, next);
                if inactive_was_empty {
                    hw.set_start_of_frame_interrupt(true);
                }
                self.insert(handle, ScheduleList::PeriodicInactive);
            }
        }

        if release {
            self.release_channel(hw, handle);
        }

        if !inactive_was_empty && self.list(ScheduleList::PeriodicInactive).is_empty() {
            hw.set_start_of_frame_interrupt(false);
            self.set_next_frame(hw, None);
        }
    }

    // ========================================================================
    // Interrupt Processing
    // ========================================================================

    /// Promote periodic endpoints whose frame has arrived.
    pub fn handle_start_of_frame<R: RegisterAccess>(&mut self, hw: &Hardware<R>) {
        if self.next_frame.is_none() {
            return;
        }

        let frame = hw.frame_number();
        let inactive = ScheduleList::PeriodicInactive as usize;
        let mut next: Option<FrameNumber> = None;
        let mut ready = false;
        let mut index = 0;

        while let Some(&handle) = self.lists[inactive].get(index) {
            match self.endpoints.get(handle.0).map(|endpoint| endpoint.next_frame) {
                Some(due) if frame.is_before(due) => {
                    next = Some(next.map_or(due, |current| current.earliest(due)));
                    index += 1;
                }
                Some(_) => {
                    self.unlink(handle);
                    self.insert(handle, ScheduleList::PeriodicReady);
                    ready = true;
                }
                None => {
                    self.lists[inactive].remove(index);
                }
            }
        }

        if self.lists[inactive].is_empty() {
            hw.set_start_of_frame_interrupt(false);
        }
        self.set_next_frame(hw, next);

        if ready {
            self.process_schedule(hw, true);
        }
    }

    /// Apply the channel interrupt bits collected by the interrupt handler,
    /// indexed by channel number.
    pub fn process_channel_interrupts<R: RegisterAccess>(
        &mut self,
        hw: &Hardware<R>,
        pending: &[ChannelInterrupts],
    ) {
        let mut reschedule = false;

        for (number, &bits) in pending.iter().enumerate().take(self.channels.count()) {
            if bits.is_empty() {
                continue;
            }

            let channel = number as ChannelNumber;
            let Some(handle) = self.channels.owner(channel) else {
                continue;
            };

            let bits = self.preprocess(hw, handle, bits);
            let decision = self.complete_transfer(hw, handle, channel, bits);
            if let Some(set) = decision.remove_set {
                self.remove_set(set);
            }
            if decision.advance {
                self.advance_endpoint(hw, handle);
                reschedule = true;
            }
        }

        if reschedule {
            self.process_schedule(hw, false);
        }
    }

    /// Run split and PING handling on a channel's interrupt bits.
    fn preprocess<R: RegisterAccess>(
        &mut self,
        hw: &Hardware<R>,
        handle: EndpointHandle,
        mut bits: ChannelInterrupts,
    ) -> ChannelInterrupts {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return bits;
        };
        let Some((set_handle, slot)) = head_slot(&self.sets, endpoint) else {
            return bits;
        };

        if endpoint.uses_split() {
            if let Some(transfer) = self.transfers.get_mut(slot) {
                bits = process_split(
                    transfer,
                    endpoint.transfer_type,
                    endpoint.start_frame,
                    hw.frame_number(),
                    bits,
                );
            }
        }

        if endpoint.uses_ping() {
            let set = self.sets.get(set_handle.0);
            let direction = set.and_then(|set| set.request).map(|request| request.direction);
            let next_in = set
                .and_then(|set| set.queue.get(1))
                .and_then(|&next| self.transfers.get(next))
                .map(|transfer| transfer.in_transfer);

            if let (Some(direction), Some(transfer)) = (direction, self.transfers.get(slot)) {
                if ping_required_after(
                    self.config.revision,
                    endpoint.transfer_type,
                    direction,
                    transfer,
                    next_in,
                    bits,
                ) {
                    endpoint.ping_required = true;
                }
            }
        }

        bits
    }

    /// Account for a finished channel operation and decide whether the set
    /// is done and whether the endpoint moves on.
    fn complete_transfer<R: RegisterAccess>(
        &mut self,
        hw: &Hardware<R>,
        handle: EndpointHandle,
        channel: ChannelNumber,
        bits: ChannelInterrupts,
    ) -> ChannelDecision {
        let Some(endpoint) = self.endpoints.get_mut(handle.0) else {
            return ChannelDecision::NOTHING;
        };
        let Some((set_handle, slot)) = head_slot(&self.sets, endpoint) else {
            return ChannelDecision::NOTHING;
        };
        let (Some(set), Some(transfer)) = (self.sets.get_mut(set_handle.0), self.transfers.get(slot)) else {
            return ChannelDecision::NOTHING;
        };

        let token = LocalRegisterCopy::<u32, CHANNEL_TOKEN::Register>::new(
            hw.read_channel(ChannelRegister::Token, channel),
        );
        endpoint.update_data_toggle(Pid::from_bits(token.read(CHANNEL_TOKEN::PID)));

        // A cancel or an AHB error already asked the channel to halt; this
        // is the confirmation.
        if matches!(set.error, Some(UsbError::Cancelled | UsbError::DeviceIo)) {
            return ChannelDecision {
                remove_set: Some(set_handle),
                advance: true,
            };
        }

        let mut remove = false;
        let mut advance = true;

        let errors = bits & ChannelInterrupts::ERROR_MASK;
        if !errors.is_empty() {
            remove = true;
            let error = classify_error(errors);
            set.error = Some(error);
            if error == UsbError::DeviceIo {
                log::error!("DWHCI: AHB error on channel {}", channel);
                if !hw.halt_channel(channel) {
                    remove = false;
                    advance = false;
                }
            } else if debug_flags().contains(DebugFlags::TRANSFERS) {
                log::debug!("DWHCI: channel {} failed: {:?}", channel, errors);
            }
        }

        let mut shorted = false;
        let mut pop = false;
        if bits.contains(ChannelInterrupts::TRANSFER_COMPLETE) {
            let length = if transfer.in_transfer {
                transfer.length.saturating_sub(token.read(CHANNEL_TOKEN::TRANSFER_SIZE))
            } else {
                transfer.length
            };
            set.length_transferred += length;

            if !remove {
                if transfer.last {
                    remove = true;
                } else if length != transfer.length {
                    shorted = true;
                } else {
                    pop = true;
                }
            }
        }

        if shorted {
            // A short control data stage skips straight to the status stage.
            if endpoint.transfer_type == TransferType::Control {
                if let Some(&status) = set.queue.back() {
                    set.queue.clear();
                    set.queue.push_back(status);
                }
            } else {
                remove = true;
            }
        } else if pop {
            set.queue.pop_front();
        }

        ChannelDecision {
            remove_set: remove.then_some(set_handle),
            advance,
        }
    }
}

#[cfg(test)]
impl Schedule {
    pub fn list_of(&self, handle: EndpointHandle) -> Option<ScheduleList> {
        self.endpoints.get(handle.0)?.list
    }

    pub fn list_len(&self, list: ScheduleList) -> usize {
        self.list(list).len()
    }

    pub fn next_frame(&self) -> Option<FrameNumber> {
        self.next_frame
    }

    pub fn queued_transfer_count(&self, set: TransferHandle) -> usize {
        self.sets.get(set.0).map_or(0, |set| set.queue.len())
    }

    pub fn reserved_transfer_count(&self, set: TransferHandle) -> usize {
        self.sets.get(set.0).map_or(0, |set| set.reserved.len())
    }

    pub fn allocated_transfers(&self) -> usize {
        self.transfers.allocated()
    }
}
