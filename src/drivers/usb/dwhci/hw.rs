//! Register-level helpers
//!
//! [`Hardware`] wraps the controller's register window with typed accessors
//! and the few state words the interrupt handler must read without taking
//! the controller lock: the next start-of-frame deadline and the set of
//! channels that currently have an owner.

use super::channel::ChannelNumber;
use super::frame::FrameNumber;
use super::regs::{
    CHANNEL_CONTROL, CORE_RESET, ChannelInterrupts, ChannelRegister, CoreInterrupts,
    HOST_FRAME_NUMBER, Register,
};
use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::UsbError;
use crate::platform::Platform;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use tock_registers::{LocalRegisterCopy, RegisterLongName};

/// Marker for "no start-of-frame deadline" in the atomic hint
const NO_FRAME: u16 = u16::MAX;

/// Polls while waiting for the AHB master or a core reset, 20ms apart
const RESET_POLL_ATTEMPTS: u32 = 50;
const RESET_POLL_INTERVAL_US: u64 = 20_000;

/// Polls while waiting for FIFO flushes and channel halts, 10us apart
const SHORT_POLL_ATTEMPTS: u32 = 10_000;
const SHORT_POLL_INTERVAL_US: u64 = 10;

pub(crate) struct Hardware<R> {
    registers: R,
    next_frame_hint: AtomicU16,
    assigned_channels: AtomicU32,
}

impl<R: RegisterAccess> Hardware<R> {
    pub fn new(registers: R) -> Self {
        Self {
            registers,
            next_frame_hint: AtomicU16::new(NO_FRAME),
            assigned_channels: AtomicU32::new(0),
        }
    }

    // ========================================================================
    // Raw Access
    // ========================================================================

    #[inline]
    pub fn read(&self, register: Register) -> u32 {
        self.registers.read32(register.offset())
    }

    #[inline]
    pub fn write(&self, register: Register, value: u32) {
        self.registers.write32(register.offset(), value)
    }

    /// Read a register into a typed local copy.
    pub fn read_copy<T: RegisterLongName>(&self, register: Register) -> LocalRegisterCopy<u32, T> {
        LocalRegisterCopy::new(self.read(register))
    }

    #[inline]
    pub fn read_channel(&self, register: ChannelRegister, channel: ChannelNumber) -> u32 {
        self.registers.read32(register.offset(channel as usize))
    }

    #[inline]
    pub fn write_channel(&self, register: ChannelRegister, channel: ChannelNumber, value: u32) {
        self.registers.write32(register.offset(channel as usize), value)
    }

    pub fn frame_number(&self) -> FrameNumber {
        let frame = self.read_copy::<HOST_FRAME_NUMBER::Register>(Register::HostFrameNumber);
        FrameNumber::new(frame.read(HOST_FRAME_NUMBER::FRAME_NUMBER))
    }

    // ========================================================================
    // Interrupt Masks
    // ========================================================================

    pub fn set_start_of_frame_interrupt(&self, enabled: bool) {
        let mut mask = CoreInterrupts::from_bits_retain(self.read(Register::CoreInterruptMask));
        mask.set(CoreInterrupts::START_OF_FRAME, enabled);
        self.write(Register::CoreInterruptMask, mask.bits());
    }

    /// Unmask or mask `channel` in the all-channels interrupt mask.
    pub fn set_channel_interrupt(&self, channel: ChannelNumber, enabled: bool) {
        let mut mask = self.read(Register::HostChannelInterruptMask);
        if enabled {
            mask |= 1 << channel;
        } else {
            mask &= !(1 << channel);
        }
        self.write(Register::HostChannelInterruptMask, mask);
    }

    /// Mask every interrupt of `channel` and acknowledge anything pending.
    pub fn quiesce_channel(&self, channel: ChannelNumber) {
        self.write_channel(ChannelRegister::InterruptMask, channel, 0);
        self.write_channel(ChannelRegister::Interrupt, channel, u32::MAX);
        self.set_channel_interrupt(channel, false);
    }

    // ========================================================================
    // Lock-free State for the Interrupt Handler
    // ========================================================================

    /// Publish the controller's next start-of-frame deadline.
    pub fn publish_next_frame(&self, frame: Option<FrameNumber>) {
        let value = frame.map_or(NO_FRAME, FrameNumber::value);
        self.next_frame_hint.store(value, Ordering::Release);
    }

    pub fn next_frame(&self) -> Option<FrameNumber> {
        match self.next_frame_hint.load(Ordering::Acquire) {
            NO_FRAME => None,
            value => Some(FrameNumber::new(value as u32)),
        }
    }

    pub fn mark_channel_assigned(&self, channel: ChannelNumber, assigned: bool) {
        if assigned {
            self.assigned_channels.fetch_or(1 << channel, Ordering::AcqRel);
        } else {
            self.assigned_channels.fetch_and(!(1 << channel), Ordering::AcqRel);
        }
    }

    pub fn channel_assigned(&self, channel: ChannelNumber) -> bool {
        self.assigned_channels.load(Ordering::Acquire) & (1 << channel) != 0
    }

    // ========================================================================
    // Channel Control
    // ========================================================================

    /// Stop `channel`.
    ///
    /// Returns `true` if the channel was already idle, or `false` if a halt
    /// was requested and will be confirmed by a HALTED interrupt.
    pub fn halt_channel(&self, channel: ChannelNumber) -> bool {
        self.write_channel(
            ChannelRegister::InterruptMask,
            channel,
            ChannelInterrupts::HALTED.bits(),
        );
        self.write_channel(
            ChannelRegister::Interrupt,
            channel,
            !ChannelInterrupts::HALTED.bits(),
        );

        let mut control = LocalRegisterCopy::<u32, CHANNEL_CONTROL::Register>::new(
            self.read_channel(ChannelRegister::Control, channel),
        );
        if !control.is_set(CHANNEL_CONTROL::ENABLE) {
            return true;
        }

        self.set_channel_interrupt(channel, true);
        control.modify(CHANNEL_CONTROL::DISABLE::SET + CHANNEL_CONTROL::ENABLE::SET);
        self.write_channel(ChannelRegister::Control, channel, control.get());
        false
    }

    /// Disable `channel` and wait for the hardware to release it.
    pub fn reset_channel<P: Platform + ?Sized>(
        &self,
        platform: &P,
        channel: ChannelNumber,
    ) -> Result<(), UsbError> {
        let mut control = LocalRegisterCopy::<u32, CHANNEL_CONTROL::Register>::new(
            self.read_channel(ChannelRegister::Control, channel),
        );
        control.modify(
            CHANNEL_CONTROL::ENDPOINT_DIRECTION_IN::CLEAR
                + CHANNEL_CONTROL::ENABLE::SET
                + CHANNEL_CONTROL::DISABLE::SET,
        );
        self.write_channel(ChannelRegister::Control, channel, control.get());

        self.poll(platform, SHORT_POLL_ATTEMPTS, SHORT_POLL_INTERVAL_US, || {
            let control = LocalRegisterCopy::<u32, CHANNEL_CONTROL::Register>::new(
                self.read_channel(ChannelRegister::Control, channel),
            );
            !control.is_set(CHANNEL_CONTROL::ENABLE)
        })
    }

    // ========================================================================
    // Core Reset
    // ========================================================================

    /// Soft reset the core once its AHB master is idle.
    pub fn soft_reset<P: Platform + ?Sized>(&self, platform: &P) -> Result<(), UsbError> {
        self.poll(platform, RESET_POLL_ATTEMPTS, RESET_POLL_INTERVAL_US, || {
            self.read_copy::<CORE_RESET::Register>(Register::CoreReset)
                .is_set(CORE_RESET::AHB_MASTER_IDLE)
        })?;

        let mut reset = self.read_copy::<CORE_RESET::Register>(Register::CoreReset);
        reset.modify(CORE_RESET::CORE_SOFT_RESET::SET);
        self.write(Register::CoreReset, reset.get());

        self.poll(platform, RESET_POLL_ATTEMPTS, RESET_POLL_INTERVAL_US, || {
            !self
                .read_copy::<CORE_RESET::Register>(Register::CoreReset)
                .is_set(CORE_RESET::CORE_SOFT_RESET)
        })?;

        // The core needs time to settle after the reset bit drops.
        platform.delay_us(200_000);
        Ok(())
    }

    /// Flush every transmit FIFO, or the receive FIFO.
    pub fn flush_fifo<P: Platform + ?Sized>(&self, platform: &P, transmit: bool) -> Result<(), UsbError> {
        let mut reset = LocalRegisterCopy::<u32, CORE_RESET::Register>::new(0);
        let busy = if transmit {
            reset.write(CORE_RESET::TRANSMIT_FIFO_NUMBER::All + CORE_RESET::TRANSMIT_FIFO_FLUSH::SET);
            CORE_RESET::TRANSMIT_FIFO_FLUSH
        } else {
            reset.write(CORE_RESET::RECEIVE_FIFO_FLUSH::SET);
            CORE_RESET::RECEIVE_FIFO_FLUSH
        };
        self.write(Register::CoreReset, reset.get());

        self.poll(platform, SHORT_POLL_ATTEMPTS, SHORT_POLL_INTERVAL_US, || {
            !self
                .read_copy::<CORE_RESET::Register>(Register::CoreReset)
                .is_set(busy)
        })?;
        platform.delay_us(SHORT_POLL_INTERVAL_US);
        Ok(())
    }

    fn poll<P: Platform + ?Sized>(
        &self,
        platform: &P,
        attempts: u32,
        interval_us: u64,
        mut done: impl FnMut() -> bool,
    ) -> Result<(), UsbError> {
        for _ in 0..attempts {
            if done() {
                return Ok(());
            }
            platform.delay_us(interval_us);
        }

        if done() { Ok(()) } else { Err(UsbError::Timeout) }
    }
}
