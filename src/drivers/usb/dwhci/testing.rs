//! Register and platform models for unit tests

use super::regs::{
    CHANNEL_REGISTER_BASE, CHANNEL_REGISTER_STRIDE, ChannelInterrupts, ChannelRegister, CoreInterrupts,
    HOST_PORT_WRITE_TO_CLEAR_MASK, Register,
};
use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::{TransferHandle, TransferOutcome};
use crate::platform::{DmaRegion, Platform, RunLevel};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::vec::Vec;

/// Hardware configuration reported by the fake core: internal DMA, UTMI+
/// high speed PHY, eight channels and dynamic FIFOs.
pub const HARDWARE2_DEFAULT: u32 = (2 << 3) | (1 << 6) | (1 << 8) | (7 << 14) | (1 << 19);
/// 19-bit transfer and 10-bit packet counters
pub const HARDWARE3_DEFAULT: u32 = 8 | (6 << 4);
pub const CORE_ID_DEFAULT: u32 = 0x4F54_280A;

const PORT_READ_ONLY_MASK: u32 = (1 << 0) | (1 << 4) | (3 << 10) | (3 << 17);
const CORE_RESET_SELF_CLEARING: u32 = (1 << 0) | (1 << 4) | (1 << 5);
const CHANNEL_ENABLE: u32 = 1 << 31;
const CHANNEL_DISABLE: u32 = 1 << 30;

/// A register file with the write semantics the driver relies on:
/// write-one-to-clear status registers, self-clearing reset bits, and
/// channels that stop as soon as they are disabled.
pub struct FakeRegisters {
    values: Mutex<BTreeMap<usize, u32>>,
    ahb_idle: AtomicBool,
    hold_channel_enable: AtomicBool,
}

impl FakeRegisters {
    pub fn new() -> Self {
        let registers = Self {
            values: Mutex::new(BTreeMap::new()),
            ahb_idle: AtomicBool::new(true),
            hold_channel_enable: AtomicBool::new(false),
        };
        registers.poke(Register::Hardware2, HARDWARE2_DEFAULT);
        registers.poke(Register::Hardware3, HARDWARE3_DEFAULT);
        registers.poke(Register::CoreId, CORE_ID_DEFAULT);
        registers
    }

    pub fn peek(&self, register: Register) -> u32 {
        self.raw(register.offset())
    }

    /// Store a value without write side effects.
    pub fn poke(&self, register: Register, value: u32) {
        self.store(register.offset(), value);
    }

    pub fn peek_channel(&self, register: ChannelRegister, channel: u8) -> u32 {
        self.raw(register.offset(channel as usize))
    }

    pub fn poke_channel(&self, register: ChannelRegister, channel: u8, value: u32) {
        self.store(register.offset(channel as usize), value);
    }

    pub fn set_frame(&self, frame: u32) {
        self.poke(Register::HostFrameNumber, frame & 0x3FFF);
    }

    /// Keep channels enabled after a disable request, as if the halt were
    /// still in progress.
    pub fn hold_channel_enable(&self, hold: bool) {
        self.hold_channel_enable.store(hold, Ordering::SeqCst);
    }

    pub fn set_ahb_idle(&self, idle: bool) {
        self.ahb_idle.store(idle, Ordering::SeqCst);
    }

    /// Latch channel interrupt bits the way the core does.
    pub fn raise_channel(&self, channel: u8, interrupts: ChannelInterrupts) {
        let status = self.peek_channel(ChannelRegister::Interrupt, channel);
        self.poke_channel(ChannelRegister::Interrupt, channel, status | interrupts.bits());
        let all = self.peek(Register::HostChannelInterrupt);
        self.poke(Register::HostChannelInterrupt, all | (1 << channel));
        self.raise_core(CoreInterrupts::HOST_CHANNEL);
    }

    pub fn raise_core(&self, interrupts: CoreInterrupts) {
        let status = self.peek(Register::CoreInterrupt);
        self.poke(Register::CoreInterrupt, status | interrupts.bits());
    }

    fn raw(&self, offset: usize) -> u32 {
        self.values
            .lock()
            .unwrap()
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }

    fn store(&self, offset: usize, value: u32) {
        self.values.lock().unwrap().insert(offset, value);
    }

    fn channel_register(offset: usize) -> Option<(u8, usize)> {
        let end = CHANNEL_REGISTER_BASE + 16 * CHANNEL_REGISTER_STRIDE;
        if !(CHANNEL_REGISTER_BASE..end).contains(&offset) {
            return None;
        }
        let relative = offset - CHANNEL_REGISTER_BASE;
        Some((
            (relative / CHANNEL_REGISTER_STRIDE) as u8,
            relative % CHANNEL_REGISTER_STRIDE,
        ))
    }
}

impl Default for FakeRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAccess for FakeRegisters {
    fn read32(&self, offset: usize) -> u32 {
        let value = self.raw(offset);
        if offset == Register::CoreReset.offset() && self.ahb_idle.load(Ordering::SeqCst) {
            return value | (1 << 31);
        }
        value
    }

    fn write32(&self, offset: usize, value: u32) {
        let old = self.raw(offset);

        if offset == Register::CoreInterrupt.offset() || offset == Register::OtgInterrupt.offset() {
            self.store(offset, old & !value);
        } else if offset == Register::HostChannelInterrupt.offset() {
            // Read only; it follows the channel interrupt registers.
        } else if offset == Register::CoreReset.offset() {
            self.store(offset, value & !CORE_RESET_SELF_CLEARING & !(1 << 31));
        } else if offset == Register::HostPort.offset() {
            let write_to_clear = old & HOST_PORT_WRITE_TO_CLEAR_MASK & !value;
            let writable = value & !PORT_READ_ONLY_MASK & !HOST_PORT_WRITE_TO_CLEAR_MASK;
            self.store(offset, (old & PORT_READ_ONLY_MASK) | writable | write_to_clear);
        } else if let Some((channel, register)) = Self::channel_register(offset) {
            if register == ChannelRegister::Interrupt as usize {
                let remaining = old & !value;
                self.store(offset, remaining);
                if remaining == 0 {
                    let all = self.peek(Register::HostChannelInterrupt);
                    self.poke(Register::HostChannelInterrupt, all & !(1 << channel));
                }
            } else if register == ChannelRegister::Control as usize
                && value & (CHANNEL_ENABLE | CHANNEL_DISABLE) == CHANNEL_ENABLE | CHANNEL_DISABLE
                && !self.hold_channel_enable.load(Ordering::SeqCst)
            {
                self.store(offset, value & !(CHANNEL_ENABLE | CHANNEL_DISABLE));
            } else {
                self.store(offset, value);
            }
        } else {
            self.store(offset, value);
        }
    }
}

/// Platform that records every callback.
pub struct FakePlatform {
    level: Mutex<RunLevel>,
    max_level: Mutex<RunLevel>,
    deferred: AtomicUsize,
    port_changes: AtomicUsize,
    delayed_us: AtomicU64,
    dma_available: AtomicBool,
    completions: Mutex<Vec<(TransferHandle, TransferOutcome)>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            level: Mutex::new(RunLevel::Low),
            max_level: Mutex::new(RunLevel::Low),
            deferred: AtomicUsize::new(0),
            port_changes: AtomicUsize::new(0),
            delayed_us: AtomicU64::new(0),
            dma_available: AtomicBool::new(true),
            completions: Mutex::new(Vec::new()),
        }
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.load(Ordering::SeqCst)
    }

    pub fn port_change_count(&self) -> usize {
        self.port_changes.load(Ordering::SeqCst)
    }

    pub fn delayed_us(&self) -> u64 {
        self.delayed_us.load(Ordering::SeqCst)
    }

    pub fn current_level(&self) -> RunLevel {
        *self.level.lock().unwrap()
    }

    /// Highest run level raised to so far
    pub fn max_level(&self) -> RunLevel {
        *self.max_level.lock().unwrap()
    }

    pub fn set_dma_available(&self, available: bool) {
        self.dma_available.store(available, Ordering::SeqCst);
    }

    pub fn completions(&self) -> Vec<(TransferHandle, TransferOutcome)> {
        self.completions.lock().unwrap().clone()
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for FakePlatform {
    fn raise_run_level(&self, level: RunLevel) -> RunLevel {
        let mut current = self.level.lock().unwrap();
        let previous = *current;
        *current = level;
        let mut max = self.max_level.lock().unwrap();
        *max = (*max).max(level);
        previous
    }

    fn lower_run_level(&self, previous: RunLevel) {
        *self.level.lock().unwrap() = previous;
    }

    fn queue_deferred_work(&self) {
        self.deferred.fetch_add(1, Ordering::SeqCst);
    }

    fn delay_us(&self, microseconds: u64) {
        self.delayed_us.fetch_add(microseconds, Ordering::SeqCst);
    }

    fn allocate_dma(&self, size: usize, _alignment: usize) -> Option<DmaRegion> {
        self.dma_available.load(Ordering::SeqCst).then_some(DmaRegion {
            virtual_address: 0x10_0000,
            physical_address: 0x8000,
            size,
        })
    }

    fn port_changed(&self) {
        self.port_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn transfer_completed(&self, transfer: TransferHandle, outcome: TransferOutcome) {
        self.completions.lock().unwrap().push((transfer, outcome));
    }

    fn wait(&self) {
        std::thread::yield_now();
    }
}
