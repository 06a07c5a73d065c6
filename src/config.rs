//! Controller configuration
//!
//! [`ControllerConfig`] carries the parameters the scheduler depends on. They
//! normally come from the core's hardware configuration registers
//! ([`ControllerConfig::from_hardware`]) and can be overridden by the
//! platform, e.g. to force a full-speed PHY.

use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::UsbSpeed;
use crate::drivers::usb::dwhci::regs::{HARDWARE2, HARDWARE3, Register};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of host channels the driver manages
pub const MAX_CHANNELS: usize = 16;

/// Microframes between submitting to an idle periodic endpoint and its
/// first scheduling slot, unless its poll rate is shorter.
pub const DEFAULT_FRAME_OFFSET: u32 = 15;

bitflags! {
    /// Runtime switches for verbose driver tracing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Log root port status reads and writes
        const PORTS = 1 << 0;
        /// Log every hardware transfer as it is built and completed
        const TRANSFERS = 1 << 1;
        /// Log endpoint schedule transitions
        const SCHEDULE = 1 << 2;
    }
}

static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0);

/// Currently enabled debug flags
pub fn debug_flags() -> DebugFlags {
    DebugFlags::from_bits_truncate(DEBUG_FLAGS.load(Ordering::Relaxed))
}

/// Replace the enabled debug flags
pub fn set_debug_flags(flags: DebugFlags) {
    DEBUG_FLAGS.store(flags.bits(), Ordering::Relaxed);
}

/// Static parameters of one controller instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of host channels, at most [`MAX_CHANNELS`]
    pub channel_count: usize,
    /// Operating speed of the root port
    pub speed: UsbSpeed,
    /// Largest byte count one channel transfer may carry
    pub max_transfer_size: u32,
    /// Largest packet count one channel transfer may carry
    pub max_packet_count: u32,
    /// Core revision from the Synopsys ID register
    pub revision: u32,
    /// Offset used to place the first slot of a newly active periodic
    /// endpoint
    pub frame_offset: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            channel_count: 8,
            speed: UsbSpeed::High,
            max_transfer_size: 0x7FFFF,
            max_packet_count: 0x3FF,
            revision: 0,
            frame_offset: DEFAULT_FRAME_OFFSET,
        }
    }
}

impl ControllerConfig {
    /// Read the channel count, counter widths and revision from the core.
    pub fn from_hardware<R: RegisterAccess + ?Sized>(registers: &R, speed: UsbSpeed) -> Self {
        let hardware2 = registers.read32(Register::Hardware2.offset());
        let hardware3 = registers.read32(Register::Hardware3.offset());
        let revision = registers.read32(Register::CoreId.offset());

        let channel_count = HARDWARE2::HOST_CHANNEL_COUNT.read(hardware2) as usize + 1;
        let transfer_width = HARDWARE3::TRANSFER_SIZE_WIDTH.read(hardware3) + 11;
        let packet_width = HARDWARE3::PACKET_SIZE_WIDTH.read(hardware3) + 4;

        Self {
            channel_count: channel_count.min(MAX_CHANNELS),
            speed,
            max_transfer_size: (1u32 << transfer_width) - 1,
            max_packet_count: (1u32 << packet_width) - 1,
            revision,
            frame_offset: DEFAULT_FRAME_OFFSET,
        }
    }

    pub fn with_channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count.clamp(1, MAX_CHANNELS);
        self
    }

    pub fn with_speed(mut self, speed: UsbSpeed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_max_transfer_size(mut self, max_transfer_size: u32) -> Self {
        self.max_transfer_size = max_transfer_size;
        self
    }

    pub fn with_max_packet_count(mut self, max_packet_count: u32) -> Self {
        self.max_packet_count = max_packet_count;
        self
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}
