//! DWHCI Register Definitions using tock-registers
//!
//! This module defines the DesignWare Hi-Speed USB 2.0 On-The-Go core
//! registers used in host mode: the global core block, the host block, the
//! root port, and the per-channel register sets.
//!
//! # References
//! - DesignWare Cores USB 2.0 Hi-Speed On-The-Go (OTG) Databook

use bitflags::bitflags;
use tock_registers::register_bitfields;

// ============================================================================
// Register Offsets
// ============================================================================

/// Core and host register offsets from the controller base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Register {
    /// OTG Control and Status (GOTGCTL)
    OtgControl = 0x000,
    /// OTG Interrupt (GOTGINT)
    OtgInterrupt = 0x004,
    /// AHB Configuration (GAHBCFG)
    AhbConfiguration = 0x008,
    /// USB Configuration (GUSBCFG)
    UsbConfiguration = 0x00C,
    /// Core Reset (GRSTCTL)
    CoreReset = 0x010,
    /// Core Interrupt (GINTSTS)
    CoreInterrupt = 0x014,
    /// Core Interrupt Mask (GINTMSK)
    CoreInterruptMask = 0x018,
    /// Receive FIFO Size (GRXFSIZ)
    ReceiveFifoSize = 0x024,
    /// Non-Periodic Transmit FIFO Size (GNPTXFSIZ)
    NonPeriodicFifoSize = 0x028,
    /// Synopsys ID (GSNPSID)
    CoreId = 0x040,
    /// User Hardware Configuration 1 (GHWCFG1)
    Hardware1 = 0x044,
    /// User Hardware Configuration 2 (GHWCFG2)
    Hardware2 = 0x048,
    /// User Hardware Configuration 3 (GHWCFG3)
    Hardware3 = 0x04C,
    /// User Hardware Configuration 4 (GHWCFG4)
    Hardware4 = 0x050,
    /// Host Periodic Transmit FIFO Size (HPTXFSIZ)
    PeriodicFifoSize = 0x100,
    /// Host Configuration (HCFG)
    HostConfiguration = 0x400,
    /// Host Frame Interval (HFIR)
    HostFrameInterval = 0x404,
    /// Host Frame Number / Frame Time Remaining (HFNUM)
    HostFrameNumber = 0x408,
    /// Host All Channels Interrupt (HAINT)
    HostChannelInterrupt = 0x414,
    /// Host All Channels Interrupt Mask (HAINTMSK)
    HostChannelInterruptMask = 0x418,
    /// Host Port Control and Status (HPRT)
    HostPort = 0x440,
    /// Power and Clock Gating Control (PCGCCTL)
    PowerAndClock = 0xE00,
}

impl Register {
    /// Byte offset of the register
    pub const fn offset(self) -> usize {
        self as usize
    }
}

/// Offset of channel 0's register set
pub const CHANNEL_REGISTER_BASE: usize = 0x500;

/// Size of one channel register set
pub const CHANNEL_REGISTER_STRIDE: usize = 0x20;

/// Per-channel register offsets within a channel register set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ChannelRegister {
    /// Channel Characteristics (HCCHARn)
    Control = 0x00,
    /// Channel Split Control (HCSPLTn)
    SplitControl = 0x04,
    /// Channel Interrupt (HCINTn)
    Interrupt = 0x08,
    /// Channel Interrupt Mask (HCINTMSKn)
    InterruptMask = 0x0C,
    /// Channel Transfer Size (HCTSIZn)
    Token = 0x10,
    /// Channel DMA Address (HCDMAn)
    DmaAddress = 0x14,
}

impl ChannelRegister {
    /// Byte offset of this register for `channel`
    pub const fn offset(self, channel: usize) -> usize {
        CHANNEL_REGISTER_BASE + channel * CHANNEL_REGISTER_STRIDE + self as usize
    }
}

// ============================================================================
// Global Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// OTG Control and Status (GOTGCTL) - offset 0x000
    pub OTG_CONTROL [
        /// Host Set HNP Enable
        HOST_SET_HNP_ENABLE OFFSET(10) NUMBITS(1) []
    ],

    /// AHB Configuration (GAHBCFG) - offset 0x008
    pub AHB_CONFIGURATION [
        /// Global Interrupt Enable
        INTERRUPT_ENABLE OFFSET(0) NUMBITS(1) [],
        /// AXI/AHB Burst Length
        BURST_LENGTH OFFSET(1) NUMBITS(4) [],
        /// DMA Enable
        DMA_ENABLE OFFSET(5) NUMBITS(1) [],
        /// DMA Remainder Mode
        DMA_REMAINDER_MODE OFFSET(23) NUMBITS(1) [
            Incremental = 0,
            Single = 1
        ]
    ],

    /// USB Configuration (GUSBCFG) - offset 0x00C
    pub USB_CONFIGURATION [
        /// PHY Interface is 16 bits wide
        PHY_INTERFACE_16 OFFSET(3) NUMBITS(1) [],
        /// ULPI or UTMI+ select
        MODE_SELECT OFFSET(4) NUMBITS(1) [
            Utmi = 0,
            Ulpi = 1
        ],
        /// USB 2.0 High-Speed PHY or USB 1.1 Full-Speed Serial Transceiver Select
        PHY_SELECT OFFSET(6) NUMBITS(1) [],
        /// ULPI DDR Select
        DDR_SELECT OFFSET(7) NUMBITS(1) [],
        /// SRP Capable
        SRP_CAPABLE OFFSET(8) NUMBITS(1) [],
        /// HNP Capable
        HNP_CAPABLE OFFSET(9) NUMBITS(1) [],
        /// ULPI FS/LS Select
        ULPI_FULL_SPEED_LOW_SPEED_SELECT OFFSET(17) NUMBITS(1) [],
        /// ULPI Clock SuspendM
        ULPI_CLOCK_SUSPEND_MODE OFFSET(19) NUMBITS(1) [],
        /// ULPI External VBUS Drive
        ULPI_DRIVER_EXTERNAL_VBUS OFFSET(20) NUMBITS(1) [],
        /// TermSel DLine Pulsing Selection
        TS_DLINE_PULSE_ENABLE OFFSET(22) NUMBITS(1) []
    ],

    /// Core Reset (GRSTCTL) - offset 0x010
    pub CORE_RESET [
        /// Core Soft Reset
        CORE_SOFT_RESET OFFSET(0) NUMBITS(1) [],
        /// RxFIFO Flush
        RECEIVE_FIFO_FLUSH OFFSET(4) NUMBITS(1) [],
        /// TxFIFO Flush
        TRANSMIT_FIFO_FLUSH OFFSET(5) NUMBITS(1) [],
        /// TxFIFO Number
        TRANSMIT_FIFO_NUMBER OFFSET(6) NUMBITS(5) [
            NonPeriodic = 0x00,
            All = 0x10
        ],
        /// AHB Master Idle
        AHB_MASTER_IDLE OFFSET(31) NUMBITS(1) []
    ],

    /// User Hardware Configuration 2 (GHWCFG2) - offset 0x048
    pub HARDWARE2 [
        /// Mode of Operation
        MODE OFFSET(0) NUMBITS(3) [
            HnpSrp = 0,
            SrpOnly = 1,
            NoHnpSrp = 2,
            SrpDevice = 3,
            NoSrpDevice = 4,
            SrpHost = 5,
            NoSrpHost = 6
        ],
        /// Architecture
        ARCHITECTURE OFFSET(3) NUMBITS(2) [
            SlaveOnly = 0,
            ExternalDma = 1,
            InternalDma = 2
        ],
        /// High-Speed PHY Interface Type
        HIGH_SPEED OFFSET(6) NUMBITS(2) [
            NotSupported = 0,
            Utmi = 1,
            Ulpi = 2,
            UtmiUlpi = 3
        ],
        /// Full-Speed PHY Interface Type
        FULL_SPEED OFFSET(8) NUMBITS(2) [
            NotSupported = 0,
            Dedicated = 1,
            Utmi = 2,
            Ulpi = 3
        ],
        /// Number of Host Channels minus one
        HOST_CHANNEL_COUNT OFFSET(14) NUMBITS(4) [],
        /// Dynamic FIFO Sizing Enabled
        DYNAMIC_FIFO OFFSET(19) NUMBITS(1) []
    ],

    /// User Hardware Configuration 3 (GHWCFG3) - offset 0x04C
    pub HARDWARE3 [
        /// Width of Transfer Size Counters (field value + 11 bits)
        TRANSFER_SIZE_WIDTH OFFSET(0) NUMBITS(4) [],
        /// Width of Packet Size Counters (field value + 4 bits)
        PACKET_SIZE_WIDTH OFFSET(4) NUMBITS(3) []
    ],

    /// User Hardware Configuration 4 (GHWCFG4) - offset 0x050
    pub HARDWARE4 [
        /// UTMI+ PHY Data Width
        UTMI_PHYSICAL_DATA_WIDTH OFFSET(14) NUMBITS(2) [
            Width8Bit = 0,
            Width16Bit = 1,
            Width8Or16Bit = 2
        ],
        /// Scatter/Gather DMA configuration
        DMA_DESCRIPTOR_MODE OFFSET(30) NUMBITS(1) []
    ]
];

// ============================================================================
// Host Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Host Configuration (HCFG) - offset 0x400
    pub HOST_CONFIGURATION [
        /// FS/LS PHY Clock Select
        CLOCK_RATE OFFSET(0) NUMBITS(2) [
            Clock30Or60MHz = 0,
            Clock48MHz = 1
        ],
        /// FS- and LS-Only Support
        FULL_SPEED_LOW_SPEED_ONLY OFFSET(2) NUMBITS(1) [],
        /// Enable Scatter/Gather DMA in Host mode
        ENABLE_DMA_DESCRIPTOR OFFSET(23) NUMBITS(1) []
    ],

    /// Host Frame Number (HFNUM) - offset 0x408
    pub HOST_FRAME_NUMBER [
        /// Frame Number (microframes in high-speed operation)
        FRAME_NUMBER OFFSET(0) NUMBITS(14) [],
        /// Frame Time Remaining
        FRAME_TIME_REMAINING OFFSET(16) NUMBITS(16) []
    ],

    /// Host Port Control and Status (HPRT) - offset 0x440
    pub HOST_PORT [
        /// Port Connect Status
        CONNECT_STATUS OFFSET(0) NUMBITS(1) [],
        /// Port Connect Detected (W1C)
        CONNECT_STATUS_CHANGE OFFSET(1) NUMBITS(1) [],
        /// Port Enable (W1C, writing one disables the port)
        ENABLE OFFSET(2) NUMBITS(1) [],
        /// Port Enable/Disable Change (W1C)
        ENABLE_CHANGE OFFSET(3) NUMBITS(1) [],
        /// Port Overcurrent Active
        OVER_CURRENT_ACTIVE OFFSET(4) NUMBITS(1) [],
        /// Port Overcurrent Change (W1C)
        OVER_CURRENT_CHANGE OFFSET(5) NUMBITS(1) [],
        /// Port Resume
        RESUME OFFSET(6) NUMBITS(1) [],
        /// Port Suspend
        SUSPEND OFFSET(7) NUMBITS(1) [],
        /// Port Reset
        RESET OFFSET(8) NUMBITS(1) [],
        /// Port Power
        POWER OFFSET(12) NUMBITS(1) [],
        /// Port Speed
        SPEED OFFSET(17) NUMBITS(2) [
            High = 0,
            Full = 1,
            Low = 2
        ]
    ]
];

/// Host port bits that are cleared by writing one.
pub const HOST_PORT_WRITE_TO_CLEAR_MASK: u32 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 5);

/// Host port change bits that raise the core port interrupt.
pub const HOST_PORT_INTERRUPT_MASK: u32 = (1 << 1) | (1 << 3) | (1 << 5);

// ============================================================================
// Channel Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Channel Characteristics (HCCHARn)
    pub CHANNEL_CONTROL [
        /// Maximum Packet Size
        MAX_PACKET_SIZE OFFSET(0) NUMBITS(11) [],
        /// Endpoint Number
        ENDPOINT OFFSET(11) NUMBITS(4) [],
        /// Endpoint Direction
        ENDPOINT_DIRECTION_IN OFFSET(15) NUMBITS(1) [],
        /// Low-Speed Device
        LOW_SPEED OFFSET(17) NUMBITS(1) [],
        /// Endpoint Type
        ENDPOINT_TYPE OFFSET(18) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        /// Multi Count / Error Count (packets per microframe)
        PACKETS_PER_FRAME OFFSET(20) NUMBITS(2) [],
        /// Device Address
        DEVICE_ADDRESS OFFSET(22) NUMBITS(7) [],
        /// Odd Frame
        ODD_FRAME OFFSET(29) NUMBITS(1) [],
        /// Channel Disable
        DISABLE OFFSET(30) NUMBITS(1) [],
        /// Channel Enable
        ENABLE OFFSET(31) NUMBITS(1) []
    ],

    /// Channel Split Control (HCSPLTn)
    pub CHANNEL_SPLIT_CONTROL [
        /// Port Address on the transaction translator's hub
        PORT_ADDRESS OFFSET(0) NUMBITS(7) [],
        /// Hub Address of the transaction translator
        HUB_ADDRESS OFFSET(7) NUMBITS(7) [],
        /// Transaction Position
        POSITION OFFSET(14) NUMBITS(2) [
            Middle = 0,
            End = 1,
            Begin = 2,
            All = 3
        ],
        /// Do Complete Split
        COMPLETE_SPLIT OFFSET(16) NUMBITS(1) [],
        /// Split Enable
        ENABLE OFFSET(31) NUMBITS(1) []
    ],

    /// Channel Transfer Size (HCTSIZn)
    pub CHANNEL_TOKEN [
        /// Transfer Size in bytes
        TRANSFER_SIZE OFFSET(0) NUMBITS(19) [],
        /// Packet Count
        PACKET_COUNT OFFSET(19) NUMBITS(10) [],
        /// PID
        PID OFFSET(29) NUMBITS(2) [
            Data0 = 0,
            Data2 = 1,
            Data1 = 2,
            Setup = 3
        ],
        /// Do Ping
        PING OFFSET(31) NUMBITS(1) []
    ]
];

/// PID codes as carried in the channel token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Pid {
    Data0 = 0,
    Data2 = 1,
    Data1 = 2,
    /// SETUP for control transfers, MDATA otherwise
    Setup = 3,
}

impl Pid {
    /// Decode a two-bit token PID field.
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Pid::Data0,
            1 => Pid::Data2,
            2 => Pid::Data1,
            _ => Pid::Setup,
        }
    }
}

// ============================================================================
// Interrupt Bits
// ============================================================================

bitflags! {
    /// Core interrupt bits (GINTSTS / GINTMSK)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CoreInterrupts: u32 {
        /// Start of (micro)Frame
        const START_OF_FRAME = 1 << 3;
        /// Host Port
        const PORT = 1 << 24;
        /// Host Channels
        const HOST_CHANNEL = 1 << 25;
        /// Disconnect Detected
        const DISCONNECT = 1 << 29;
    }
}

impl CoreInterrupts {
    /// Interrupts unmasked once the controller is initialized
    pub const INITIAL_MASK: Self = Self::DISCONNECT.union(Self::PORT).union(Self::HOST_CHANNEL);
}

bitflags! {
    /// Channel interrupt bits (HCINTn / HCINTMSKn)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelInterrupts: u32 {
        /// Transfer Completed
        const TRANSFER_COMPLETE = 1 << 0;
        /// Channel Halted
        const HALTED = 1 << 1;
        /// AHB Error
        const AHB_ERROR = 1 << 2;
        /// STALL Response Received
        const STALL = 1 << 3;
        /// NAK Response Received
        const NAK = 1 << 4;
        /// ACK Response Received
        const ACK = 1 << 5;
        /// NYET Response Received
        const NOT_YET = 1 << 6;
        /// Transaction Error
        const TRANSACTION_ERROR = 1 << 7;
        /// Babble Error
        const BABBLE_ERROR = 1 << 8;
        /// Frame Overrun
        const FRAME_OVERRUN = 1 << 9;
        /// Data Toggle Error
        const DATA_TOGGLE_ERROR = 1 << 10;
        /// Buffer Not Available
        const DMA_BUFFER_NOT_AVAILABLE = 1 << 11;
    }
}

impl ChannelInterrupts {
    /// Bits that indicate a failed transaction
    pub const ERROR_MASK: Self = Self::AHB_ERROR
        .union(Self::STALL)
        .union(Self::TRANSACTION_ERROR)
        .union(Self::BABBLE_ERROR)
        .union(Self::FRAME_OVERRUN)
        .union(Self::DATA_TOGGLE_ERROR)
        .union(Self::DMA_BUFFER_NOT_AVAILABLE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tock_registers::LocalRegisterCopy;

    #[test]
    fn channel_register_offsets() {
        assert_eq!(ChannelRegister::Control.offset(0), 0x500);
        assert_eq!(ChannelRegister::Token.offset(0), 0x510);
        assert_eq!(ChannelRegister::Interrupt.offset(3), 0x568);
        assert_eq!(ChannelRegister::DmaAddress.offset(15), 0x6F4);
    }

    #[test]
    fn token_fields_pack_like_hardware() {
        let mut token = LocalRegisterCopy::<u32, CHANNEL_TOKEN::Register>::new(0);
        token.write(
            CHANNEL_TOKEN::PACKET_COUNT.val(1)
                + CHANNEL_TOKEN::PID::Setup
                + CHANNEL_TOKEN::TRANSFER_SIZE.val(8),
        );
        assert_eq!(token.get(), (1 << 19) | (3 << 29) | 8);
        assert_eq!(Pid::from_bits(token.read(CHANNEL_TOKEN::PID)), Pid::Setup);
    }

    #[test]
    fn write_to_clear_mask_covers_port_change_bits() {
        assert_eq!(HOST_PORT_WRITE_TO_CLEAR_MASK, 0x2E);
        assert_eq!(HOST_PORT_INTERRUPT_MASK & !HOST_PORT_WRITE_TO_CLEAR_MASK, 0);
        assert_eq!(
            CoreInterrupts::INITIAL_MASK.bits(),
            (1 << 24) | (1 << 25) | (1 << 29)
        );
    }
}
