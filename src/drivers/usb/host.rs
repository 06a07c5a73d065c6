//! USB bus-facing types
//!
//! Types shared between the USB core (enumeration, hub and class drivers)
//! and host controller drivers: speeds, transfer descriptors, root hub port
//! status, the setup packet, and the [`HostController`] interface.

use bitflags::bitflags;
use core::fmt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// ============================================================================
// Basic Types
// ============================================================================

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low speed (1.5 Mbps)
    Low,
    /// Full speed (12 Mbps)
    Full,
    /// High speed (480 Mbps)
    High,
}

impl UsbSpeed {
    /// True for the speeds that need a transaction translator behind a
    /// high-speed hub.
    pub const fn is_low_or_full(self) -> bool {
        matches!(self, UsbSpeed::Low | UsbSpeed::Full)
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Interrupt and isochronous endpoints run on the periodic schedule.
    pub const fn is_periodic(self) -> bool {
        matches!(self, TransferType::Interrupt | TransferType::Isochronous)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// USB transfer and controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// The transfer was cancelled before it finished
    Cancelled,
    /// The device returned a STALL handshake
    Stall,
    /// CRC failure, timeout or other transaction error
    CrcOrTimeout,
    /// The device sent more data than expected
    Babble,
    /// The DMA engine could not access the data buffer
    DataBuffer,
    /// Data toggle mismatch
    DataToggle,
    /// The transaction ran past the end of its frame
    FrameOverrun,
    /// The controller reported a bus (AHB) error
    DeviceIo,
    /// Invalid parameter
    InvalidParameter,
    /// Out of memory or other allocation failure
    NoResources,
    /// The operation can no longer be performed
    TooLate,
    /// The operation is not implemented for this transfer type
    NotImplemented,
    /// The controller hardware is not supported
    NotSupported,
    /// The controller reported an unrecognized configuration
    InvalidConfiguration,
    /// The hardware did not respond in time
    Timeout,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UsbError::Cancelled => "transfer cancelled",
            UsbError::Stall => "endpoint stalled",
            UsbError::CrcOrTimeout => "CRC or timeout error",
            UsbError::Babble => "babble detected",
            UsbError::DataBuffer => "data buffer error",
            UsbError::DataToggle => "data toggle mismatch",
            UsbError::FrameOverrun => "frame overrun",
            UsbError::DeviceIo => "device I/O error",
            UsbError::InvalidParameter => "invalid parameter",
            UsbError::NoResources => "insufficient resources",
            UsbError::TooLate => "too late",
            UsbError::NotImplemented => "not implemented",
            UsbError::NotSupported => "not supported",
            UsbError::InvalidConfiguration => "invalid configuration",
            UsbError::Timeout => "timeout",
        };
        f.write_str(text)
    }
}

bitflags! {
    /// Per-transfer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferFlags: u32 {
        /// End the transfer with a short (possibly zero-length) packet when
        /// the data would otherwise end on a packet boundary.
        const FORCE_SHORT_TRANSFER = 1 << 3;
    }
}

// ============================================================================
// Handles and Descriptors
// ============================================================================

/// Handle to an endpoint created on a host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub(crate) usize);

/// Handle to a transfer created on a host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub(crate) usize);

/// Parameters describing a new endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRequest {
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub speed: UsbSpeed,
    /// Endpoint number, 0-15
    pub endpoint_number: u8,
    pub max_packet_size: u32,
    /// Polling interval in (micro)frames, as seen by the endpoint's speed
    pub poll_rate: u32,
    /// Address of the high-speed hub the device hangs off, 0 for the root port
    pub hub_address: u8,
    /// Port number on that hub
    pub hub_port_number: u8,
}

/// One submission of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    /// Total length in bytes, including the setup packet for control
    /// transfers
    pub length: u32,
    /// Physical address of the data buffer
    pub buffer_physical_address: u64,
    pub device_address: u8,
    pub flags: TransferFlags,
}

/// Result of a completed (or failed, or cancelled) transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes moved before completion or failure
    pub length_transferred: u32,
    pub result: Result<(), UsbError>,
}

// ============================================================================
// Root Hub Status
// ============================================================================

bitflags! {
    /// Root port status bits. Change bits use the same values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatusBits: u16 {
        const CONNECTED = 1 << 0;
        const ENABLED = 1 << 1;
        const SUSPENDED = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
    }
}

/// Software view of a root hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    pub status: PortStatusBits,
    /// Bits that changed since last acknowledged by the hub driver
    pub change: PortStatusBits,
    /// Speed of the attached device, if connected
    pub speed: Option<UsbSpeed>,
}

// ============================================================================
// Setup Packet
// ============================================================================

/// Standard request codes
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_CONFIGURATION: u8 = 9;
}

/// Request type bits
pub mod req_type {
    pub const DIR_OUT: u8 = 0x00;
    pub const DIR_IN: u8 = 0x80;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
}

/// Size of a setup packet on the wire
pub const SETUP_PACKET_SIZE: u32 = 8;

/// USB setup packet (8 bytes, little endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// SET_ADDRESS: no data stage
    pub const fn set_address(address: u8) -> Self {
        Self::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RECIPIENT_DEVICE,
            request::SET_ADDRESS,
            address as u16,
            0,
            0,
        )
    }

    /// GET_DESCRIPTOR into a `length` byte buffer
    pub const fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self::new(
            req_type::DIR_IN | req_type::TYPE_STANDARD | req_type::RECIPIENT_DEVICE,
            request::GET_DESCRIPTOR,
            ((descriptor_type as u16) << 8) | index as u16,
            0,
            length,
        )
    }

    /// SET_CONFIGURATION: no data stage
    pub const fn set_configuration(configuration: u8) -> Self {
        Self::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RECIPIENT_DEVICE,
            request::SET_CONFIGURATION,
            configuration as u16,
            0,
            0,
        )
    }

    /// Direction of the data stage
    pub const fn direction(&self) -> Direction {
        if self.request_type & req_type::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Total control transfer length: setup packet plus data stage.
    pub const fn transfer_length(&self) -> u32 {
        let length = self.length;
        SETUP_PACKET_SIZE + length as u32
    }
}

// ============================================================================
// Host Controller Interface
// ============================================================================

/// Operations a host controller driver provides to the USB core.
///
/// Completion of asynchronous submissions is reported through the
/// controller's platform hooks, not through this trait.
pub trait HostController {
    /// Create scheduling state for a device endpoint.
    fn create_endpoint(&self, request: &EndpointRequest) -> Result<EndpointHandle, UsbError>;

    /// Reset an endpoint's data toggle and adopt a new max packet size.
    fn reset_endpoint(&self, endpoint: EndpointHandle, max_packet_size: u32) -> Result<(), UsbError>;

    /// Destroy an endpoint. It must have no queued transfers.
    fn destroy_endpoint(&self, endpoint: EndpointHandle) -> Result<(), UsbError>;

    /// Create a transfer able to carry up to `max_buffer_size` bytes.
    fn create_transfer(
        &self,
        endpoint: EndpointHandle,
        max_buffer_size: u32,
        flags: TransferFlags,
    ) -> Result<TransferHandle, UsbError>;

    /// Destroy a transfer that is not in flight.
    fn destroy_transfer(&self, transfer: TransferHandle) -> Result<(), UsbError>;

    /// Queue a transfer. Returns once it is on the schedule.
    fn submit_transfer(&self, transfer: TransferHandle, request: &TransferRequest) -> Result<(), UsbError>;

    /// Queue a transfer and wait for it to finish.
    fn submit_transfer_sync(
        &self,
        transfer: TransferHandle,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, UsbError>;

    /// Cancel a queued or running transfer.
    fn cancel_transfer(&self, transfer: TransferHandle) -> Result<(), UsbError>;

    /// Refresh the root port status and accumulate change bits.
    fn get_root_hub_status(&self, port: &mut PortStatus) -> Result<(), UsbError>;

    /// Apply the requested root port changes.
    fn set_root_hub_status(&self, port: &mut PortStatus) -> Result<(), UsbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_layout() {
        let packet = SetupPacket::get_descriptor(1, 0, 18);
        assert_eq!(packet.as_bytes(), &[0x80, 6, 0, 1, 0, 0, 18, 0]);
        assert_eq!(packet.direction(), Direction::In);
        assert_eq!(packet.transfer_length(), 26);

        let parsed = SetupPacket::read_from_bytes(&[0x00, 5, 7, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(parsed, SetupPacket::set_address(7));
        assert_eq!(parsed.direction(), Direction::Out);
        assert_eq!(parsed.transfer_length(), SETUP_PACKET_SIZE);
    }

    #[test]
    fn periodic_types() {
        assert!(TransferType::Interrupt.is_periodic());
        assert!(TransferType::Isochronous.is_periodic());
        assert!(!TransferType::Bulk.is_periodic());
        assert!(!TransferType::Control.is_periodic());
    }
}
