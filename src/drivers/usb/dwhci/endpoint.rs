//! Endpoint scheduling state
//!
//! An endpoint carries the precomputed channel characteristics and split
//! control words, the data toggle, the PING flag, periodic timing, and the
//! FIFO of transfer sets waiting to run. At any moment it sits on at most one
//! of the controller's five schedule lists.

use super::channel::ChannelNumber;
use super::frame::{FRAME_NUMBER_MAX, FrameNumber, MICROFRAMES_PER_FRAME_SHIFT};
use super::regs::{CHANNEL_CONTROL, CHANNEL_SPLIT_CONTROL, Pid};
use crate::config::ControllerConfig;
use crate::drivers::usb::{Direction, EndpointRequest, TransferHandle, TransferType, UsbError, UsbSpeed};
use alloc::collections::VecDeque;
use tock_registers::LocalRegisterCopy;

/// Schedule lists an endpoint can occupy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleList {
    NonPeriodicReady,
    NonPeriodicActive,
    /// Waiting for its next (micro)frame
    PeriodicInactive,
    /// Its frame arrived; waiting for a channel
    PeriodicReady,
    PeriodicActive,
}

pub(crate) struct Endpoint {
    pub transfer_type: TransferType,
    pub speed: UsbSpeed,
    pub direction: Direction,
    /// Channel characteristics, minus the per-transfer direction and odd
    /// frame bits
    pub channel_control: LocalRegisterCopy<u32, CHANNEL_CONTROL::Register>,
    /// Zero unless the endpoint uses split transactions
    pub split_control: LocalRegisterCopy<u32, CHANNEL_SPLIT_CONTROL::Register>,
    pub data_toggle: Pid,
    pub ping_required: bool,
    /// Poll interval in controller (micro)frames
    pub poll_rate: u32,
    pub next_frame: FrameNumber,
    /// Frame in which the current start split was issued
    pub start_frame: FrameNumber,
    pub max_packet_size: u32,
    pub max_packet_count: u32,
    pub max_transfer_size: u32,
    /// A transfer is programmed into the channel
    pub scheduled: bool,
    pub channel: Option<ChannelNumber>,
    pub list: Option<ScheduleList>,
    pub transfer_sets: VecDeque<TransferHandle>,
}

impl Endpoint {
    pub fn new(request: &EndpointRequest, config: &ControllerConfig) -> Result<Self, UsbError> {
        if request.endpoint_number > 15 || request.max_packet_size == 0 {
            return Err(UsbError::InvalidParameter);
        }

        let controller_high_speed = config.speed == UsbSpeed::High;
        let mut poll_rate = request.poll_rate;

        // Full and low speed intervals are in 1ms frames; the high speed
        // counter runs in 125us microframes.
        if controller_high_speed && request.speed.is_low_or_full() {
            poll_rate = (poll_rate << MICROFRAMES_PER_FRAME_SHIFT) & FRAME_NUMBER_MAX as u32;
        }

        let ping_required = request.speed == UsbSpeed::High
            && request.transfer_type == TransferType::Bulk
            && request.direction == Direction::Out;

        let mut split_control = LocalRegisterCopy::new(0);
        if controller_high_speed && request.hub_address != 0 && request.speed.is_low_or_full() {
            split_control.write(
                CHANNEL_SPLIT_CONTROL::PORT_ADDRESS.val(request.hub_port_number as u32)
                    + CHANNEL_SPLIT_CONTROL::HUB_ADDRESS.val(request.hub_address as u32)
                    + CHANNEL_SPLIT_CONTROL::POSITION::All
                    + CHANNEL_SPLIT_CONTROL::ENABLE::SET,
            );
        }

        let endpoint_type = match request.transfer_type {
            TransferType::Control => CHANNEL_CONTROL::ENDPOINT_TYPE::Control,
            TransferType::Isochronous => CHANNEL_CONTROL::ENDPOINT_TYPE::Isochronous,
            TransferType::Bulk => CHANNEL_CONTROL::ENDPOINT_TYPE::Bulk,
            TransferType::Interrupt => CHANNEL_CONTROL::ENDPOINT_TYPE::Interrupt,
        };

        let mut channel_control = LocalRegisterCopy::new(0);
        channel_control.write(
            CHANNEL_CONTROL::ENDPOINT.val(request.endpoint_number as u32)
                + endpoint_type
                + CHANNEL_CONTROL::PACKETS_PER_FRAME.val(1)
                + CHANNEL_CONTROL::ENABLE::SET,
        );
        if request.speed == UsbSpeed::Low {
            channel_control.modify(CHANNEL_CONTROL::LOW_SPEED::SET);
        }

        let mut endpoint = Self {
            transfer_type: request.transfer_type,
            speed: request.speed,
            direction: request.direction,
            channel_control,
            split_control,
            data_toggle: Pid::Data0,
            ping_required,
            poll_rate,
            next_frame: FrameNumber::default(),
            start_frame: FrameNumber::default(),
            max_packet_size: 0,
            max_packet_count: 0,
            max_transfer_size: 0,
            scheduled: false,
            channel: None,
            list: None,
            transfer_sets: VecDeque::new(),
        };
        endpoint.set_max_packet_size(request.max_packet_size, config)?;
        Ok(endpoint)
    }

    /// Adopt a new max packet size and recompute the per-transfer limits.
    pub fn set_max_packet_size(&mut self, max_packet_size: u32, config: &ControllerConfig) -> Result<(), UsbError> {
        if max_packet_size == 0 || max_packet_size > 0x7FF {
            return Err(UsbError::InvalidParameter);
        }

        let max_packet_count = (config.max_transfer_size / max_packet_size).min(config.max_packet_count);
        if max_packet_count == 0 {
            return Err(UsbError::InvalidParameter);
        }

        self.max_packet_size = max_packet_size;
        self.max_packet_count = max_packet_count;
        self.max_transfer_size = max_packet_count * max_packet_size;
        self.channel_control
            .modify(CHANNEL_CONTROL::MAX_PACKET_SIZE.val(max_packet_size));
        Ok(())
    }

    /// Reset the data toggle, and adopt a new max packet size if it changed.
    pub fn reset(&mut self, max_packet_size: u32, config: &ControllerConfig) -> Result<(), UsbError> {
        self.data_toggle = Pid::Data0;
        if max_packet_size != self.max_packet_size {
            self.set_max_packet_size(max_packet_size, config)?;
        }
        Ok(())
    }

    /// Record a device address in the channel characteristics.
    pub fn set_device_address(&mut self, address: u8) {
        self.channel_control
            .modify(CHANNEL_CONTROL::DEVICE_ADDRESS.val(address as u32));
    }

    pub fn device_address(&self) -> u8 {
        self.channel_control.read(CHANNEL_CONTROL::DEVICE_ADDRESS) as u8
    }

    pub fn uses_split(&self) -> bool {
        self.split_control.is_set(CHANNEL_SPLIT_CONTROL::ENABLE)
    }

    pub fn is_periodic(&self) -> bool {
        self.transfer_type.is_periodic()
    }

    /// High speed bulk and control endpoints may need manual PING handling.
    pub fn uses_ping(&self) -> bool {
        self.speed == UsbSpeed::High
            && matches!(self.transfer_type, TransferType::Bulk | TransferType::Control)
    }

    /// Set the toggle from the PID the channel reported after a transfer.
    pub fn update_data_toggle(&mut self, pid: Pid) {
        // DATA2 can be reported; anything but DATA0 continues as DATA1.
        self.data_toggle = if pid == Pid::Data0 { Pid::Data0 } else { Pid::Data1 };
    }

    /// The transfer set whose transfer is current.
    pub fn head_set(&self) -> Option<TransferHandle> {
        self.transfer_sets.front().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(transfer_type: TransferType, speed: UsbSpeed) -> EndpointRequest {
        EndpointRequest {
            transfer_type,
            direction: Direction::Out,
            speed,
            endpoint_number: 2,
            max_packet_size: 64,
            poll_rate: 8,
            hub_address: 0,
            hub_port_number: 0,
        }
    }

    #[test]
    fn high_speed_bulk_out_starts_with_ping() {
        let config = ControllerConfig::default();
        let endpoint = Endpoint::new(&request(TransferType::Bulk, UsbSpeed::High), &config).unwrap();
        assert!(endpoint.ping_required);
        assert!(!endpoint.uses_split());
        assert_eq!(endpoint.data_toggle, Pid::Data0);
        assert_eq!(endpoint.channel_control.read(CHANNEL_CONTROL::MAX_PACKET_SIZE), 64);
        assert_eq!(endpoint.channel_control.read(CHANNEL_CONTROL::ENDPOINT), 2);
        assert_eq!(endpoint.channel_control.read(CHANNEL_CONTROL::ENDPOINT_TYPE), 2);
        assert!(endpoint.channel_control.is_set(CHANNEL_CONTROL::ENABLE));
    }

    #[test]
    fn low_speed_behind_hub_uses_split_and_microframe_polling() {
        let config = ControllerConfig::default();
        let mut request = request(TransferType::Interrupt, UsbSpeed::Low);
        request.hub_address = 3;
        request.hub_port_number = 4;
        request.max_packet_size = 8;
        let endpoint = Endpoint::new(&request, &config).unwrap();

        assert!(endpoint.uses_split());
        assert_eq!(endpoint.split_control.read(CHANNEL_SPLIT_CONTROL::HUB_ADDRESS), 3);
        assert_eq!(endpoint.split_control.read(CHANNEL_SPLIT_CONTROL::PORT_ADDRESS), 4);
        assert_eq!(endpoint.split_control.read(CHANNEL_SPLIT_CONTROL::POSITION), 3);
        assert!(endpoint.channel_control.is_set(CHANNEL_CONTROL::LOW_SPEED));
        assert_eq!(endpoint.poll_rate, 64);
        assert!(!endpoint.ping_required);
    }

    #[test]
    fn transfer_limits_follow_controller_counters() {
        let config = ControllerConfig::default()
            .with_max_transfer_size(1000)
            .with_max_packet_count(4);
        let mut endpoint = Endpoint::new(&request(TransferType::Bulk, UsbSpeed::High), &config).unwrap();
        assert_eq!(endpoint.max_packet_count, 4);
        assert_eq!(endpoint.max_transfer_size, 256);

        endpoint.data_toggle = Pid::Data1;
        endpoint.reset(512, &config).unwrap();
        assert_eq!(endpoint.data_toggle, Pid::Data0);
        assert_eq!(endpoint.max_packet_count, 1);
        assert_eq!(endpoint.max_transfer_size, 512);
        assert_eq!(endpoint.channel_control.read(CHANNEL_CONTROL::MAX_PACKET_SIZE), 512);
    }

    #[test]
    fn toggle_collapses_data2_to_data1() {
        let config = ControllerConfig::default();
        let mut endpoint = Endpoint::new(&request(TransferType::Bulk, UsbSpeed::High), &config).unwrap();
        endpoint.update_data_toggle(Pid::Data2);
        assert_eq!(endpoint.data_toggle, Pid::Data1);
        endpoint.update_data_toggle(Pid::Data0);
        assert_eq!(endpoint.data_toggle, Pid::Data0);
    }

    #[test]
    fn device_address_is_recorded() {
        let config = ControllerConfig::default();
        let mut endpoint = Endpoint::new(&request(TransferType::Control, UsbSpeed::Full), &config).unwrap();
        assert_eq!(endpoint.device_address(), 0);
        endpoint.set_device_address(9);
        assert_eq!(endpoint.device_address(), 9);
        assert_eq!(endpoint.channel_control.read(CHANNEL_CONTROL::MAX_PACKET_SIZE), 64);
    }
}
