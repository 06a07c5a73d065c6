//! Interrupt service and deferred processing
//!
//! The interrupt service routine runs at device level. It only acknowledges
//! the hardware and accumulates what it saw in [`PendingInterrupts`] under the
//! short interrupt lock, then asks the platform for deferred work on the
//! transition from nothing pending to something pending. The deferred
//! routine drains the pending bits and does the scheduling work under the
//! controller lock.

use super::DwhciController;
use super::regs::{
    ChannelInterrupts, ChannelRegister, CoreInterrupts, HOST_PORT_INTERRUPT_MASK,
    HOST_PORT_WRITE_TO_CLEAR_MASK, Register,
};
use crate::config::MAX_CHANNELS;
use crate::drivers::mmio::RegisterAccess;
use crate::platform::{Platform, lock_at};

/// Whether an interrupt belonged to this controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    Claimed,
    NotClaimed,
}

/// Interrupt bits seen by the service routine and not yet processed
pub(crate) struct PendingInterrupts {
    pub core: CoreInterrupts,
    pub channels: [ChannelInterrupts; MAX_CHANNELS],
}

impl PendingInterrupts {
    pub const fn new() -> Self {
        Self {
            core: CoreInterrupts::empty(),
            channels: [ChannelInterrupts::empty(); MAX_CHANNELS],
        }
    }
}

impl<R: RegisterAccess, P: Platform> DwhciController<R, P> {
    /// Top half. Call from the controller's interrupt handler.
    pub fn interrupt_service(&self) -> InterruptStatus {
        let status = CoreInterrupts::from_bits_retain(self.hw.read(Register::CoreInterrupt));
        let mask = CoreInterrupts::from_bits_retain(self.hw.read(Register::CoreInterruptMask));
        let original = status & mask;
        if original.is_empty() {
            return InterruptStatus::NotClaimed;
        }

        let mut interrupts = original;
        let mut port_acknowledge = 0;
        let mut pending = self.pending.lock();

        // The core port interrupt only clears once the port change bits do.
        if interrupts.contains(CoreInterrupts::PORT) {
            let port = self.hw.read(Register::HostPort);
            if port & HOST_PORT_INTERRUPT_MASK == 0 {
                interrupts.remove(CoreInterrupts::PORT);
            } else {
                port_acknowledge =
                    (port & !HOST_PORT_WRITE_TO_CLEAR_MASK) | (port & HOST_PORT_INTERRUPT_MASK);
            }
        }

        if interrupts.contains(CoreInterrupts::HOST_CHANNEL) {
            self.save_channel_interrupts(&mut pending.channels);
        }

        // Start of frame fires every microframe; only wake the deferred
        // routine once the earliest periodic deadline has arrived.
        if interrupts.contains(CoreInterrupts::START_OF_FRAME) {
            let frame = self.hw.frame_number();
            let due = self.hw.next_frame().is_some_and(|next| frame.has_reached(next));
            if !due {
                interrupts.remove(CoreInterrupts::START_OF_FRAME);
            }
        }

        let was_idle = pending.core.is_empty();
        pending.core |= interrupts;
        if was_idle && !interrupts.is_empty() {
            self.platform.queue_deferred_work();
        }

        if port_acknowledge != 0 {
            self.hw.write(Register::HostPort, port_acknowledge);
        }
        self.hw.write(Register::CoreInterrupt, original.bits());

        InterruptStatus::Claimed
    }

    /// Latch and acknowledge every channel the core flags.
    fn save_channel_interrupts(&self, channels: &mut [ChannelInterrupts; MAX_CHANNELS]) {
        let flagged = self.hw.read(Register::HostChannelInterrupt);

        for (number, pending) in channels.iter_mut().enumerate().take(self.config.channel_count) {
            if flagged & (1 << number) == 0 {
                continue;
            }

            let channel = number as u8;
            let bits = self.hw.read_channel(ChannelRegister::Interrupt, channel);
            self.hw.write_channel(ChannelRegister::Interrupt, channel, bits);

            if self.hw.channel_assigned(channel) {
                *pending |= ChannelInterrupts::from_bits_retain(bits);
            } else {
                log::warn!("DWHCI: interrupt {:#x} on idle channel {}", bits, channel);
                *pending = ChannelInterrupts::empty();
            }
        }
    }

    /// Bottom half. Call from the deferred work the platform queued.
    pub fn deferred_work(&self) {
        let level = self.lock_level();
        let (core, channels) = {
            let mut pending = lock_at(&self.pending, &self.platform, level);
            let core = core::mem::take(&mut pending.core);
            let mut channels = [ChannelInterrupts::empty(); MAX_CHANNELS];
            if core.contains(CoreInterrupts::HOST_CHANNEL) {
                channels = core::mem::replace(&mut pending.channels, channels);
            }
            (core, channels)
        };

        let port_changed = core.intersects(CoreInterrupts::PORT | CoreInterrupts::DISCONNECT);

        self.with_schedule(|schedule, hw| {
            if core.contains(CoreInterrupts::START_OF_FRAME) {
                schedule.handle_start_of_frame(hw);
            }
            if core.contains(CoreInterrupts::HOST_CHANNEL) {
                let count = schedule.config().channel_count;
                schedule.process_channel_interrupts(hw, &channels[..count]);
            }
        });

        if port_changed {
            self.platform.port_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::drivers::usb::dwhci::testing::{FakePlatform, FakeRegisters};
    use crate::drivers::usb::{
        Direction, EndpointRequest, HostController, TransferFlags, TransferHandle, TransferRequest,
        TransferType, UsbSpeed,
    };
    use crate::platform::RunLevel;

    fn controller<'a>(
        registers: &'a FakeRegisters,
        platform: &'a FakePlatform,
    ) -> DwhciController<&'a FakeRegisters, &'a FakePlatform> {
        let controller = DwhciController::new(registers, platform, ControllerConfig::default()).unwrap();
        registers.poke(Register::CoreInterruptMask, CoreInterrupts::INITIAL_MASK.bits());
        controller
    }

    fn bulk_in(controller: &DwhciController<&FakeRegisters, &FakePlatform>) -> TransferHandle {
        let endpoint = controller
            .create_endpoint(&EndpointRequest {
                transfer_type: TransferType::Bulk,
                direction: Direction::In,
                speed: UsbSpeed::High,
                endpoint_number: 1,
                max_packet_size: 512,
                poll_rate: 0,
                hub_address: 0,
                hub_port_number: 0,
            })
            .unwrap();
        let transfer = controller
            .create_transfer(endpoint, 512, TransferFlags::empty())
            .unwrap();
        controller
            .submit_transfer(
                transfer,
                &TransferRequest {
                    direction: Direction::In,
                    length: 512,
                    buffer_physical_address: 0x4000,
                    device_address: 2,
                    flags: TransferFlags::empty(),
                },
            )
            .unwrap();
        transfer
    }

    #[test]
    fn unmasked_interrupts_are_not_claimed() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        assert_eq!(controller.interrupt_service(), InterruptStatus::NotClaimed);
        registers.raise_core(CoreInterrupts::START_OF_FRAME);
        assert_eq!(controller.interrupt_service(), InterruptStatus::NotClaimed);
        assert_eq!(platform.deferred_count(), 0);
    }

    #[test]
    fn deferred_work_is_queued_once_per_edge() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        registers.raise_core(CoreInterrupts::DISCONNECT);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        registers.raise_core(CoreInterrupts::DISCONNECT);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(platform.deferred_count(), 1);
        assert_eq!(registers.peek(Register::CoreInterrupt), 0);

        controller.deferred_work();
        assert_eq!(platform.port_change_count(), 1);

        registers.raise_core(CoreInterrupts::DISCONNECT);
        controller.interrupt_service();
        assert_eq!(platform.deferred_count(), 2);
    }

    #[test]
    fn port_interrupt_without_change_bits_is_dropped() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        registers.poke(Register::HostPort, 1 | (1 << 12));
        registers.raise_core(CoreInterrupts::PORT);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(platform.deferred_count(), 0);
    }

    #[test]
    fn port_change_is_acknowledged_and_reported() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        // Connected, connect change, enabled, powered.
        registers.poke(Register::HostPort, 1 | (1 << 1) | (1 << 2) | (1 << 12));
        registers.raise_core(CoreInterrupts::PORT);
        controller.interrupt_service();

        let port = registers.peek(Register::HostPort);
        assert_eq!(port & (1 << 1), 0, "connect change acknowledged");
        assert_ne!(port & (1 << 2), 0, "port left enabled");

        controller.deferred_work();
        assert_eq!(platform.port_change_count(), 1);
    }

    #[test]
    fn channel_completion_flows_to_the_platform() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);
        let transfer = bulk_in(&controller);

        registers.poke_channel(ChannelRegister::Token, 0, 2 << 29);
        registers.raise_channel(0, ChannelInterrupts::TRANSFER_COMPLETE | ChannelInterrupts::HALTED);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(registers.peek_channel(ChannelRegister::Interrupt, 0), 0);
        assert_eq!(registers.peek(Register::HostChannelInterrupt), 0);
        assert!(platform.completions().is_empty());

        controller.deferred_work();
        let completions = platform.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, transfer);
        assert_eq!(completions[0].1.length_transferred, 512);
        assert_eq!(completions[0].1.result, Ok(()));
        assert_eq!(platform.current_level(), RunLevel::Low);
    }

    #[test]
    fn stray_channel_interrupt_is_acknowledged_and_ignored() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        registers.raise_channel(5, ChannelInterrupts::HALTED);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(registers.peek_channel(ChannelRegister::Interrupt, 5), 0);

        controller.deferred_work();
        assert!(platform.completions().is_empty());
    }

    #[test]
    fn early_start_of_frame_is_filtered() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        let endpoint = controller
            .create_endpoint(&EndpointRequest {
                transfer_type: TransferType::Interrupt,
                direction: Direction::In,
                speed: UsbSpeed::High,
                endpoint_number: 1,
                max_packet_size: 8,
                poll_rate: 8,
                hub_address: 0,
                hub_port_number: 0,
            })
            .unwrap();
        let transfer = controller.create_transfer(endpoint, 8, TransferFlags::empty()).unwrap();
        registers.set_frame(0x3FFE);
        controller
            .submit_transfer(
                transfer,
                &TransferRequest {
                    direction: Direction::In,
                    length: 8,
                    buffer_physical_address: 0x4000,
                    device_address: 2,
                    flags: TransferFlags::empty(),
                },
            )
            .unwrap();

        // Deadline is 0x3FFE + 8, wrapped to 6.
        registers.set_frame(2);
        registers.raise_core(CoreInterrupts::START_OF_FRAME);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(platform.deferred_count(), 0);

        registers.set_frame(6);
        registers.raise_core(CoreInterrupts::START_OF_FRAME);
        controller.interrupt_service();
        assert_eq!(platform.deferred_count(), 1);

        controller.deferred_work();
        let schedule = controller.schedule.lock();
        let state = schedule.endpoint(endpoint).unwrap();
        assert!(state.scheduled);
        assert_eq!(state.channel, Some(0));
    }

    #[test]
    fn lock_level_follows_interrupt_connection() {
        let registers = FakeRegisters::new();
        let platform = FakePlatform::new();
        let controller = controller(&registers, &platform);

        controller.deferred_work();
        assert_eq!(platform.max_level(), RunLevel::High);

        let platform = FakePlatform::new();
        let controller = DwhciController::new(&registers, &platform, ControllerConfig::default()).unwrap();
        controller.set_interrupt_connected(true);
        controller.deferred_work();
        assert_eq!(platform.max_level(), RunLevel::Device);
    }
}
