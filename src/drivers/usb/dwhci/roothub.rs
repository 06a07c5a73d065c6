//! Root port status translation
//!
//! The core has a single root port. Its HPRT register mixes plain control
//! bits with write-one-to-clear change bits, including the enable bit, which
//! disables the port when written as one. Every write here first masks the
//! W1C bits out of the value read back so nothing is acknowledged by
//! accident.

use super::DwhciController;
use super::regs::{HOST_PORT, HOST_PORT_WRITE_TO_CLEAR_MASK, Register};
use crate::config::{DebugFlags, debug_flags};
use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::{PortStatus, PortStatusBits, UsbError, UsbSpeed};
use crate::platform::Platform;
use core::sync::atomic::Ordering;
use tock_registers::LocalRegisterCopy;

/// How long the port stays in reset
const PORT_RESET_DELAY_US: u64 = 50_000;

type HostPort = LocalRegisterCopy<u32, HOST_PORT::Register>;

impl<R: RegisterAccess, P: Platform> DwhciController<R, P> {
    /// Refresh `port` from the hardware and accumulate change bits.
    pub(super) fn root_hub_status(&self, port: &mut PortStatus) -> Result<(), UsbError> {
        let hardware: HostPort = self.hw.read_copy(Register::HostPort);
        let mut status = PortStatusBits::empty();

        let connected = hardware.is_set(HOST_PORT::CONNECT_STATUS);
        if connected {
            status |= PortStatusBits::CONNECTED;
            port.speed = match hardware.read_as_enum(HOST_PORT::SPEED) {
                Some(HOST_PORT::SPEED::Value::High) => Some(UsbSpeed::High),
                Some(HOST_PORT::SPEED::Value::Full) => Some(UsbSpeed::Full),
                Some(HOST_PORT::SPEED::Value::Low) => Some(UsbSpeed::Low),
                None => {
                    log::warn!("DWHCI: unknown port speed in {:#010x}", hardware.get());
                    port.speed
                }
            };
        }
        self.port_connected.store(connected, Ordering::Release);

        if hardware.is_set(HOST_PORT::ENABLE) {
            status |= PortStatusBits::ENABLED;
        }
        if hardware.is_set(HOST_PORT::RESET) {
            status |= PortStatusBits::RESET;
        }
        if hardware.is_set(HOST_PORT::OVER_CURRENT_ACTIVE) {
            status |= PortStatusBits::OVER_CURRENT;
        }

        // Change bits line up with status bits one for one.
        if status != port.status {
            port.change |= status ^ port.status;
            port.status = status;
        }

        let preserved = hardware.get() & !HOST_PORT_WRITE_TO_CLEAR_MASK;
        if hardware.is_set(HOST_PORT::OVER_CURRENT_CHANGE) {
            port.change |= PortStatusBits::OVER_CURRENT;
            let acknowledge = preserved | HOST_PORT::OVER_CURRENT_CHANGE::SET.value;
            self.hw.write(Register::HostPort, acknowledge);
        }

        // A connect-to-connect bounce leaves the status unchanged but still
        // latches the change bit.
        if hardware.is_set(HOST_PORT::CONNECT_STATUS_CHANGE) {
            port.change |= PortStatusBits::CONNECTED;
            // Reset clears the bit on its own.
            if !hardware.is_set(HOST_PORT::RESET) {
                let acknowledge = preserved | HOST_PORT::CONNECT_STATUS_CHANGE::SET.value;
                self.hw.write(Register::HostPort, acknowledge);
            }
        }

        if debug_flags().contains(DebugFlags::PORTS) {
            log::debug!(
                "DWHCI: port status {:#010x} connected {} enabled {} reset {} changed {}",
                hardware.get(),
                connected,
                hardware.is_set(HOST_PORT::ENABLE),
                hardware.is_set(HOST_PORT::RESET),
                hardware.is_set(HOST_PORT::CONNECT_STATUS_CHANGE)
            );
        }

        Ok(())
    }

    /// Apply the changes requested in `port` and clear the handled change
    /// bits.
    pub(super) fn set_root_hub(&self, port: &mut PortStatus) -> Result<(), UsbError> {
        if port.change.is_empty() {
            return Ok(());
        }

        let original = self.hw.read(Register::HostPort) & !HOST_PORT_WRITE_TO_CLEAR_MASK;
        let mut hardware = HostPort::new(original);
        hardware.modify(HOST_PORT::ENABLE::CLEAR + HOST_PORT::RESET::CLEAR + HOST_PORT::SUSPEND::CLEAR);

        if port.change.contains(PortStatusBits::ENABLED) {
            if port.status.contains(PortStatusBits::ENABLED) {
                hardware.modify(HOST_PORT::POWER::SET);
            } else {
                // Writing one to the enable bit disables the port.
                hardware.modify(HOST_PORT::ENABLE::SET);
            }
            port.change.remove(PortStatusBits::ENABLED);
        }

        if port.change.contains(PortStatusBits::RESET) {
            if port.status.contains(PortStatusBits::RESET) {
                hardware.modify(HOST_PORT::RESET::SET + HOST_PORT::POWER::SET);
            }
            port.change.remove(PortStatusBits::RESET);
        }

        if port.change.contains(PortStatusBits::SUSPENDED) {
            if port.status.contains(PortStatusBits::SUSPENDED) {
                hardware.modify(HOST_PORT::SUSPEND::SET);
            }
            port.change.remove(PortStatusBits::SUSPENDED);
        }

        if hardware.get() != original {
            // Disable before reset when both are requested.
            if hardware.is_set(HOST_PORT::ENABLE) && hardware.is_set(HOST_PORT::RESET) {
                self.hw
                    .write(Register::HostPort, original | HOST_PORT::ENABLE::SET.value);
                hardware.modify(HOST_PORT::ENABLE::CLEAR);
            }
            self.hw.write(Register::HostPort, hardware.get());

            if debug_flags().contains(DebugFlags::PORTS) {
                log::debug!("DWHCI: port control {:#010x}", hardware.get());
            }
        }

        if hardware.is_set(HOST_PORT::RESET) {
            self.platform.delay_us(PORT_RESET_DELAY_US);
            let mut current: HostPort = self.hw.read_copy(Register::HostPort);
            current.set(current.get() & !HOST_PORT_WRITE_TO_CLEAR_MASK);
            current.modify(HOST_PORT::RESET::CLEAR);
            self.hw.write(Register::HostPort, current.get());
        }

        Ok(())
    }
}
