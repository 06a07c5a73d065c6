//! Controller bring-up
//!
//! Brings the core from whatever state firmware left it in to an idle host
//! with DMA enabled, a powered root port and the initial interrupt set
//! unmasked. Firmware may have programmed the FIFO sizes and AHB burst
//! length; both are saved before the core reset wipes them and restored
//! afterwards.

use super::DwhciController;
use super::regs::{
    AHB_CONFIGURATION, CHANNEL_CONTROL, ChannelRegister, CoreInterrupts, HARDWARE2, HARDWARE4,
    HOST_CONFIGURATION, HOST_PORT, HOST_PORT_WRITE_TO_CLEAR_MASK, OTG_CONTROL, Register,
    USB_CONFIGURATION,
};
use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::{UsbError, UsbSpeed};
use crate::platform::Platform;
use tock_registers::LocalRegisterCopy;

type AhbConfiguration = LocalRegisterCopy<u32, AHB_CONFIGURATION::Register>;
type UsbConfiguration = LocalRegisterCopy<u32, USB_CONFIGURATION::Register>;
type Hardware2 = LocalRegisterCopy<u32, HARDWARE2::Register>;
type HostConfiguration = LocalRegisterCopy<u32, HOST_CONFIGURATION::Register>;

/// FIFO layout programmed before the driver took over
struct FifoSizes {
    receive: u32,
    non_periodic: u32,
    periodic: u32,
}

impl<R: RegisterAccess, P: Platform> DwhciController<R, P> {
    /// Reset the core and configure it for host operation.
    ///
    /// The global interrupt is enabled on return, but nothing fires until
    /// the platform routes the controller's interrupt line to
    /// [`interrupt_service`](Self::interrupt_service).
    pub fn initialize(&self) -> Result<(), UsbError> {
        let fifo_sizes = FifoSizes {
            receive: self.hw.read(Register::ReceiveFifoSize),
            non_periodic: self.hw.read(Register::NonPeriodicFifoSize),
            periodic: self.hw.read(Register::PeriodicFifoSize),
        };

        let mut ahb: AhbConfiguration = self.hw.read_copy(Register::AhbConfiguration);
        let burst_length = ahb.read(AHB_CONFIGURATION::BURST_LENGTH);
        ahb.modify(AHB_CONFIGURATION::INTERRUPT_ENABLE::CLEAR);
        self.hw.write(Register::AhbConfiguration, ahb.get());

        // The HNP/SRP bits firmware chose do not always match what the
        // hardware configuration advertises.
        let mut usb: UsbConfiguration = self.hw.read_copy(Register::UsbConfiguration);
        let capabilities = usb.get()
            & (USB_CONFIGURATION::SRP_CAPABLE::SET + USB_CONFIGURATION::HNP_CAPABLE::SET).value;
        usb.modify(
            USB_CONFIGURATION::ULPI_DRIVER_EXTERNAL_VBUS::CLEAR
                + USB_CONFIGURATION::TS_DLINE_PULSE_ENABLE::CLEAR,
        );
        self.hw.write(Register::UsbConfiguration, usb.get());

        self.hw.soft_reset(&self.platform).inspect_err(|_| {
            log::error!("DWHCI: core soft reset timed out");
        })?;
        self.initialize_phy()?;

        let hardware2: Hardware2 = self.hw.read_copy(Register::Hardware2);
        if !hardware2.matches_all(HARDWARE2::ARCHITECTURE::InternalDma) {
            log::error!(
                "DWHCI: unsupported architecture {}",
                hardware2.read(HARDWARE2::ARCHITECTURE)
            );
            return Err(UsbError::NotSupported);
        }

        let hardware4: LocalRegisterCopy<u32, HARDWARE4::Register> =
            self.hw.read_copy(Register::Hardware4);
        if hardware4.is_set(HARDWARE4::DMA_DESCRIPTOR_MODE) {
            let mut host: HostConfiguration = self.hw.read_copy(Register::HostConfiguration);
            host.modify(HOST_CONFIGURATION::ENABLE_DMA_DESCRIPTOR::CLEAR);
            self.hw.write(Register::HostConfiguration, host.get());
        }

        let mut ahb: AhbConfiguration = self.hw.read_copy(Register::AhbConfiguration);
        ahb.modify(
            AHB_CONFIGURATION::DMA_ENABLE::SET
                + AHB_CONFIGURATION::DMA_REMAINDER_MODE::Incremental
                + AHB_CONFIGURATION::BURST_LENGTH.val(burst_length),
        );
        self.hw.write(Register::AhbConfiguration, ahb.get());

        self.initialize_usb(capabilities)?;
        self.initialize_host_mode(&fifo_sizes)?;

        self.hw.write(Register::OtgInterrupt, u32::MAX);
        self.hw.write(Register::CoreInterrupt, u32::MAX);
        self.hw
            .write(Register::CoreInterruptMask, CoreInterrupts::INITIAL_MASK.bits());

        let mut ahb: AhbConfiguration = self.hw.read_copy(Register::AhbConfiguration);
        ahb.modify(AHB_CONFIGURATION::INTERRUPT_ENABLE::SET);
        self.hw.write(Register::AhbConfiguration, ahb.get());

        log::info!(
            "DWHCI: core {:#010x} up, {} channels, {:?} speed, status buffer {:#x}",
            self.hw.read(Register::CoreId),
            self.config.channel_count,
            self.config.speed,
            self.status_buffer.physical_address
        );
        Ok(())
    }

    /// Select and clock the PHY matching the controller speed.
    fn initialize_phy(&self) -> Result<(), UsbError> {
        let hardware2: Hardware2 = self.hw.read_copy(Register::Hardware2);
        let high_speed = hardware2.read_as_enum(HARDWARE2::HIGH_SPEED);
        let full_speed = hardware2.read_as_enum(HARDWARE2::FULL_SPEED);

        let clock = if self.config.speed == UsbSpeed::Full {
            let mut usb: UsbConfiguration = self.hw.read_copy(Register::UsbConfiguration);
            usb.modify(USB_CONFIGURATION::PHY_SELECT::SET);
            self.hw.write(Register::UsbConfiguration, usb.get());
            HOST_CONFIGURATION::CLOCK_RATE::Clock48MHz
        } else {
            debug_assert!(high_speed != Some(HARDWARE2::HIGH_SPEED::Value::NotSupported));

            let mut usb: UsbConfiguration = self.hw.read_copy(Register::UsbConfiguration);
            if high_speed == Some(HARDWARE2::HIGH_SPEED::Value::Ulpi) {
                usb.modify(
                    USB_CONFIGURATION::PHY_INTERFACE_16::CLEAR
                        + USB_CONFIGURATION::DDR_SELECT::CLEAR
                        + USB_CONFIGURATION::MODE_SELECT::Ulpi,
                );
            } else {
                usb.modify(
                    USB_CONFIGURATION::MODE_SELECT::Utmi + USB_CONFIGURATION::PHY_INTERFACE_16::CLEAR,
                );
                let hardware4: LocalRegisterCopy<u32, HARDWARE4::Register> =
                    self.hw.read_copy(Register::Hardware4);
                if !hardware4.matches_all(HARDWARE4::UTMI_PHYSICAL_DATA_WIDTH::Width8Bit) {
                    usb.modify(USB_CONFIGURATION::PHY_INTERFACE_16::SET);
                }
            }
            self.hw.write(Register::UsbConfiguration, usb.get());
            HOST_CONFIGURATION::CLOCK_RATE::Clock30Or60MHz
        };

        self.hw.soft_reset(&self.platform)?;

        let mut host: HostConfiguration = self.hw.read_copy(Register::HostConfiguration);
        host.modify(clock);
        self.hw.write(Register::HostConfiguration, host.get());

        let mut usb: UsbConfiguration = self.hw.read_copy(Register::UsbConfiguration);
        let ulpi_with_dedicated_full_speed = high_speed == Some(HARDWARE2::HIGH_SPEED::Value::Ulpi)
            && full_speed == Some(HARDWARE2::FULL_SPEED::Value::Dedicated);
        if ulpi_with_dedicated_full_speed {
            usb.modify(
                USB_CONFIGURATION::ULPI_FULL_SPEED_LOW_SPEED_SELECT::SET
                    + USB_CONFIGURATION::ULPI_CLOCK_SUSPEND_MODE::SET,
            );
        } else {
            usb.modify(
                USB_CONFIGURATION::ULPI_FULL_SPEED_LOW_SPEED_SELECT::CLEAR
                    + USB_CONFIGURATION::ULPI_CLOCK_SUSPEND_MODE::CLEAR,
            );
        }
        self.hw.write(Register::UsbConfiguration, usb.get());
        Ok(())
    }

    /// Program the HNP/SRP capability bits allowed by the OTG mode.
    fn initialize_usb(&self, capabilities: u32) -> Result<(), UsbError> {
        use HARDWARE2::MODE::Value as Mode;

        let mut usb: UsbConfiguration = self.hw.read_copy(Register::UsbConfiguration);
        usb.modify(USB_CONFIGURATION::SRP_CAPABLE::CLEAR + USB_CONFIGURATION::HNP_CAPABLE::CLEAR);

        let hardware2: Hardware2 = self.hw.read_copy(Register::Hardware2);
        match hardware2.read_as_enum(HARDWARE2::MODE) {
            Some(Mode::HnpSrp) => usb.set(usb.get() | capabilities),
            Some(Mode::SrpOnly | Mode::SrpDevice | Mode::SrpHost) => {
                usb.modify(USB_CONFIGURATION::SRP_CAPABLE::SET)
            }
            Some(Mode::NoHnpSrp | Mode::NoSrpDevice | Mode::NoSrpHost) => {}
            None => {
                log::error!(
                    "DWHCI: unknown OTG mode {}",
                    hardware2.read(HARDWARE2::MODE)
                );
                return Err(UsbError::InvalidConfiguration);
            }
        }

        self.hw.write(Register::UsbConfiguration, usb.get());
        Ok(())
    }

    /// Put the core in host mode with every channel idle.
    fn initialize_host_mode(&self, fifo_sizes: &FifoSizes) -> Result<(), UsbError> {
        // Restart the PHY clock.
        self.hw.write(Register::PowerAndClock, 0);

        if self.config.speed == UsbSpeed::Full {
            let mut host: HostConfiguration = self.hw.read_copy(Register::HostConfiguration);
            host.modify(HOST_CONFIGURATION::FULL_SPEED_LOW_SPEED_ONLY::SET);
            self.hw.write(Register::HostConfiguration, host.get());
        }

        let hardware2: Hardware2 = self.hw.read_copy(Register::Hardware2);
        if hardware2.is_set(HARDWARE2::DYNAMIC_FIFO) {
            self.hw.write(Register::ReceiveFifoSize, fifo_sizes.receive);
            self.hw.write(Register::NonPeriodicFifoSize, fifo_sizes.non_periodic);
            self.hw.write(Register::PeriodicFifoSize, fifo_sizes.periodic);
        }

        let mut otg: LocalRegisterCopy<u32, OTG_CONTROL::Register> =
            self.hw.read_copy(Register::OtgControl);
        otg.modify(OTG_CONTROL::HOST_SET_HNP_ENABLE::CLEAR);
        self.hw.write(Register::OtgControl, otg.get());

        self.hw.flush_fifo(&self.platform, true)?;
        self.hw.flush_fifo(&self.platform, false)?;

        let channel_count = self.config.channel_count as u8;
        for channel in 0..channel_count {
            let mut control = LocalRegisterCopy::<u32, CHANNEL_CONTROL::Register>::new(
                self.hw.read_channel(ChannelRegister::Control, channel),
            );
            control.modify(
                CHANNEL_CONTROL::ENDPOINT_DIRECTION_IN::CLEAR
                    + CHANNEL_CONTROL::ENABLE::CLEAR
                    + CHANNEL_CONTROL::DISABLE::SET,
            );
            self.hw.write_channel(ChannelRegister::Control, channel, control.get());
        }

        for channel in 0..channel_count {
            self.hw.reset_channel(&self.platform, channel).inspect_err(|_| {
                log::error!("DWHCI: channel {} did not halt", channel);
            })?;
        }

        let mut port: LocalRegisterCopy<u32, HOST_PORT::Register> = self.hw.read_copy(Register::HostPort);
        if !port.is_set(HOST_PORT::POWER) {
            port.set(port.get() & !HOST_PORT_WRITE_TO_CLEAR_MASK);
            port.modify(HOST_PORT::POWER::SET);
            self.hw.write(Register::HostPort, port.get());
        }

        self.hw.write(Register::HostChannelInterruptMask, 0);
        Ok(())
    }
}
