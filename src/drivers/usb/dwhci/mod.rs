//! DesignWare USB 2.0 Hi-Speed On-The-Go (DWHCI) host controller driver
//!
//! The core exposes a small pool of host channels instead of a
//! memory-resident schedule. Software keeps the schedule: endpoints with
//! queued work sit on one of five lists and are handed a channel when one is
//! free and, for periodic endpoints, when their (micro)frame comes round.
//! Every hardware transfer is programmed into the channel registers by hand
//! and each channel interrupt is post-processed to decide what runs next.
//!
//! # Locking
//!
//! The interrupt service routine only touches the pending-interrupt lock.
//! Everything else runs under the controller lock, taken at the level the
//! interrupt service runs at so that the two can nest. Completions are
//! gathered under the controller lock and handed to the platform after it is
//! released.
//!
//! # References
//!
//! - Synopsys DesignWare Cores USB 2.0 Hi-Speed On-The-Go (OTG) Databook
//! - Universal Serial Bus Specification, Revision 2.0, chapters 8 and 11

mod channel;
mod endpoint;
mod frame;
mod hw;
mod init;
mod interrupt;
mod ping;
pub mod regs;
mod roothub;
mod schedule;
mod split;
mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use interrupt::InterruptStatus;

use self::hw::Hardware;
use self::interrupt::PendingInterrupts;
use self::schedule::Schedule;
use crate::config::ControllerConfig;
use crate::drivers::mmio::RegisterAccess;
use crate::drivers::usb::{
    EndpointHandle, EndpointRequest, HostController, PortStatus, TransferFlags, TransferHandle,
    TransferOutcome, TransferRequest, UsbError,
};
use crate::platform::{DmaRegion, Platform, RunLevel, lock_at};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Size of the buffer zero-length control status stages point at
const STATUS_BUFFER_SIZE: usize = 64;
const STATUS_BUFFER_ALIGNMENT: usize = 8;

/// One DWHCI controller instance.
pub struct DwhciController<R, P> {
    hw: Hardware<R>,
    platform: P,
    config: ControllerConfig,
    schedule: Mutex<Schedule>,
    pending: Mutex<PendingInterrupts>,
    interrupt_connected: AtomicBool,
    port_connected: AtomicBool,
    status_buffer: DmaRegion,
}

impl<R: RegisterAccess, P: Platform> DwhciController<R, P> {
    /// Create the software state for a controller.
    ///
    /// Nothing is written to the hardware; call [`initialize`](Self::initialize)
    /// before use.
    pub fn new(registers: R, platform: P, config: ControllerConfig) -> Result<Self, UsbError> {
        let status_buffer = platform
            .allocate_dma(STATUS_BUFFER_SIZE, STATUS_BUFFER_ALIGNMENT)
            .ok_or(UsbError::NoResources)?;

        log::debug!(
            "DWHCI: {} channels, status buffer at {:#x}",
            config.channel_count,
            status_buffer.physical_address
        );

        Ok(Self {
            hw: Hardware::new(registers),
            platform,
            config,
            schedule: Mutex::new(Schedule::new(config, status_buffer.physical_address)),
            pending: Mutex::new(PendingInterrupts::new()),
            interrupt_connected: AtomicBool::new(false),
            port_connected: AtomicBool::new(false),
            status_buffer,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Record whether the interrupt line has been hooked up.
    ///
    /// Until it is, deferred work raises all the way to
    /// [`RunLevel::High`] before taking the locks the service routine uses.
    pub fn set_interrupt_connected(&self, connected: bool) {
        self.interrupt_connected.store(connected, Ordering::Release);
    }

    fn lock_level(&self) -> RunLevel {
        if self.interrupt_connected.load(Ordering::Acquire) {
            RunLevel::Device
        } else {
            RunLevel::High
        }
    }

    /// Run `f` under the controller lock, then report whatever it completed.
    fn with_schedule<T>(&self, f: impl FnOnce(&mut Schedule, &Hardware<R>) -> T) -> T {
        let (result, completions) = {
            let mut schedule = lock_at(&self.schedule, &self.platform, self.lock_level());
            let result = f(&mut schedule, &self.hw);
            (result, schedule.take_completions())
        };

        for completion in completions {
            self.platform.transfer_completed(completion.transfer, completion.outcome);
        }
        result
    }
}

impl<R: RegisterAccess, P: Platform> HostController for DwhciController<R, P> {
    fn create_endpoint(&self, request: &EndpointRequest) -> Result<EndpointHandle, UsbError> {
        self.with_schedule(|schedule, _| schedule.create_endpoint(request))
    }

    fn reset_endpoint(&self, endpoint: EndpointHandle, max_packet_size: u32) -> Result<(), UsbError> {
        self.with_schedule(|schedule, _| schedule.reset_endpoint(endpoint, max_packet_size))
    }

    fn destroy_endpoint(&self, endpoint: EndpointHandle) -> Result<(), UsbError> {
        self.with_schedule(|schedule, _| schedule.destroy_endpoint(endpoint))
    }

    fn create_transfer(
        &self,
        endpoint: EndpointHandle,
        max_buffer_size: u32,
        flags: TransferFlags,
    ) -> Result<TransferHandle, UsbError> {
        self.with_schedule(|schedule, _| schedule.create_transfer(endpoint, max_buffer_size, flags))
    }

    fn destroy_transfer(&self, transfer: TransferHandle) -> Result<(), UsbError> {
        self.with_schedule(|schedule, _| schedule.destroy_transfer(transfer))
    }

    fn submit_transfer(&self, transfer: TransferHandle, request: &TransferRequest) -> Result<(), UsbError> {
        self.with_schedule(|schedule, hw| schedule.submit(hw, transfer, request, false))
    }

    fn submit_transfer_sync(
        &self,
        transfer: TransferHandle,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, UsbError> {
        self.with_schedule(|schedule, hw| schedule.submit(hw, transfer, request, true))?;

        loop {
            if let Some(outcome) = self.with_schedule(|schedule, _| schedule.take_outcome(transfer)) {
                return Ok(outcome);
            }
            self.platform.wait();
        }
    }

    fn cancel_transfer(&self, transfer: TransferHandle) -> Result<(), UsbError> {
        let port_connected = self.port_connected.load(Ordering::Acquire);
        self.with_schedule(|schedule, hw| schedule.cancel(hw, transfer, port_connected))
    }

    fn get_root_hub_status(&self, port: &mut PortStatus) -> Result<(), UsbError> {
        self.root_hub_status(port)
    }

    fn set_root_hub_status(&self, port: &mut PortStatus) -> Result<(), UsbError> {
        self.set_root_hub(port)
    }
}
