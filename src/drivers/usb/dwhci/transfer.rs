//! Transfer sets and hardware transfers
//!
//! A transfer set is one logical request from the bus layer. It is cut into
//! hardware transfers, each small enough for one channel programming: at most
//! the endpoint's max transfer size, or a single packet for split endpoints.
//! Control sets always start with a SETUP stage and end with a zero-length
//! status stage.
//!
//! The worst-case number of hardware transfers is reserved when the set is
//! created, so submission only fills in slots that already exist.

use super::endpoint::Endpoint;
use super::regs::{CHANNEL_TOKEN, ChannelInterrupts, Pid};
use crate::config::{DebugFlags, debug_flags};
use crate::drivers::usb::{
    Direction, EndpointHandle, SETUP_PACKET_SIZE, TransferFlags, TransferHandle, TransferOutcome,
    TransferRequest, TransferType, UsbError,
};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use tock_registers::LocalRegisterCopy;

/// Index of a [`Transfer`] in the controller's transfer block allocator
pub(crate) type TransferSlot = usize;

/// One channel programming worth of work.
pub(crate) struct Transfer {
    pub set: TransferHandle,
    pub physical_address: u64,
    pub length: u32,
    /// Packet count, PID and size as written to the channel token. A PID of
    /// DATA0 means "use the endpoint's toggle when scheduling".
    pub token: LocalRegisterCopy<u32, CHANNEL_TOKEN::Register>,
    /// Channel interrupts unmasked while this transfer runs
    pub interrupt_mask: ChannelInterrupts,
    pub in_transfer: bool,
    pub last: bool,
    /// Split transaction errors seen so far
    pub error_count: u32,
    /// 0 while issuing start splits, then which complete split is pending
    pub complete_split_count: u32,
}

impl Transfer {
    /// An unused reserved slot.
    pub fn empty(set: TransferHandle) -> Self {
        Self {
            set,
            physical_address: 0,
            length: 0,
            token: LocalRegisterCopy::new(0),
            interrupt_mask: ChannelInterrupts::empty(),
            in_transfer: false,
            last: false,
            error_count: 0,
            complete_split_count: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_bits(self.token.read(CHANNEL_TOKEN::PID))
    }
}

/// One logical request and the hardware transfers it was cut into.
pub(crate) struct TransferSet {
    pub endpoint: EndpointHandle,
    /// Transfer slots reserved at creation
    pub reserved: Vec<TransferSlot>,
    /// Slots still to run, front first
    pub queue: VecDeque<TransferSlot>,
    pub request: Option<TransferRequest>,
    pub length_transferred: u32,
    /// Sticky error; `Cancelled` and `DeviceIo` also mark a pending teardown
    pub error: Option<UsbError>,
    /// Completion is collected by a waiting submitter instead of the
    /// platform callback
    pub synchronous: bool,
    /// On its endpoint's queue
    pub queued: bool,
    /// Result of a synchronous submission, until the submitter collects it
    pub outcome: Option<TransferOutcome>,
}

impl TransferSet {
    pub fn new(endpoint: EndpointHandle, reserved: Vec<TransferSlot>) -> Self {
        let capacity = reserved.len();
        Self {
            endpoint,
            reserved,
            queue: VecDeque::with_capacity(capacity),
            request: None,
            length_transferred: 0,
            error: None,
            synchronous: false,
            queued: false,
            outcome: None,
        }
    }

    /// Clear per-submission state.
    pub fn prepare(&mut self, request: TransferRequest, synchronous: bool) {
        self.queue.clear();
        self.request = Some(request);
        self.length_transferred = 0;
        self.error = None;
        self.synchronous = synchronous;
        self.outcome = None;
    }
}

/// Largest data chunk one hardware transfer carries on this endpoint.
fn chunk_size(endpoint: &Endpoint) -> u32 {
    if endpoint.uses_split() {
        endpoint.max_packet_size
    } else {
        endpoint.max_transfer_size
    }
}

/// Worst-case number of hardware transfers a request of up to
/// `max_buffer_size` bytes can need.
pub(crate) fn reserved_transfer_count(
    endpoint: &Endpoint,
    max_buffer_size: u32,
    flags: TransferFlags,
) -> Result<usize, UsbError> {
    let force_short = flags.contains(TransferFlags::FORCE_SHORT_TRANSFER);
    let mut count = 0;
    let mut size = max_buffer_size;

    if endpoint.transfer_type == TransferType::Control {
        size = size
            .checked_sub(SETUP_PACKET_SIZE)
            .ok_or(UsbError::InvalidParameter)?;
        count += 2;
    }

    if size != 0 {
        count += size.div_ceil(chunk_size(endpoint));
        if force_short && size >= endpoint.max_packet_size {
            count += 1;
        }
    } else if force_short || endpoint.transfer_type != TransferType::Control {
        count += 1;
    }

    Ok(count as usize)
}

/// Iterator over the hardware transfers of one submission.
pub(crate) struct TransferPlan {
    set: TransferHandle,
    control: bool,
    direction: Direction,
    buffer: u64,
    status_buffer: u64,
    total_length: u32,
    chunk: u32,
    max_packet_size: u32,
    count: usize,
    index: usize,
    offset: u32,
}

impl TransferPlan {
    /// Lay out `request` on `endpoint`. Control status stages that read data
    /// land in `status_buffer`.
    pub fn new(
        endpoint: &Endpoint,
        set: TransferHandle,
        request: &TransferRequest,
        status_buffer: u64,
    ) -> Result<Self, UsbError> {
        let control = endpoint.transfer_type == TransferType::Control;
        let force_short = request.flags.contains(TransferFlags::FORCE_SHORT_TRANSFER);
        let chunk = chunk_size(endpoint);
        let mut data_length = request.length;
        let mut count = 0;

        if control {
            data_length = data_length
                .checked_sub(SETUP_PACKET_SIZE)
                .ok_or(UsbError::InvalidParameter)?;
            count += 2;
        }

        count += data_length.div_ceil(chunk);
        if (force_short && data_length % endpoint.max_packet_size == 0) || (data_length == 0 && !control) {
            count += 1;
        }

        Ok(Self {
            set,
            control,
            direction: request.direction,
            buffer: request.buffer_physical_address,
            status_buffer,
            total_length: request.length,
            chunk,
            max_packet_size: endpoint.max_packet_size,
            count: count as usize,
            index: 0,
            offset: 0,
        })
    }

    /// Total number of hardware transfers in the plan
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Iterator for TransferPlan {
    type Item = Transfer;

    fn next(&mut self) -> Option<Transfer> {
        if self.index >= self.count {
            return None;
        }

        let last = self.index + 1 == self.count;
        let offset = self.offset;
        let mut length = self.chunk.min(self.total_length - offset);
        if self.control && offset == 0 {
            length = SETUP_PACKET_SIZE;
        }
        debug_assert!(!self.control || !last || length == 0);

        let mut physical_address = self.buffer + offset as u64;
        let pid;
        let in_transfer;
        if self.control && offset == 0 {
            pid = Pid::Setup;
            in_transfer = false;
        } else if self.control && last {
            // Status runs opposite to the data stage, or IN without one.
            pid = Pid::Data1;
            in_transfer = offset == SETUP_PACKET_SIZE || self.direction == Direction::Out;
            physical_address = self.status_buffer;
        } else {
            pid = Pid::Data0;
            in_transfer = self.direction == Direction::In;
        }

        let packet_count = if length > self.max_packet_size {
            length.div_ceil(self.max_packet_size)
        } else {
            1
        };

        let mut token = LocalRegisterCopy::new(0);
        token.write(
            CHANNEL_TOKEN::PACKET_COUNT.val(packet_count)
                + CHANNEL_TOKEN::PID.val(pid as u32)
                + CHANNEL_TOKEN::TRANSFER_SIZE.val(length),
        );

        let transfer = Transfer {
            set: self.set,
            physical_address,
            length,
            token,
            interrupt_mask: ChannelInterrupts::HALTED | ChannelInterrupts::AHB_ERROR,
            in_transfer,
            last,
            error_count: 0,
            complete_split_count: 0,
        };

        if debug_flags().contains(DebugFlags::TRANSFERS) {
            log::debug!(
                "DWHCI: set {:?} transfer {}: token {:#010x} in {} last {} length {:#x}",
                self.set,
                self.index,
                transfer.token.get(),
                transfer.in_transfer,
                transfer.last,
                transfer.length
            );
        }

        self.offset += length;
        self.index += 1;
        Some(transfer)
    }
}
