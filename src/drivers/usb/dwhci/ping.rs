//! PING protocol pre-processing
//!
//! High speed bulk and control OUT transfers that are NAKed or NYETed must
//! be preceded by a PING before the data is sent again. Newer cores do this
//! on their own; older ones need the driver to set the PING bit on the next
//! channel programming.

use super::regs::{ChannelInterrupts, Pid};
use super::transfer::Transfer;
use crate::drivers::usb::{Direction, TransferType};

/// First core revision that issues PING without driver help
pub(crate) const AUTOMATIC_PING_REVISION_MINIMUM: u32 = 0x4F54_271A;

/// Whether the transfer after `transfer` must start with a PING.
///
/// `next_in` is the direction of the transfer queued behind `transfer` in
/// the same set, if any.
pub(crate) fn ping_required_after(
    revision: u32,
    transfer_type: TransferType,
    request_direction: Direction,
    transfer: &Transfer,
    next_in: Option<bool>,
    interrupts: ChannelInterrupts,
) -> bool {
    if revision >= AUTOMATIC_PING_REVISION_MINIMUM {
        return false;
    }

    let refused = interrupts.intersects(ChannelInterrupts::NAK | ChannelInterrupts::NOT_YET);
    let completed = interrupts.contains(ChannelInterrupts::TRANSFER_COMPLETE);

    match transfer_type {
        TransferType::Bulk => request_direction == Direction::Out && refused,
        TransferType::Control => {
            if transfer.pid() == Pid::Setup {
                // The setup stage looks ahead at the data or status stage.
                completed && next_in == Some(false)
            } else if !transfer.last {
                if !transfer.in_transfer {
                    refused
                } else {
                    // An IN data stage is always followed by an OUT status.
                    completed
                }
            } else {
                !transfer.in_transfer && refused
            }
        }
        TransferType::Interrupt | TransferType::Isochronous => false,
    }
}
