//! Split transaction pre-processing
//!
//! Low and full speed devices behind a high speed hub are reached through the
//! hub's transaction translator. Every transfer is issued as a start split,
//! followed by one or more complete splits once the hub acknowledges it. The
//! channel reports each phase separately; this module turns those reports
//! into either a retry (interrupts suppressed) or a real completion.

use super::frame::FrameNumber;
use super::regs::ChannelInterrupts;
use super::transfer::Transfer;
use crate::drivers::usb::TransferType;

/// Errors tolerated on one transfer before it fails
pub(crate) const SPLIT_ERROR_MAX: u32 = 3;

/// Complete split attempts per start split on interrupt endpoints
pub(crate) const COMPLETE_SPLIT_MAX: u32 = 3;

/// Microframes after the start split in which NYET may still be answered
pub(crate) const SPLIT_NOT_YET_FRAME_WINDOW: u32 = 5;

/// Adjust `interrupts` for the split phase `transfer` is in.
///
/// `start_frame` is the frame the start split went out in and `frame` the
/// current frame; both only matter for NYET on interrupt endpoints.
pub(crate) fn process_split(
    transfer: &mut Transfer,
    transfer_type: TransferType,
    start_frame: FrameNumber,
    frame: FrameNumber,
    mut interrupts: ChannelInterrupts,
) -> ChannelInterrupts {
    let errors = interrupts.intersects(ChannelInterrupts::ERROR_MASK);

    if transfer.complete_split_count == 0 {
        if errors {
            transfer.error_count += 1;
            if transfer.error_count < SPLIT_ERROR_MAX {
                interrupts.remove(ChannelInterrupts::ERROR_MASK);
            }
        } else if interrupts.contains(ChannelInterrupts::ACK) {
            transfer.complete_split_count = 1;
            interrupts.remove(ChannelInterrupts::TRANSFER_COMPLETE);
        } else if interrupts.contains(ChannelInterrupts::NAK) {
            interrupts.remove(ChannelInterrupts::TRANSFER_COMPLETE);
        }

        return interrupts;
    }

    if interrupts.contains(ChannelInterrupts::STALL) {
        transfer.error_count = SPLIT_ERROR_MAX;
    }

    if errors {
        transfer.error_count += 1;
        if transfer.error_count < SPLIT_ERROR_MAX {
            // A toggle mismatch on bulk or control means the start split
            // must be reissued.
            if matches!(transfer_type, TransferType::Bulk | TransferType::Control)
                && interrupts.contains(ChannelInterrupts::DATA_TOGGLE_ERROR)
            {
                transfer.complete_split_count = 0;
                transfer.error_count = 0;
            }
            interrupts.remove(ChannelInterrupts::ERROR_MASK);
        }
    } else if interrupts.contains(ChannelInterrupts::ACK) {
        interrupts.insert(ChannelInterrupts::TRANSFER_COMPLETE);
    } else if interrupts.contains(ChannelInterrupts::NAK) {
        transfer.complete_split_count = 0;
        transfer.error_count = 0;
        interrupts.remove(ChannelInterrupts::TRANSFER_COMPLETE);
    } else if interrupts.contains(ChannelInterrupts::NOT_YET) {
        interrupts.remove(ChannelInterrupts::TRANSFER_COMPLETE);
        if transfer_type == TransferType::Interrupt {
            let end_frame = start_frame.wrapping_add(SPLIT_NOT_YET_FRAME_WINDOW);
            if end_frame.is_before(frame) {
                log::warn!("DWHCI: complete split window passed at frame {:#x}", frame.value());
                interrupts.insert(ChannelInterrupts::TRANSACTION_ERROR);
                transfer.complete_split_count = 0;
            } else if transfer.complete_split_count >= COMPLETE_SPLIT_MAX {
                transfer.error_count += 1;
                if transfer.error_count >= SPLIT_ERROR_MAX {
                    interrupts.insert(ChannelInterrupts::TRANSACTION_ERROR);
                }
                transfer.complete_split_count = 0;
            } else {
                transfer.complete_split_count += 1;
            }
        }
    }

    interrupts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::TransferHandle;

    fn transfer() -> Transfer {
        Transfer::empty(TransferHandle(0))
    }

    fn run(transfer: &mut Transfer, transfer_type: TransferType, interrupts: ChannelInterrupts) -> ChannelInterrupts {
        process_split(
            transfer,
            transfer_type,
            FrameNumber::new(100),
            FrameNumber::new(101),
            interrupts,
        )
    }

    #[test]
    fn start_split_nak_stays_in_start_phase() {
        let mut transfer = transfer();
        let result = run(
            &mut transfer,
            TransferType::Interrupt,
            ChannelInterrupts::NAK | ChannelInterrupts::TRANSFER_COMPLETE | ChannelInterrupts::HALTED,
        );
        assert_eq!(transfer.complete_split_count, 0);
        assert!(!result.contains(ChannelInterrupts::TRANSFER_COMPLETE));
    }

    #[test]
    fn start_split_ack_moves_to_complete_phase() {
        let mut transfer = transfer();
        let result = run(
            &mut transfer,
            TransferType::Bulk,
            ChannelInterrupts::ACK | ChannelInterrupts::TRANSFER_COMPLETE,
        );
        assert_eq!(transfer.complete_split_count, 1);
        assert!(!result.contains(ChannelInterrupts::TRANSFER_COMPLETE));
    }

    #[test]
    fn start_split_errors_surface_on_third() {
        let mut transfer = transfer();
        for _ in 0..2 {
            let result = run(&mut transfer, TransferType::Bulk, ChannelInterrupts::TRANSACTION_ERROR);
            assert!(!result.intersects(ChannelInterrupts::ERROR_MASK));
        }
        let result = run(&mut transfer, TransferType::Bulk, ChannelInterrupts::TRANSACTION_ERROR);
        assert!(result.contains(ChannelInterrupts::TRANSACTION_ERROR));
    }

    #[test]
    fn three_complete_split_errors_are_fatal() {
        let mut transfer = transfer();
        transfer.complete_split_count = 1;
        let first = run(&mut transfer, TransferType::Interrupt, ChannelInterrupts::TRANSACTION_ERROR);
        assert!(first.is_empty());
        let second = run(&mut transfer, TransferType::Interrupt, ChannelInterrupts::TRANSACTION_ERROR);
        assert!(second.is_empty());
        let third = run(&mut transfer, TransferType::Interrupt, ChannelInterrupts::TRANSACTION_ERROR);
        assert!(third.contains(ChannelInterrupts::TRANSACTION_ERROR));
        assert_eq!(transfer.error_count, 3);
    }

    #[test]
    fn complete_split_stall_is_fatal_immediately() {
        let mut transfer = transfer();
        transfer.complete_split_count = 1;
        let result = run(&mut transfer, TransferType::Bulk, ChannelInterrupts::STALL);
        assert!(result.contains(ChannelInterrupts::STALL));
    }

    #[test]
    fn complete_split_toggle_error_restarts_bulk() {
        let mut transfer = transfer();
        transfer.complete_split_count = 1;
        let result = run(&mut transfer, TransferType::Bulk, ChannelInterrupts::DATA_TOGGLE_ERROR);
        assert!(result.is_empty());
        assert_eq!(transfer.complete_split_count, 0);
        assert_eq!(transfer.error_count, 0);
    }

    #[test]
    fn complete_split_ack_completes_and_nak_restarts() {
        let mut transfer = transfer();
        transfer.complete_split_count = 1;
        let result = run(&mut transfer, TransferType::Bulk, ChannelInterrupts::ACK);
        assert!(result.contains(ChannelInterrupts::TRANSFER_COMPLETE));

        transfer.error_count = 1;
        let result = run(
            &mut transfer,
            TransferType::Bulk,
            ChannelInterrupts::NAK | ChannelInterrupts::TRANSFER_COMPLETE,
        );
        assert!(!result.contains(ChannelInterrupts::TRANSFER_COMPLETE));
        assert_eq!(transfer.complete_split_count, 0);
        assert_eq!(transfer.error_count, 0);
    }

    #[test]
    fn interrupt_not_yet_retries_within_window() {
        let mut transfer = transfer();
        transfer.complete_split_count = 1;
        let result = run(&mut transfer, TransferType::Interrupt, ChannelInterrupts::NOT_YET);
        assert!(result.is_empty());
        assert_eq!(transfer.complete_split_count, 2);

        transfer.complete_split_count = COMPLETE_SPLIT_MAX;
        let result = run(&mut transfer, TransferType::Interrupt, ChannelInterrupts::NOT_YET);
        assert!(result.is_empty());
        assert_eq!(transfer.complete_split_count, 0);
        assert_eq!(transfer.error_count, 1);
    }

    #[test]
    fn interrupt_not_yet_after_window_fails() {
        let mut transfer = transfer();
        transfer.complete_split_count = 1;
        let result = process_split(
            &mut transfer,
            TransferType::Interrupt,
            FrameNumber::new(0x3FFE),
            FrameNumber::new(4),
            ChannelInterrupts::NOT_YET,
        );
        assert!(result.contains(ChannelInterrupts::TRANSACTION_ERROR));
        assert_eq!(transfer.complete_split_count, 0);
    }

    #[test]
    fn bulk_not_yet_just_retries() {
        let mut transfer = transfer();
        transfer.complete_split_count = 2;
        let result = run(
            &mut transfer,
            TransferType::Bulk,
            ChannelInterrupts::NOT_YET | ChannelInterrupts::TRANSFER_COMPLETE,
        );
        assert!(result.is_empty());
        assert_eq!(transfer.complete_split_count, 2);
    }
}
