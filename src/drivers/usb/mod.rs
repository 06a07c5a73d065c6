//! USB host support
//!
//! [`HostController`] is the interface the USB core drives; [`dwhci`]
//! implements it for DesignWare OTG cores.

pub mod dwhci;
mod host;

pub use self::host::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_is_eight_bytes() {
        assert_eq!(core::mem::size_of::<SetupPacket>(), 8);
        assert_eq!(core::mem::align_of::<SetupPacket>(), 1);
    }
}
