//! Hardware drivers for CrabOTG
//!
//! This module contains the USB host controller driver and the simple
//! peripheral bus arbitration it shares a platform with.

pub mod mmio;
pub mod spb;
pub mod usb;
