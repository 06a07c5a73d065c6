//! CrabOTG - host driver for DesignWare USB 2.0 OTG controllers
//!
//! This library provides a transfer scheduler for the DesignWare Hi-Speed
//! OTG core running in host mode, together with the root port handling and
//! controller bring-up it needs, and the bus lock used by simple peripheral
//! bus drivers.
//!
//! The crate does not own interrupt routing, memory or timing. The kernel
//! embedding it supplies those through [`platform::Platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block_allocator;
pub mod config;
pub mod drivers;
pub mod logger;
pub mod platform;
