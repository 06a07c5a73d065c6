//! Memory-mapped register access
//!
//! Drivers talk to their register block through [`RegisterAccess`] so the
//! same code runs against real MMIO or a software model of the device.

use core::ptr;

/// 32-bit register access at a byte offset from a device's register base.
pub trait RegisterAccess {
    /// Read the 32-bit register at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the 32-bit register at `offset`.
    fn write32(&self, offset: usize, value: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &T {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Volatile accessor over a mapped register window.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Create an accessor for the register window mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped, uncached register
    /// window large enough for every offset the driver touches, and it must
    /// stay mapped for the lifetime of the accessor.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address of the register window
    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterAccess for Mmio {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: the constructor's contract guarantees the window is mapped.
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: the constructor's contract guarantees the window is mapped.
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmio_reads_and_writes_backing_words() {
        let mut window = [0u32; 4];
        let base = window.as_mut_ptr() as usize;
        let mmio = unsafe { Mmio::new(base) };

        mmio.write32(0x8, 0xDEAD_BEEF);
        assert_eq!(mmio.read32(0x8), 0xDEAD_BEEF);
        assert_eq!(mmio.read32(0x0), 0);
        assert_eq!(window[2], 0xDEAD_BEEF);
    }
}
