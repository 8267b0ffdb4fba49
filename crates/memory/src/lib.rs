#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate kernel_tracer;

mod address;
mod dma;
mod hal;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

use defines::config::{PAGE_SIZE, PA_TO_VA};

pub use self::address::{PhysAddr, VirtAddr};
pub use self::dma::{alloc_dma_pages, DmaBuffer, DmaObject, DmaPool};
pub use self::hal::{KernelMemory, MapPermission};

#[inline]
pub const fn kernel_pa_to_va(pa: PhysAddr) -> VirtAddr {
    VirtAddr(pa.0 + PA_TO_VA)
}

/// 覆盖 `size` 字节所需的页数
#[inline]
pub const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_window_is_linear() {
        let pa = PhysAddr(0x1000_1000);
        let va = kernel_pa_to_va(pa);
        assert_eq!(va.0, 0xFFFF_FFFF_1000_1000);
        assert_eq!(kernel_pa_to_va(pa + PAGE_SIZE).0 - va.0, PAGE_SIZE);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}
