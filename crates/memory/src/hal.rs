use bitflags::bitflags;
use defines::error::KResult;

use crate::{PhysAddr, VirtAddr};

bitflags! {
    /// 映射权限：`R W X U G` 与页表项权限位一致，`D` 表示设备可见（DMA）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const D = 1 << 6;
    }
}

/// 驱动所需的内存服务，由内核的帧分配器和页表提供
///
/// 所有分配都以页为粒度，`size` 会被向上取整到页。
pub trait KernelMemory {
    /// 分配物理连续的内存
    fn alloc_phys(&self, size: usize, align: usize) -> Option<PhysAddr>;
    /// 分配一段内核虚拟地址空间（尚未映射）
    fn alloc_virt(&self, size: usize, align: usize) -> Option<VirtAddr>;
    fn map(&self, va: VirtAddr, pa: PhysAddr, size: usize, perm: MapPermission) -> KResult<()>;
    /// 查询已映射虚拟地址对应的物理地址
    fn translate(&self, va: VirtAddr) -> Option<PhysAddr>;
}

impl<T: KernelMemory + ?Sized> KernelMemory for &T {
    fn alloc_phys(&self, size: usize, align: usize) -> Option<PhysAddr> {
        (**self).alloc_phys(size, align)
    }

    fn alloc_virt(&self, size: usize, align: usize) -> Option<VirtAddr> {
        (**self).alloc_virt(size, align)
    }

    fn map(&self, va: VirtAddr, pa: PhysAddr, size: usize, perm: MapPermission) -> KResult<()> {
        (**self).map(va, pa, size, perm)
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        (**self).translate(va)
    }
}
