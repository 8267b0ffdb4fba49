//! 宿主机上的内存服务替身，供驱动测试使用
//!
//! 虚拟页是真实的堆内存，物理地址则是从 [`FAKE_PHYS_BASE`] 开始依次编号的假地址，
//! 只能通过记录下的映射表在两者之间换算。

use alloc::{alloc::Layout, sync::Arc, vec::Vec};
use core::ptr;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use spin::Mutex;

use crate::{pages_for, KernelMemory, MapPermission, PhysAddr, VirtAddr};

/// 第一个假物理页的地址，刻意放在 32 位地址空间内
pub const FAKE_PHYS_BASE: usize = 0x8040_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub va: VirtAddr,
    pub pa: PhysAddr,
    pub size: usize,
    pub perm: MapPermission,
}

impl Mapping {
    fn contains_va(&self, va: VirtAddr) -> bool {
        self.va <= va && va.0 < self.va.0 + self.size
    }

    fn contains_pa(&self, pa: PhysAddr) -> bool {
        self.pa <= pa && pa.0 < self.pa.0 + self.size
    }
}

struct Inner {
    next_phys: usize,
    host: Vec<(usize, Layout)>,
    mappings: Vec<Mapping>,
    exhausted: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for &(addr, layout) in &self.host {
            // SAFETY: 由 `alloc_virt` 以同样的 layout 分配
            unsafe { alloc::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

/// 可以克隆，所有克隆共享同一份状态
#[derive(Clone)]
pub struct FakeMemory {
    inner: Arc<Mutex<Inner>>,
}

impl Default for FakeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMemory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_phys: FAKE_PHYS_BASE,
                host: Vec::new(),
                mappings: Vec::new(),
                exhausted: false,
            })),
        }
    }

    /// 模拟内存耗尽，之后的分配全部失败
    pub fn set_exhausted(&self, exhausted: bool) {
        self.inner.lock().exhausted = exhausted;
    }

    pub fn mappings(&self) -> Vec<Mapping> {
        self.inner.lock().mappings.clone()
    }

    pub fn phys_to_virt(&self, pa: PhysAddr) -> Option<VirtAddr> {
        let inner = self.inner.lock();
        let m = inner.mappings.iter().find(|m| m.contains_pa(pa))?;
        Some(m.va.add(pa.0 - m.pa.0))
    }

    /// 要求 `[pa, pa + len)` 落在同一段映射中
    fn phys_range(&self, pa: PhysAddr, len: usize) -> Option<VirtAddr> {
        let inner = self.inner.lock();
        let m = inner
            .mappings
            .iter()
            .find(|m| m.contains_pa(pa) && pa.0 + len <= m.pa.0 + m.size)?;
        Some(m.va.add(pa.0 - m.pa.0))
    }

    /// 以设备的视角读物理内存
    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) -> bool {
        let Some(va) = self.phys_range(pa, buf.len()) else {
            return false;
        };
        // SAFETY: 范围在一段存活的映射中
        unsafe { ptr::copy_nonoverlapping(va.as_ptr::<u8>(), buf.as_mut_ptr(), buf.len()) };
        true
    }

    /// 以设备的视角写物理内存
    pub fn write_phys(&self, pa: PhysAddr, data: &[u8]) -> bool {
        let Some(va) = self.phys_range(pa, data.len()) else {
            return false;
        };
        // SAFETY: 范围在一段存活的映射中
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), va.as_mut_ptr::<u8>(), data.len()) };
        true
    }
}

impl KernelMemory for FakeMemory {
    fn alloc_phys(&self, size: usize, align: usize) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        if inner.exhausted {
            return None;
        }
        let start = inner.next_phys.next_multiple_of(align.max(PAGE_SIZE));
        inner.next_phys = start + pages_for(size).max(1) * PAGE_SIZE;
        Some(PhysAddr(start))
    }

    fn alloc_virt(&self, size: usize, align: usize) -> Option<VirtAddr> {
        let mut inner = self.inner.lock();
        if inner.exhausted {
            return None;
        }
        let layout =
            Layout::from_size_align(pages_for(size).max(1) * PAGE_SIZE, align.max(PAGE_SIZE))
                .ok()?;
        // SAFETY: layout 大小非零
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        inner.host.push((ptr as usize, layout));
        Some(VirtAddr::from(ptr))
    }

    fn map(&self, va: VirtAddr, pa: PhysAddr, size: usize, perm: MapPermission) -> KResult<()> {
        let mut inner = self.inner.lock();
        let backed = inner
            .host
            .iter()
            .any(|&(addr, layout)| addr <= va.0 && va.0 + size <= addr + layout.size());
        if !backed {
            return Err(errno::EFAULT);
        }
        if inner
            .mappings
            .iter()
            .any(|m| m.contains_va(va) || m.contains_pa(pa))
        {
            return Err(errno::EINVAL);
        }
        inner.mappings.push(Mapping { va, pa, size, perm });
        Ok(())
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let inner = self.inner.lock();
        let m = inner.mappings.iter().find(|m| m.contains_va(va))?;
        Some(m.pa + (va.0 - m.va.0))
    }
}
