use alloc::vec::Vec;
use core::slice;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use idallocator::RecycleAllocator;

use crate::{pages_for, KernelMemory, MapPermission, PhysAddr, VirtAddr};

/// 分配一段设备可见、物理连续、已清零的内存，返回其虚拟地址与物理地址
///
/// 大小按页向上取整，映射为 `R | W | D`，不可执行。
pub fn alloc_dma_pages<M>(mem: &M, size: usize) -> KResult<(VirtAddr, PhysAddr)>
where
    M: KernelMemory + ?Sized,
{
    let size = pages_for(size).max(1) * PAGE_SIZE;
    let pa = mem.alloc_phys(size, PAGE_SIZE).ok_or(errno::ENOMEM)?;
    let va = mem.alloc_virt(size, PAGE_SIZE).ok_or(errno::ENOMEM)?;
    mem.map(
        va,
        pa,
        size,
        MapPermission::R | MapPermission::W | MapPermission::D,
    )?;
    // SAFETY: 刚刚映射好的 size 字节，没有其他引用
    unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, size) };
    Ok((va, pa))
}

/// 一块交给设备读写的缓冲区，独占它所在的映射
#[derive(Debug)]
pub struct DmaBuffer {
    va: VirtAddr,
    pa: PhysAddr,
    len: usize,
}

impl DmaBuffer {
    pub fn alloc<M: KernelMemory + ?Sized>(mem: &M, len: usize) -> KResult<Self> {
        if len == 0 {
            return Err(errno::EINVAL);
        }
        let (va, pa) = alloc_dma_pages(mem, len)?;
        Ok(Self { va, pa, len })
    }

    /// 用一段已有的内存构造缓冲区
    ///
    /// # Safety
    ///
    /// `va` 开始的 `len` 字节必须可读写，且在缓冲区存活期间不被其他地方访问
    pub unsafe fn from_raw_parts(va: VirtAddr, pa: PhysAddr, len: usize) -> Self {
        Self { va, pa, len }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    /// 分配时记录的物理地址。驱动提交请求前仍会通过页表重新翻译
    pub fn pa(&self) -> PhysAddr {
        self.pa
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: 构造时保证了这段内存归该缓冲区独占
        unsafe { slice::from_raw_parts(self.va.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 同上
        unsafe { slice::from_raw_parts_mut(self.va.as_mut_ptr(), self.len) }
    }
}

/// 从 [`DmaPool`] 中取出的一个定长对象
#[derive(Debug)]
pub struct DmaObject {
    slot: usize,
    va: VirtAddr,
    pa: PhysAddr,
}

impl DmaObject {
    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn pa(&self) -> PhysAddr {
        self.pa
    }
}

/// 按对象大小划分的设备可见内存池
///
/// 按需向内存服务申请整页，再切成等长的对象，释放的对象优先复用。页面申请后不会归还。
pub struct DmaPool {
    stride: usize,
    per_page: usize,
    pages: Vec<(VirtAddr, PhysAddr)>,
    slots: RecycleAllocator,
    live: usize,
}

impl DmaPool {
    /// 对象大小超过一页或 `align` 不是 2 的幂时返回 `None`
    pub fn new(obj_size: usize, align: usize) -> Option<Self> {
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return None;
        }
        let stride = obj_size.max(1).next_multiple_of(align);
        if stride > PAGE_SIZE {
            return None;
        }
        Some(Self {
            stride,
            per_page: PAGE_SIZE / stride,
            pages: Vec::new(),
            slots: RecycleAllocator::new(),
            live: 0,
        })
    }

    pub fn alloc<M: KernelMemory + ?Sized>(&mut self, mem: &M) -> KResult<DmaObject> {
        let slot = self.slots.alloc().ok_or(errno::ENOMEM)?;
        let page = slot / self.per_page;
        if page >= self.pages.len() {
            match alloc_dma_pages(mem, PAGE_SIZE) {
                Ok(frame) => {
                    trace!("dma pool (stride {}) grows to {} pages", self.stride, page + 1);
                    self.pages.push(frame);
                }
                Err(e) => {
                    self.slots.dealloc(slot);
                    return Err(e);
                }
            }
        }
        let Some(&(page_va, page_pa)) = self.pages.get(page) else {
            self.slots.dealloc(slot);
            return Err(errno::ENOMEM);
        };
        let offset = (slot % self.per_page) * self.stride;
        let va = page_va.add(offset);
        // SAFETY: 该槽位刚被分配，没有其他持有者
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, self.stride) };
        self.live += 1;
        Ok(DmaObject {
            slot,
            va,
            pa: page_pa + offset,
        })
    }

    pub fn dealloc(&mut self, obj: DmaObject) {
        self.slots.dealloc(obj.slot);
        self.live -= 1;
    }

    /// 尚未归还的对象数
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn pages(&self) -> usize {
        self.pages.len()
    }
}
