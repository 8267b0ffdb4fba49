//! split virtqueue
//!
//! 一个队列的描述符表、可用环、已用环和两个事件索引都放在同一个物理页里：
//!
//! ```text
//! desc[len] | avail{flags, idx, ring[len]} | used_event | used{flags, idx, ring[len]} | avail_event
//! ```

use alloc::vec::Vec;
use core::{
    mem::size_of,
    sync::atomic::{fence, Ordering},
};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use defines::config::PAGE_SIZE;
use idallocator::RecycleAllocator;
use memory::{KernelMemory, MapPermission, PhysAddr, VirtAddr};

use crate::{
    regs::{
        RegisterBus, VirtioMmio, QUEUE_AVAIL_HIGH, QUEUE_AVAIL_LOW, QUEUE_DESC_HIGH,
        QUEUE_DESC_LOW, QUEUE_NUM, QUEUE_NUM_MAX, QUEUE_READY, QUEUE_SEL, QUEUE_USED_HIGH,
        QUEUE_USED_LOW,
    },
    VirtioError,
};

/// 协议允许的最大队列长度
pub const MAX_QUEUE_LEN: u16 = 32768;
/// 一条请求链最多用几个描述符
pub const MAX_CHAIN: usize = 4;

const DESC_ALIGN: usize = 16;
const AVAIL_ALIGN: usize = 2;
const USED_ALIGN: usize = 4;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        const NEXT = 1;
        /// 设备写、驱动读
        const WRITE = 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtqUsedElem {
    /// 链头描述符的下标
    pub id: u32,
    /// 设备写入的总字节数
    pub len: u32,
}

const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// 各区域相对于队列页起点的偏移，`size` 是整个队列占用的字节数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueLayout {
    pub len: u16,
    pub desc: usize,
    pub avail: usize,
    pub used_event: usize,
    pub used: usize,
    pub avail_event: usize,
    pub size: usize,
}

impl QueueLayout {
    pub const fn new(len: u16) -> Self {
        let n = len as usize;
        let desc = 0;
        let avail = align_up(desc + size_of::<VirtqDesc>() * n, AVAIL_ALIGN);
        let used_event = align_up(avail + 4 + 2 * n, AVAIL_ALIGN);
        let used = align_up(used_event + 2, USED_ALIGN);
        let avail_event = align_up(used + 4 + size_of::<VirtqUsedElem>() * n, AVAIL_ALIGN);
        Self {
            len,
            desc,
            avail,
            used_event,
            used,
            avail_event,
            size: avail_event + 2,
        }
    }

    pub const fn fits_in(&self, limit: usize) -> bool {
        self.size <= limit
    }
}

const _: () = assert!(QueueLayout::new(0).desc % DESC_ALIGN == 0);

/// 描述符链中的一段缓冲区
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub pa: PhysAddr,
    pub len: u32,
    /// 设备向这段缓冲区写入
    pub device_writes: bool,
}

/// 从已用环中取出的一项
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsedBuffer {
    pub head: u16,
    pub len: u32,
}

pub struct VirtQueue {
    layout: QueueLayout,
    va: VirtAddr,
    pa: PhysAddr,
    free: RecycleAllocator,
    /// 在途链的链头
    heads: Vec<bool>,
    /// 驱动自己维护的 `avail.idx` 副本
    avail_idx: u16,
    /// 下一个要处理的已用环位置
    last_used: u16,
}

impl VirtQueue {
    /// 分配一页物理内存并映射，初始化一个长度为 `len` 的队列
    ///
    /// `len` 必须是 2 的幂，否则 16 位的环索引回绕时会与环上的位置错开。
    pub fn new<M: KernelMemory + ?Sized>(mem: &M, len: u16) -> Result<Self, VirtioError> {
        if !len.is_power_of_two() || len > MAX_QUEUE_LEN {
            return Err(VirtioError::InvalidQueueLen { len });
        }
        let layout = QueueLayout::new(len);
        if !layout.fits_in(PAGE_SIZE) {
            warn!(
                "virtio: queue of length {len} needs {} bytes, more than a page",
                layout.size
            );
            return Err(VirtioError::QueueTooLarge {
                len,
                size: layout.size,
            });
        }
        let pa = mem
            .alloc_phys(PAGE_SIZE, PAGE_SIZE)
            .ok_or(VirtioError::NoMemory)?;
        let va = mem
            .alloc_virt(PAGE_SIZE, PAGE_SIZE)
            .ok_or(VirtioError::NoMemory)?;
        mem.map(
            va,
            pa,
            PAGE_SIZE,
            MapPermission::R | MapPermission::W | MapPermission::D,
        )
        .map_err(|e| {
            warn!("virtio: failed to map queue page: {e}");
            VirtioError::NoMemory
        })?;
        // SAFETY: 刚映射的一页，归该队列独占
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };

        let queue = Self {
            layout,
            va,
            pa,
            free: RecycleAllocator::bounded(len as usize),
            heads: alloc::vec![false; len as usize],
            avail_idx: 0,
            last_used: 0,
        };
        queue.store16(layout.avail, 0);
        queue.store16(layout.avail + 2, 0);
        queue.store16(layout.used + 2, 0);
        fence(Ordering::SeqCst);
        Ok(queue)
    }

    fn load16(&self, offset: usize) -> u16 {
        // SAFETY: 偏移都在队列页内且两字节对齐
        u16::from_le(unsafe { self.va.add(offset).as_ptr::<u16>().read_volatile() })
    }

    fn store16(&self, offset: usize, value: u16) {
        // SAFETY: 同上
        unsafe {
            self.va
                .add(offset)
                .as_mut_ptr::<u16>()
                .write_volatile(value.to_le());
        }
    }

    fn load32(&self, offset: usize) -> u32 {
        // SAFETY: 偏移都在队列页内且四字节对齐
        u32::from_le(unsafe { self.va.add(offset).as_ptr::<u32>().read_volatile() })
    }

    fn desc_offset(&self, index: u16) -> usize {
        self.layout.desc + size_of::<VirtqDesc>() * index as usize
    }

    fn write_desc(&self, index: u16, desc: VirtqDesc) {
        let offset = self.desc_offset(index);
        let le = VirtqDesc {
            addr: desc.addr.to_le(),
            len: desc.len.to_le(),
            flags: desc.flags.to_le(),
            next: desc.next.to_le(),
        };
        // SAFETY: 描述符在队列页内，16 字节对齐
        unsafe { self.va.add(offset).as_mut_ptr::<VirtqDesc>().write_volatile(le) };
    }

    /// 读出第 `index` 个描述符
    pub fn descriptor(&self, index: u16) -> VirtqDesc {
        let offset = self.desc_offset(index);
        // SAFETY: 同上
        let raw = unsafe { self.va.add(offset).as_ptr::<VirtqDesc>().read_volatile() };
        VirtqDesc {
            addr: u64::from_le(raw.addr),
            len: u32::from_le(raw.len),
            flags: u16::from_le(raw.flags),
            next: u16::from_le(raw.next),
        }
    }

    pub fn len(&self) -> u16 {
        self.layout.len
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.pa
    }

    pub fn desc_pa(&self) -> PhysAddr {
        self.pa + self.layout.desc
    }

    pub fn avail_pa(&self) -> PhysAddr {
        self.pa + self.layout.avail
    }

    pub fn used_pa(&self) -> PhysAddr {
        self.pa + self.layout.used
    }

    /// 内存中的 `avail.idx`
    pub fn avail_idx(&self) -> u16 {
        self.load16(self.layout.avail + 2)
    }

    /// 内存中的 `used.idx`，由设备维护
    pub fn used_idx(&self) -> u16 {
        self.load16(self.layout.used + 2)
    }

    pub fn avail_ring(&self, slot: u16) -> u16 {
        self.load16(self.layout.avail + 4 + 2 * (slot % self.len()) as usize)
    }

    pub fn used_event(&self) -> u16 {
        self.load16(self.layout.used_event)
    }

    pub fn avail_event(&self) -> u16 {
        self.load16(self.layout.avail_event)
    }

    pub fn free_descriptors(&self) -> usize {
        self.free.available()
    }

    pub fn in_flight(&self) -> usize {
        self.heads.iter().filter(|&&live| live).count()
    }

    /// 把若干段缓冲区串成一条描述符链，返回链头
    ///
    /// 链只是写进了描述符表，调用 [`VirtQueue::publish`] 之后设备才能看到。
    pub fn add_chain(&mut self, segments: &[Segment]) -> Result<u16, VirtioError> {
        if segments.is_empty() || segments.len() > MAX_CHAIN {
            return Err(VirtioError::BadBuffer);
        }
        if self.free.available() < segments.len() {
            return Err(VirtioError::QueueFull);
        }
        let mut ids = heapless::Vec::<u16, MAX_CHAIN>::new();
        for _ in segments {
            let Some(id) = self.free.alloc() else {
                for &id in &ids {
                    self.free.dealloc(id as usize);
                }
                return Err(VirtioError::QueueFull);
            };
            // 长度不超过 MAX_CHAIN，id 小于队列长度
            let _ = ids.push(id as u16);
        }
        for (i, seg) in segments.iter().enumerate() {
            let mut flags = DescFlags::empty();
            if seg.device_writes {
                flags |= DescFlags::WRITE;
            }
            let next = match ids.get(i + 1) {
                Some(&next) => {
                    flags |= DescFlags::NEXT;
                    next
                }
                None => 0,
            };
            self.write_desc(
                ids[i],
                VirtqDesc {
                    addr: seg.pa.0 as u64,
                    len: seg.len,
                    flags: flags.bits(),
                    next,
                },
            );
        }
        let head = ids[0];
        self.heads[head as usize] = true;
        Ok(head)
    }

    /// 把链头放进可用环，然后增加 `avail.idx`
    pub fn publish(&mut self, head: u16) {
        let slot = self.avail_idx % self.len();
        self.store16(self.layout.avail + 4 + 2 * slot as usize, head);
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.store16(self.layout.avail + 2, self.avail_idx);
        fence(Ordering::SeqCst);
    }

    /// 设备是否归还了新的链
    pub fn can_pop(&self) -> bool {
        fence(Ordering::SeqCst);
        let ready = self.used_idx() != self.last_used;
        // 读到 used.idx 之后才能读已用环中的元素
        fence(Ordering::SeqCst);
        ready
    }

    /// 取出一项已用环并回收它的描述符链
    pub fn pop_used(&mut self) -> Result<Option<UsedBuffer>, VirtioError> {
        if !self.can_pop() {
            return Ok(None);
        }
        let slot = (self.last_used % self.len()) as usize;
        let elem_offset = self.layout.used + 4 + size_of::<VirtqUsedElem>() * slot;
        let id = self.load32(elem_offset);
        let len = self.load32(elem_offset + 4);
        self.last_used = self.last_used.wrapping_add(1);

        let head = match u16::try_from(id) {
            Ok(head) if head < self.len() && self.heads[head as usize] => head,
            _ => {
                warn!("virtio: device returned descriptor {id} which is not in flight");
                return Err(VirtioError::UnknownRequest);
            }
        };
        self.heads[head as usize] = false;
        self.free_chain(head);
        Ok(Some(UsedBuffer { head, len }))
    }

    fn free_chain(&mut self, head: u16) {
        let mut index = head;
        for _ in 0..self.len() {
            let desc = self.descriptor(index);
            self.free.dealloc(index as usize);
            if !desc.flags().contains(DescFlags::NEXT) {
                return;
            }
            index = desc.next;
        }
    }

    /// 读取队列 `index` 的最大长度，向下取到 2 的幂。队列不存在或已经启用时失败
    pub fn max_len<B: RegisterBus>(mmio: &VirtioMmio<B>, index: u16) -> Result<u16, VirtioError> {
        mmio.write(QUEUE_SEL, u32::from(index));
        if mmio.read(QUEUE_READY) != 0 {
            warn!("virtio: queue {index} is already in use");
            return Err(VirtioError::QueueUnavailable);
        }
        match mmio.read(QUEUE_NUM_MAX) {
            0 => {
                warn!("virtio: queue {index} not available");
                Err(VirtioError::QueueUnavailable)
            }
            max => {
                let max = max.min(u32::from(MAX_QUEUE_LEN));
                Ok(1 << (u32::BITS - 1 - max.leading_zeros()))
            }
        }
    }

    /// 把队列交给设备：写入长度和三个区域的物理地址，最后置 `QueueReady`
    pub fn register<B: RegisterBus>(
        &self,
        mmio: &VirtioMmio<B>,
        index: u16,
    ) -> Result<(), VirtioError> {
        let max = Self::max_len(mmio, index)?;
        if max < self.len() {
            warn!(
                "virtio: queue {index} holds at most {max}, asked for {}",
                self.len()
            );
            return Err(VirtioError::QueueUnavailable);
        }
        mmio.write(QUEUE_NUM, u32::from(self.len()));
        mmio.write_addr(QUEUE_DESC_LOW, QUEUE_DESC_HIGH, self.desc_pa());
        mmio.write_addr(QUEUE_AVAIL_LOW, QUEUE_AVAIL_HIGH, self.avail_pa());
        mmio.write_addr(QUEUE_USED_LOW, QUEUE_USED_HIGH, self.used_pa());
        mmio.write(QUEUE_READY, 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fake::FakeDevice, regs::QUEUE_NOTIFY};
    use memory::fake::FakeMemory;

    fn seg(pa: usize, len: u32, device_writes: bool) -> Segment {
        Segment {
            pa: PhysAddr(pa),
            len,
            device_writes,
        }
    }

    #[test]
    fn layout_offsets_are_ordered_and_aligned() {
        for len in 1..=MAX_QUEUE_LEN {
            let l = QueueLayout::new(len);
            assert!(l.desc <= l.avail && l.avail <= l.used_event);
            assert!(l.used_event <= l.used && l.used <= l.avail_event);
            assert!(l.avail_event < l.size);
            assert_eq!(l.desc % DESC_ALIGN, 0);
            assert_eq!(l.avail % AVAIL_ALIGN, 0);
            assert_eq!(l.used_event % AVAIL_ALIGN, 0);
            assert_eq!(l.used % USED_ALIGN, 0);
            assert_eq!(l.avail_event % AVAIL_ALIGN, 0);
        }
    }

    #[test]
    fn known_layouts() {
        let l = QueueLayout::new(8);
        assert_eq!(
            (l.desc, l.avail, l.used_event, l.used, l.avail_event, l.size),
            (0, 128, 148, 152, 220, 222)
        );
        assert_eq!(QueueLayout::new(157).size, 4094);
        assert_eq!(QueueLayout::new(158).size, 4122);
    }

    #[test]
    fn accepted_iff_fits_in_a_page() {
        let mem = FakeMemory::new();
        for len in (0..16).map(|shift| 1u16 << shift) {
            let fits = QueueLayout::new(len).fits_in(PAGE_SIZE);
            match VirtQueue::new(&mem, len) {
                Ok(_) => assert!(fits, "len {len} accepted but does not fit"),
                Err(VirtioError::QueueTooLarge { size, .. }) => {
                    assert!(!fits && size > PAGE_SIZE);
                }
                Err(e) => panic!("len {len}: unexpected {e}"),
            }
        }
        assert!(VirtQueue::new(&mem, 128).is_ok());
        assert!(VirtQueue::new(&mem, 256).is_err());
        assert_eq!(
            VirtQueue::new(&mem, 0).err().map(|e| e.to_string()),
            Some("invalid queue length 0".into())
        );
    }

    #[test]
    fn len_must_be_power_of_two() {
        let mem = FakeMemory::new();
        for len in [3, 100, 127, 157] {
            assert_eq!(
                VirtQueue::new(&mem, len).err(),
                Some(VirtioError::InvalidQueueLen { len })
            );
        }
        assert!(mem.mappings().is_empty());
    }

    #[test]
    fn page_boundary_is_inclusive() {
        let l = QueueLayout::new(157);
        assert!(l.fits_in(l.size));
        assert!(!l.fits_in(l.size - 1));
        let page = QueueLayout {
            size: PAGE_SIZE,
            ..l
        };
        assert!(page.fits_in(PAGE_SIZE));
        let over = QueueLayout {
            size: PAGE_SIZE + 1,
            ..l
        };
        assert!(!over.fits_in(PAGE_SIZE));
    }

    #[test]
    fn fresh_queue_indices_are_zero() {
        let mem = FakeMemory::new();
        for len in [1, 8, 64, 128] {
            let queue = VirtQueue::new(&mem, len).unwrap();
            assert_eq!(queue.avail_idx(), 0);
            assert_eq!(queue.used_idx(), 0);
            assert_eq!(queue.free_descriptors(), len as usize);
            let mapping = mem
                .mappings()
                .into_iter()
                .find(|m| m.pa == queue.phys_addr())
                .unwrap();
            assert_eq!(mapping.size, PAGE_SIZE);
            assert!(mapping.perm.contains(MapPermission::D));
            assert!(!mapping.perm.contains(MapPermission::X));
        }
    }

    #[test]
    fn chain_links_and_publishes() {
        let mem = FakeMemory::new();
        let mut queue = VirtQueue::new(&mem, 8).unwrap();
        let head = queue
            .add_chain(&[
                seg(0x1000, 16, false),
                seg(0x2000, 512, true),
                seg(0x1010, 1, true),
            ])
            .unwrap();
        assert_eq!(head, 0);
        let d: Vec<_> = (0..3).map(|i| queue.descriptor(i)).collect();
        assert_eq!((d[0].next, d[1].next, d[2].next), (1, 2, 0));
        assert_eq!(d[0].flags(), DescFlags::NEXT);
        assert_eq!(d[1].flags(), DescFlags::WRITE | DescFlags::NEXT);
        assert_eq!(d[2].flags(), DescFlags::WRITE);
        assert_eq!((d[1].addr, d[1].len), (0x2000, 512));

        queue.publish(head);
        assert_eq!(queue.avail_idx(), 1);
        assert_eq!(queue.avail_ring(0), 0);
        assert_eq!(queue.free_descriptors(), 5);
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.pop_used(), Ok(None));
    }

    #[test]
    fn full_queue_is_refused() {
        let mem = FakeMemory::new();
        let mut queue = VirtQueue::new(&mem, 4).unwrap();
        let segs = [seg(0x1000, 16, false), seg(0x2000, 512, true), seg(0x1010, 1, true)];
        queue.add_chain(&segs).unwrap();
        assert_eq!(queue.add_chain(&segs), Err(VirtioError::QueueFull));
        assert_eq!(queue.free_descriptors(), 1);
        assert_eq!(queue.add_chain(&[]), Err(VirtioError::BadBuffer));
    }

    #[test]
    fn register_programs_addresses_before_ready() {
        let mem = FakeMemory::new();
        let dev = FakeDevice::block(mem.clone(), 64);
        let mmio = VirtioMmio::new(&dev);
        let queue = VirtQueue::new(&mem, 8).unwrap();
        queue.register(&mmio, 0).unwrap();
        assert_eq!(dev.queue_num(), 8);
        assert_eq!(dev.queue_addrs(), [
            queue.desc_pa().0 as u64,
            queue.avail_pa().0 as u64,
            queue.used_pa().0 as u64,
        ]);
        let writes = dev.writes();
        let ready = writes
            .iter()
            .position(|&(offset, _)| offset == QUEUE_READY.offset())
            .unwrap();
        assert_eq!(ready, writes.len() - 1);
        assert!(writes[..ready]
            .iter()
            .any(|&(offset, _)| offset == QUEUE_USED_HIGH.offset()));
        assert!(writes.iter().all(|&(offset, _)| offset != QUEUE_NOTIFY.offset()));

        // 已经启用的队列不能再注册
        assert_eq!(queue.register(&mmio, 0), Err(VirtioError::QueueUnavailable));
    }

    #[test]
    fn register_checks_queue_max() {
        let mem = FakeMemory::new();
        let dev = FakeDevice::block(mem.clone(), 64).with_queue_max(4);
        let mmio = VirtioMmio::new(&dev);
        let queue = VirtQueue::new(&mem, 8).unwrap();
        assert_eq!(queue.register(&mmio, 0), Err(VirtioError::QueueUnavailable));
        assert_eq!(VirtQueue::max_len(&mmio, 0), Ok(4));
        assert_eq!(VirtQueue::max_len(&mmio, 1), Err(VirtioError::QueueUnavailable));

        let odd = FakeDevice::block(mem.clone(), 64).with_queue_max(100);
        assert_eq!(VirtQueue::max_len(&VirtioMmio::new(&odd), 0), Ok(64));
    }

    #[test]
    fn completed_chain_is_recycled() {
        let mem = FakeMemory::new();
        let dev = FakeDevice::block(mem.clone(), 64).with_auto_complete(false);
        let mmio = VirtioMmio::new(&dev);
        let mut queue = VirtQueue::new(&mem, 8).unwrap();
        queue.register(&mmio, 0).unwrap();
        let head = queue
            .add_chain(&[seg(0x1000, 16, false), seg(0x1010, 1, true)])
            .unwrap();
        queue.publish(head);
        dev.complete_raw(head as u32, 1);
        assert_eq!(queue.pop_used(), Ok(Some(UsedBuffer { head, len: 1 })));
        assert_eq!(queue.free_descriptors(), 8);
        assert_eq!(queue.in_flight(), 0);

        dev.complete_raw(5, 0);
        assert_eq!(queue.pop_used(), Err(VirtioError::UnknownRequest));
    }
}
