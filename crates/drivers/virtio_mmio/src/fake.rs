//! 寄存器级的 virtio-mmio 块设备替身
//!
//! 设备通过 [`FakeMemory`] 以物理地址访问队列和缓冲区，收到 `QueueNotify` 时可以立即处理请求。

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};

use hal::IrqController;
use memory::{fake::FakeMemory, PhysAddr};
use spin::Mutex;

use crate::{
    blk::SECTOR_SIZE,
    regs::{self, DeviceStatus, RegisterBus},
};

/// 未写过的扇区中第 `i` 个字节的内容
pub fn sector_byte(sector: u64, i: usize) -> u8 {
    (sector as usize).wrapping_mul(7).wrapping_add(i) as u8
}

struct Queue {
    ready: bool,
    num: u32,
    desc: u64,
    avail: u64,
    used: u64,
    last_avail: u16,
    used_idx: u16,
}

impl Queue {
    const fn new() -> Self {
        Self {
            ready: false,
            num: 0,
            desc: 0,
            avail: 0,
            used: 0,
            last_avail: 0,
            used_idx: 0,
        }
    }
}

struct State {
    mem: FakeMemory,
    magic: u32,
    version: u32,
    device_id: u32,
    vendor_id: u32,
    features: u32,
    queue_max: u32,
    capacity: u64,
    blk_size: u32,
    reject_features: bool,
    auto_complete: bool,
    failing_sector: Option<u64>,

    status: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u32,
    queue_sel: u32,
    queue: Queue,
    interrupt_status: u32,
    notifies: usize,
    disk: BTreeMap<u64, Vec<u8>>,
    writes: Vec<(usize, u32)>,
}

/// 克隆出来的句柄共享同一台设备
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<State>>,
}

impl FakeDevice {
    /// 一台容量为 `capacity` 扇区的块设备，默认不提供任何特性，请求在通知时立即完成
    pub fn block(mem: FakeMemory, capacity: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                mem,
                magic: regs::MAGIC,
                version: regs::VERSION,
                device_id: 2,
                vendor_id: 0x554d_4551,
                features: 0,
                queue_max: 256,
                capacity,
                blk_size: SECTOR_SIZE as u32,
                reject_features: false,
                auto_complete: true,
                failing_sector: None,
                status: 0,
                device_features_sel: 0,
                driver_features_sel: 0,
                driver_features: 0,
                queue_sel: 0,
                queue: Queue::new(),
                interrupt_status: 0,
                notifies: 0,
                disk: BTreeMap::new(),
                writes: Vec::new(),
            })),
        }
    }

    fn with(self, f: impl FnOnce(&mut State)) -> Self {
        f(&mut self.state.lock());
        self
    }

    pub fn with_magic(self, magic: u32) -> Self {
        self.with(|s| s.magic = magic)
    }

    pub fn with_version(self, version: u32) -> Self {
        self.with(|s| s.version = version)
    }

    pub fn with_device_id(self, device_id: u32) -> Self {
        self.with(|s| s.device_id = device_id)
    }

    /// 第 0 个特性字
    pub fn with_features(self, features: u32) -> Self {
        self.with(|s| s.features = features)
    }

    pub fn with_queue_max(self, queue_max: u32) -> Self {
        self.with(|s| s.queue_max = queue_max)
    }

    /// 驱动置上 `FEATURES_OK` 时将其清除
    pub fn rejecting_features(self) -> Self {
        self.with(|s| s.reject_features = true)
    }

    pub fn with_auto_complete(self, auto_complete: bool) -> Self {
        self.with(|s| s.auto_complete = auto_complete)
    }

    /// 对该扇区的请求以 `IOERR` 完成
    pub fn with_failing_sector(self, sector: u64) -> Self {
        self.with(|s| s.failing_sector = Some(sector))
    }

    /// 驱动写过的所有寄存器，按顺序
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    pub fn status(&self) -> u32 {
        self.state.lock().status
    }

    pub fn driver_features(&self) -> u32 {
        self.state.lock().driver_features
    }

    pub fn queue_ready(&self) -> bool {
        self.state.lock().queue.ready
    }

    pub fn queue_num(&self) -> u32 {
        self.state.lock().queue.num
    }

    /// 描述符表、可用环、已用环的物理地址
    pub fn queue_addrs(&self) -> [u64; 3] {
        let s = self.state.lock();
        [s.queue.desc, s.queue.avail, s.queue.used]
    }

    pub fn notifies(&self) -> usize {
        self.state.lock().notifies
    }

    pub fn interrupt_status(&self) -> u32 {
        self.state.lock().interrupt_status
    }

    /// 驱动写入过的扇区内容
    pub fn disk_sector(&self, sector: u64) -> Option<Vec<u8>> {
        self.state.lock().disk.get(&sector).cloned()
    }

    /// 处理可用环中所有尚未处理的请求
    pub fn process(&self) {
        self.state.lock().process();
    }

    /// 不看可用环，直接向已用环放入一项
    pub fn complete_raw(&self, id: u32, len: u32) {
        self.state.lock().push_used(id, len);
    }
}

impl RegisterBus for FakeDevice {
    fn load32(&self, offset: usize) -> u32 {
        let s = self.state.lock();
        let selected = s.queue_sel == 0;
        match offset {
            0x000 => s.magic,
            0x004 => s.version,
            0x008 => s.device_id,
            0x00c => s.vendor_id,
            0x010 => match s.device_features_sel {
                0 => s.features,
                // VIRTIO_F_VERSION_1
                1 => 1,
                _ => 0,
            },
            0x034 if selected => s.queue_max,
            0x044 if selected => u32::from(s.queue.ready),
            0x060 => s.interrupt_status,
            0x070 => s.status,
            0x0fc => 0,
            0x100 => s.capacity as u32,
            0x104 => (s.capacity >> 32) as u32,
            0x114 => s.blk_size,
            _ => 0,
        }
    }

    fn store32(&self, offset: usize, value: u32) {
        let mut s = self.state.lock();
        s.writes.push((offset, value));
        let selected = s.queue_sel == 0;
        match offset {
            0x014 => s.device_features_sel = value,
            0x020 if s.driver_features_sel == 0 => s.driver_features = value,
            0x024 => s.driver_features_sel = value,
            0x030 => s.queue_sel = value,
            0x038 if selected => s.queue.num = value,
            0x044 if selected => s.queue.ready = value == 1,
            0x050 => {
                s.notifies += 1;
                if s.auto_complete {
                    s.process();
                }
            }
            0x064 => s.interrupt_status &= !value,
            0x070 if value == 0 => s.reset(),
            0x070 => {
                let mut status = value;
                if s.reject_features {
                    status &= !DeviceStatus::FEATURES_OK.bits();
                }
                s.status = status;
            }
            0x080 if selected => set_low(&mut s.queue.desc, value),
            0x084 if selected => set_high(&mut s.queue.desc, value),
            0x090 if selected => set_low(&mut s.queue.avail, value),
            0x094 if selected => set_high(&mut s.queue.avail, value),
            0x0a0 if selected => set_low(&mut s.queue.used, value),
            0x0a4 if selected => set_high(&mut s.queue.used, value),
            _ => {}
        }
    }
}

fn set_low(addr: &mut u64, value: u32) {
    *addr = (*addr & !0xffff_ffff) | u64::from(value);
}

fn set_high(addr: &mut u64, value: u32) {
    *addr = (*addr & 0xffff_ffff) | (u64::from(value) << 32);
}

fn pa(addr: u64) -> PhysAddr {
    PhysAddr(addr as usize)
}

impl State {
    fn reset(&mut self) {
        self.status = 0;
        self.driver_features = 0;
        self.queue_sel = 0;
        self.queue = Queue::new();
        self.interrupt_status = 0;
    }

    fn read16(&self, addr: u64) -> u16 {
        let mut buf = [0; 2];
        self.mem.read_phys(pa(addr), &mut buf);
        u16::from_le_bytes(buf)
    }

    fn write16(&self, addr: u64, value: u16) {
        self.mem.write_phys(pa(addr), &value.to_le_bytes());
    }

    /// 返回 `(addr, len, flags, next)`
    fn descriptor(&self, index: u16) -> (u64, u32, u16, u16) {
        let mut raw = [0u8; 16];
        self.mem
            .read_phys(pa(self.queue.desc + 16 * u64::from(index)), &mut raw);
        let word = |range: core::ops::Range<usize>| {
            raw[range]
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
        };
        (
            word(0..8),
            word(8..12) as u32,
            word(12..14) as u16,
            word(14..16) as u16,
        )
    }

    fn push_used(&mut self, id: u32, len: u32) {
        let q = &self.queue;
        if q.num == 0 {
            return;
        }
        let slot = u64::from(q.used_idx % q.num as u16);
        let elem = q.used + 4 + 8 * slot;
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&id.to_le_bytes());
        raw[4..].copy_from_slice(&len.to_le_bytes());
        self.mem.write_phys(pa(elem), &raw);
        self.queue.used_idx = self.queue.used_idx.wrapping_add(1);
        self.write16(self.queue.used + 2, self.queue.used_idx);
        self.interrupt_status |= 1;
    }

    fn process(&mut self) {
        if !self.queue.ready || self.queue.num == 0 {
            return;
        }
        let num = self.queue.num as u16;
        let avail_idx = self.read16(self.queue.avail + 2);
        while self.queue.last_avail != avail_idx {
            let slot = u64::from(self.queue.last_avail % num);
            let head = self.read16(self.queue.avail + 4 + 2 * slot);
            self.queue.last_avail = self.queue.last_avail.wrapping_add(1);
            let written = self.handle(head, num);
            self.push_used(u32::from(head), written);
        }
    }

    /// 执行以 `head` 开头的请求，返回写入驱动内存的字节数
    fn handle(&mut self, head: u16, num: u16) -> u32 {
        let mut chain = Vec::new();
        let mut index = head;
        for _ in 0..num {
            let desc = self.descriptor(index);
            chain.push(desc);
            if desc.2 & 1 == 0 {
                break;
            }
            index = desc.3;
        }
        let [header, data @ .., status] = chain.as_slice() else {
            return 0;
        };
        let mut raw = [0u8; 16];
        self.mem.read_phys(pa(header.0), &mut raw);
        let req_type = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut sector_bytes = [0u8; 8];
        sector_bytes.copy_from_slice(&raw[8..]);
        let sector = u64::from_le_bytes(sector_bytes);

        let mut written = 0;
        let ok = sector < self.capacity && self.failing_sector != Some(sector);
        let code = match (req_type, data) {
            (0, [data]) if ok => {
                let content = self.disk.get(&sector).cloned().unwrap_or_else(|| {
                    (0..SECTOR_SIZE).map(|i| sector_byte(sector, i)).collect()
                });
                let len = (data.1 as usize).min(content.len());
                self.mem.write_phys(pa(data.0), &content[..len]);
                written += len as u32;
                0
            }
            (1, [data]) if ok => {
                let mut content = vec![0u8; data.1 as usize];
                self.mem.read_phys(pa(data.0), &mut content);
                self.disk.insert(sector, content);
                0
            }
            (0 | 1, _) => 1,
            _ => 2,
        };
        self.mem.write_phys(pa(status.0), &[code]);
        written + 1
    }
}

/// 记录被打开的中断线
#[derive(Default)]
pub struct FakeIrq {
    lines: Mutex<Vec<usize>>,
}

impl FakeIrq {
    pub fn lines(&self) -> Vec<usize> {
        self.lines.lock().clone()
    }
}

impl IrqController for FakeIrq {
    fn enable(&self, line: usize) {
        self.lines.lock().push(line);
    }
}
