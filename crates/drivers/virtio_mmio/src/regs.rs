//! virtio-mmio 第 2 版的寄存器
//!
//! 寄存器只能通过 [`VirtioMmio`] 按其读写属性访问，每次写之后都有一次内存屏障。

use core::{
    marker::PhantomData,
    sync::atomic::{fence, Ordering},
};

use bitflags::bitflags;
use memory::{PhysAddr, VirtAddr};

/// "virt"
pub const MAGIC: u32 = 0x7472_6976;
pub const VERSION: u32 = 2;

#[derive(Clone, Copy, Debug)]
pub struct ReadOnly;
#[derive(Clone, Copy, Debug)]
pub struct WriteOnly;
#[derive(Clone, Copy, Debug)]
pub struct ReadWrite;

pub trait Readable {}
pub trait Writable {}

impl Readable for ReadOnly {}
impl Readable for ReadWrite {}
impl Writable for WriteOnly {}
impl Writable for ReadWrite {}

/// 一个 32 位寄存器的偏移及其读写属性
#[derive(Clone, Copy, Debug)]
pub struct Register<A> {
    offset: usize,
    name: &'static str,
    _access: PhantomData<A>,
}

impl<A> Register<A> {
    const fn new(offset: usize, name: &'static str) -> Self {
        Self {
            offset,
            name,
            _access: PhantomData,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

pub const MAGIC_VALUE: Register<ReadOnly> = Register::new(0x000, "MagicValue");
pub const VERSION_REG: Register<ReadOnly> = Register::new(0x004, "Version");
pub const DEVICE_ID: Register<ReadOnly> = Register::new(0x008, "DeviceID");
pub const VENDOR_ID: Register<ReadOnly> = Register::new(0x00c, "VendorID");
pub const DEVICE_FEATURES: Register<ReadOnly> = Register::new(0x010, "DeviceFeatures");
pub const DEVICE_FEATURES_SEL: Register<WriteOnly> = Register::new(0x014, "DeviceFeaturesSel");
pub const DRIVER_FEATURES: Register<WriteOnly> = Register::new(0x020, "DriverFeatures");
pub const DRIVER_FEATURES_SEL: Register<WriteOnly> = Register::new(0x024, "DriverFeaturesSel");
pub const QUEUE_SEL: Register<WriteOnly> = Register::new(0x030, "QueueSel");
pub const QUEUE_NUM_MAX: Register<ReadOnly> = Register::new(0x034, "QueueNumMax");
pub const QUEUE_NUM: Register<WriteOnly> = Register::new(0x038, "QueueNum");
pub const QUEUE_READY: Register<ReadWrite> = Register::new(0x044, "QueueReady");
pub const QUEUE_NOTIFY: Register<WriteOnly> = Register::new(0x050, "QueueNotify");
pub const INTERRUPT_STATUS: Register<ReadOnly> = Register::new(0x060, "InterruptStatus");
pub const INTERRUPT_ACK: Register<WriteOnly> = Register::new(0x064, "InterruptACK");
pub const STATUS: Register<ReadWrite> = Register::new(0x070, "Status");
pub const QUEUE_DESC_LOW: Register<WriteOnly> = Register::new(0x080, "QueueDescLow");
pub const QUEUE_DESC_HIGH: Register<WriteOnly> = Register::new(0x084, "QueueDescHigh");
pub const QUEUE_AVAIL_LOW: Register<WriteOnly> = Register::new(0x090, "QueueAvailLow");
pub const QUEUE_AVAIL_HIGH: Register<WriteOnly> = Register::new(0x094, "QueueAvailHigh");
pub const QUEUE_USED_LOW: Register<WriteOnly> = Register::new(0x0a0, "QueueUsedLow");
pub const QUEUE_USED_HIGH: Register<WriteOnly> = Register::new(0x0a4, "QueueUsedHigh");
pub const CONFIG_GENERATION: Register<ReadOnly> = Register::new(0x0fc, "ConfigGeneration");
/// 设备相关配置空间的起点
pub const CONFIG: usize = 0x100;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

/// 寄存器窗口上的 32 位访问，必须是单次、不可撕裂的
pub trait RegisterBus {
    fn load32(&self, offset: usize) -> u32;
    fn store32(&self, offset: usize, value: u32);
}

impl<T: RegisterBus + ?Sized> RegisterBus for &T {
    fn load32(&self, offset: usize) -> u32 {
        (**self).load32(offset)
    }

    fn store32(&self, offset: usize, value: u32) {
        (**self).store32(offset, value);
    }
}

/// 映射到内核空间中的真实寄存器窗口
#[derive(Debug)]
pub struct MmioBus {
    base: VirtAddr,
}

impl MmioBus {
    /// # Safety
    ///
    /// `base` 开始的 4 KiB 必须是已映射的 virtio-mmio 寄存器窗口
    pub const unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }
}

impl RegisterBus for MmioBus {
    fn load32(&self, offset: usize) -> u32 {
        // SAFETY: 构造时保证窗口有效，偏移都是 4 字节对齐的
        u32::from_le(unsafe { self.base.add(offset).as_ptr::<u32>().read_volatile() })
    }

    fn store32(&self, offset: usize, value: u32) {
        // SAFETY: 同上
        unsafe {
            self.base
                .add(offset)
                .as_mut_ptr::<u32>()
                .write_volatile(value.to_le());
        }
    }
}

/// 一台 virtio-mmio 设备的寄存器
pub struct VirtioMmio<B> {
    bus: B,
}

impl<B: RegisterBus> VirtioMmio<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn read<A: Readable>(&self, reg: Register<A>) -> u32 {
        self.bus.load32(reg.offset)
    }

    /// 写寄存器，之后紧跟一次屏障，保证设备在后续访问前看到这次写入
    pub fn write<A: Writable>(&self, reg: Register<A>, value: u32) {
        self.bus.store32(reg.offset, value);
        fence(Ordering::SeqCst);
    }

    /// 把 64 位物理地址拆成低、高两半分别写入
    pub fn write_addr(&self, low: Register<WriteOnly>, high: Register<WriteOnly>, pa: PhysAddr) {
        let (lo, hi) = pa.halves();
        self.write(low, lo);
        self.write(high, hi);
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.read(STATUS))
    }

    pub fn reset(&self) {
        self.write(STATUS, 0);
    }

    /// 读-改-写，保留已有的状态位
    pub fn set_status(&self, bits: DeviceStatus) {
        let status = self.status() | bits;
        self.write(STATUS, status.bits());
    }

    pub fn config_read32(&self, offset: usize) -> u32 {
        self.bus.load32(CONFIG + offset)
    }

    /// 以两次 32 位读取读出一个 64 位配置项
    ///
    /// 读取期间 `ConfigGeneration` 变化说明配置被改写了，需要重读。
    pub fn config_read64(&self, offset: usize) -> u64 {
        const RETRIES: usize = 16;
        let mut value = 0;
        for _ in 0..RETRIES {
            let generation = self.read(CONFIG_GENERATION);
            let lo = self.config_read32(offset);
            let hi = self.config_read32(offset + 4);
            value = (u64::from(hi) << 32) | u64::from(lo);
            if self.read(CONFIG_GENERATION) == generation {
                return value;
            }
        }
        warn!("virtio: config space at {offset:#x} kept changing, using last read");
        value
    }
}
