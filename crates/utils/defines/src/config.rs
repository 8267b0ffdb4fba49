const KB: usize = 1024;

/// 内核地址空间中，虚拟地址相对于物理地址的偏移量
pub const PA_TO_VA: usize = 0xFFFF_FFFF_0000_0000;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;

/// 内核线程的数量（核心数）
pub const HART_NUM: usize = 8;

/// QEMU virt 平台上 PLIC 的物理地址
pub const QEMU_PLIC_ADDR: usize = 0x0c00_0000;

/// 第一个 virtio-mmio 槽位的物理地址
pub const VIRTIO_MMIO_BASE: usize = 0x1000_1000;
/// 相邻两个 virtio-mmio 槽位的间隔
pub const VIRTIO_MMIO_STRIDE: usize = 4 * KB;
/// QEMU virt 平台固定提供 8 个 virtio-mmio 槽位，大多数是空的
pub const VIRTIO_MMIO_SLOTS: usize = 8;
/// 0 号槽位对应的 PLIC 中断源，之后的槽位依次加一
pub const VIRTIO_IRQ_BASE: usize = 1;

/// 块设备请求队列的默认长度，实际长度还受设备 `QueueNumMax` 限制
pub const VIRTIO_BLK_QUEUE_LEN: u16 = 128;

const _: () = assert!(VIRTIO_MMIO_BASE % PAGE_SIZE == 0);
