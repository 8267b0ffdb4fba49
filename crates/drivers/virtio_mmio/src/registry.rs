use defines::config::{VIRTIO_IRQ_BASE, VIRTIO_MMIO_BASE, VIRTIO_MMIO_SLOTS, VIRTIO_MMIO_STRIDE};
use hal::IrqController;
use memory::{kernel_pa_to_va, KernelMemory, PhysAddr};

use crate::{
    blk::{BlkConfig, VirtioBlk},
    regs::{MmioBus, RegisterBus},
    transport::probe,
};

/// 启动时找到的所有块设备，按槽位号索引
pub struct BlkRegistry<B, M> {
    devices: heapless::Vec<(usize, VirtioBlk<B, M>), VIRTIO_MMIO_SLOTS>,
}

impl<B: RegisterBus, M: KernelMemory> BlkRegistry<B, M> {
    pub fn get(&self, slot: usize) -> Option<&VirtioBlk<B, M>> {
        self.devices
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, dev)| dev)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut VirtioBlk<B, M>> {
        self.devices
            .iter_mut()
            .find(|(s, _)| *s == slot)
            .map(|(_, dev)| dev)
    }

    /// 槽位号最小的块设备，用作根文件系统所在的盘
    pub fn boot_device(&mut self) -> Option<&mut VirtioBlk<B, M>> {
        self.devices
            .iter_mut()
            .min_by_key(|(slot, _)| *slot)
            .map(|(_, dev)| dev)
    }

    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.devices.iter().map(|(slot, _)| *slot)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// 逐个探测槽位并初始化其中的块设备
///
/// 某个槽位失败只会跳过这个槽位。槽位 `n` 的中断线是 `VIRTIO_IRQ_BASE + n`。
pub fn probe_slots<I, B, M, C>(slots: I, mem: M, irq: &C, cfg: BlkConfig) -> BlkRegistry<B, M>
where
    I: IntoIterator<Item = (usize, B)>,
    B: RegisterBus,
    M: KernelMemory + Clone,
    C: IrqController + ?Sized,
{
    let mut devices = heapless::Vec::new();
    for (slot, bus) in slots {
        let Ok(transport) = probe(bus) else {
            continue;
        };
        match VirtioBlk::init(transport, mem.clone(), irq, VIRTIO_IRQ_BASE + slot, cfg) {
            Ok(dev) => {
                info!("virtio slot {slot}: block device ready");
                if devices.push((slot, dev)).is_err() {
                    warn!("virtio slot {slot}: too many block devices, ignored");
                }
            }
            Err(e) if e.is_fatal() => error!("virtio slot {slot}: bring-up failed: {e}"),
            Err(e) => debug!("virtio slot {slot}: skipped: {e}"),
        }
    }
    BlkRegistry { devices }
}

/// QEMU virt 平台上的 virtio-mmio 槽位
///
/// # Safety
///
/// 所有槽位的寄存器窗口必须已经映射到内核空间
pub unsafe fn qemu_slots() -> impl Iterator<Item = (usize, MmioBus)> {
    (0..VIRTIO_MMIO_SLOTS).map(|slot| {
        let pa = PhysAddr(VIRTIO_MMIO_BASE + slot * VIRTIO_MMIO_STRIDE);
        // SAFETY: 调用者保证窗口已映射
        (slot, unsafe { MmioBus::new(kernel_pa_to_va(pa)) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeIrq};
    use memory::fake::FakeMemory;

    #[test]
    fn slot_failures_are_local() {
        let mem = FakeMemory::new();
        let slots = [
            (0, FakeDevice::block(mem.clone(), 8).with_device_id(0)),
            (1, FakeDevice::block(mem.clone(), 8).with_magic(0)),
            (2, FakeDevice::block(mem.clone(), 16)),
            (3, FakeDevice::block(mem.clone(), 8).with_device_id(1)),
            (4, FakeDevice::block(mem.clone(), 8).rejecting_features()),
            (5, FakeDevice::block(mem.clone(), 32)),
        ];
        let irq = FakeIrq::default();
        let mut registry = probe_slots(slots.clone(), mem, &irq, BlkConfig::default());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.slots().collect::<Vec<_>>(), [2, 5]);
        assert_eq!(irq.lines(), [VIRTIO_IRQ_BASE + 2, VIRTIO_IRQ_BASE + 5]);
        assert_eq!(registry.boot_device().map(|dev| dev.capacity()), Some(16));
        assert_eq!(registry.get(5).map(VirtioBlk::capacity), Some(32));
        assert!(registry.get(4).is_none());
        assert!(slots[0].1.writes().is_empty());
        assert!(slots[1].1.writes().is_empty());
        assert!(slots[3].1.writes().is_empty());
    }

    #[test]
    fn boot_device_serves_reads() {
        let mem = FakeMemory::new();
        let slots = [(7, FakeDevice::block(mem.clone(), 8))];
        let mut registry = probe_slots(slots, mem, &FakeIrq::default(), BlkConfig::default());
        let dev = registry.get_mut(7).unwrap();
        dev.submit_scratch_read(1).unwrap();
        assert!(dev.poll_completion().unwrap().is_some());
        assert!(!registry.is_empty());
    }
}
