use crate::{
    regs::{
        DeviceStatus, RegisterBus, VirtioMmio, DEVICE_ID, MAGIC, MAGIC_VALUE, VENDOR_ID, VERSION,
        VERSION_REG,
    },
    VirtioError,
};

/// virtio 设备类型，取值即 `DeviceID`
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    Net = 1,
    Block = 2,
    Console = 3,
    Entropy = 4,
    Balloon = 5,
    IoMemory = 6,
    Rpmsg = 7,
    Scsi = 8,
    NineP = 9,
}

impl DeviceClass {
    pub fn from_id(id: u32) -> Option<Self> {
        let class = match id {
            1 => Self::Net,
            2 => Self::Block,
            3 => Self::Console,
            4 => Self::Entropy,
            5 => Self::Balloon,
            6 => Self::IoMemory,
            7 => Self::Rpmsg,
            8 => Self::Scsi,
            9 => Self::NineP,
            _ => return None,
        };
        Some(class)
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Net => "network card",
            Self::Block => "block device",
            Self::Console => "console",
            Self::Entropy => "entropy source",
            Self::Balloon => "memory balloon",
            Self::IoMemory => "ioMemory",
            Self::Rpmsg => "rpmsg",
            Self::Scsi => "SCSI host",
            Self::NineP => "9P transport",
        }
    }
}

/// 驱动眼中设备的初始化进度
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Unprobed,
    Acknowledged,
    FeaturesNegotiated,
    QueueReady,
    DriverOk,
    /// 初始化中途失败，设备不可再用
    Failed,
}

/// 一台通过了探测的 virtio-mmio 设备
pub struct Transport<B> {
    mmio: VirtioMmio<B>,
    class: DeviceClass,
    vendor_id: u32,
    state: DeviceState,
}

/// 检查 `bus` 后面是否是一台认识的 virtio 设备
///
/// 只读寄存器，不做任何写入，所以探测空槽位或错误的设备都是无害的。
pub fn probe<B: RegisterBus>(bus: B) -> Result<Transport<B>, VirtioError> {
    let mmio = VirtioMmio::new(bus);
    let magic = mmio.read(MAGIC_VALUE);
    if magic != MAGIC {
        warn!("virtio: bad magic value {magic:#x}");
        return Err(VirtioError::BadMagic { found: magic });
    }
    let version = mmio.read(VERSION_REG);
    if version != VERSION {
        warn!("virtio: unsupported version {version}, expect {VERSION}");
        return Err(VirtioError::BadVersion { found: version });
    }
    let device_id = mmio.read(DEVICE_ID);
    if device_id == 0 {
        trace!("virtio: empty slot");
        return Err(VirtioError::EmptySlot);
    }
    let Some(class) = DeviceClass::from_id(device_id) else {
        warn!("virtio: unknown device id {device_id}");
        return Err(VirtioError::UnsupportedDevice { device_id });
    };
    let vendor_id = mmio.read(VENDOR_ID);
    debug!("virtio: found {} (vendor {vendor_id:#x})", class.name());
    Ok(Transport {
        mmio,
        class,
        vendor_id,
        state: DeviceState::Unprobed,
    })
}

impl<B: RegisterBus> Transport<B> {
    pub fn mmio(&self) -> &VirtioMmio<B> {
        &self.mmio
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    /// 复位设备，然后依次置上 `ACKNOWLEDGE` 和 `DRIVER`
    pub fn handshake(&mut self) {
        self.mmio.reset();
        self.mmio.set_status(DeviceStatus::ACKNOWLEDGE);
        self.mmio.set_status(DeviceStatus::DRIVER);
        self.state = DeviceState::Acknowledged;
    }

    pub fn driver_ok(&mut self) {
        self.mmio.set_status(DeviceStatus::DRIVER_OK);
        self.state = DeviceState::DriverOk;
    }

    /// 告诉设备驱动已经放弃它
    pub fn fail(&mut self) {
        self.mmio.set_status(DeviceStatus::FAILED);
        self.state = DeviceState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fake::FakeDevice, regs::STATUS};
    use kernel_tracer::capture;
    use memory::fake::FakeMemory;

    #[test]
    fn bad_magic_touches_nothing() {
        assert!(capture::install());
        let dev = FakeDevice::block(FakeMemory::new(), 64).with_magic(0x1234_5678);
        let err = probe(&dev).err();
        assert_eq!(err, Some(VirtioError::BadMagic { found: 0x1234_5678 }));
        assert!(dev.writes().is_empty());
        assert!(capture::contains("bad magic value 0x12345678"));
    }

    #[test]
    fn bad_version_and_empty_slot() {
        let legacy = FakeDevice::block(FakeMemory::new(), 64).with_version(1);
        assert_eq!(
            probe(&legacy).err(),
            Some(VirtioError::BadVersion { found: 1 })
        );
        let empty = FakeDevice::block(FakeMemory::new(), 64).with_device_id(0);
        assert_eq!(probe(&empty).err(), Some(VirtioError::EmptySlot));
        let odd = FakeDevice::block(FakeMemory::new(), 64).with_device_id(42);
        assert_eq!(
            probe(&odd).err(),
            Some(VirtioError::UnsupportedDevice { device_id: 42 })
        );
        assert!(legacy.writes().is_empty() && empty.writes().is_empty() && odd.writes().is_empty());
    }

    #[test]
    fn classifies_known_devices() {
        let net = FakeDevice::block(FakeMemory::new(), 64).with_device_id(1);
        let transport = probe(&net).ok().unwrap();
        assert_eq!(transport.class(), DeviceClass::Net);
        assert_eq!(transport.class().name(), "network card");
        assert_eq!(transport.state(), DeviceState::Unprobed);
        assert_eq!(DeviceClass::from_id(2), Some(DeviceClass::Block));
        assert_eq!(DeviceClass::Block.id(), 2);
        assert_eq!(DeviceClass::from_id(10), None);
    }

    #[test]
    fn handshake_resets_then_accumulates() {
        let dev = FakeDevice::block(FakeMemory::new(), 64);
        let mut transport = probe(&dev).ok().unwrap();
        transport.handshake();
        let status_writes: Vec<u32> = dev
            .writes()
            .iter()
            .filter(|&&(offset, _)| offset == STATUS.offset())
            .map(|&(_, value)| value)
            .collect();
        assert_eq!(status_writes, [0, 1, 3]);
        assert_eq!(transport.state(), DeviceState::Acknowledged);
    }

    #[test]
    fn fail_keeps_earlier_bits() {
        let dev = FakeDevice::block(FakeMemory::new(), 64);
        let mut transport = probe(&dev).ok().unwrap();
        transport.handshake();
        transport.fail();
        assert_eq!(dev.status(), 0x83);
        assert_eq!(transport.state(), DeviceState::Failed);
    }
}
