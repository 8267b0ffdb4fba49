use kernel_tracer::Level;

use crate::{
    caps::{lookup, Capability},
    regs::{
        DeviceStatus, RegisterBus, DEVICE_FEATURES, DEVICE_FEATURES_SEL, DRIVER_FEATURES,
        DRIVER_FEATURES_SEL,
    },
    transport::{DeviceState, Transport},
    VirtioError,
};

/// 一次特性协商的结果，都是第 0 个 32 位特性字中的位
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Negotiation {
    /// 设备提供的
    pub offered: u32,
    /// 驱动要求的，总是 `offered` 的子集
    pub requested: u32,
    /// 表中有记载但驱动不支持的
    pub declined: u32,
    /// 哪张表中都没有记载的
    pub undocumented: u32,
}

impl Negotiation {
    /// 第 `bit` 位是否被协商下来，超出 32 位特性字的位总是 `false`
    pub fn has(&self, bit: u32) -> bool {
        bit < u32::BITS && self.requested & (1 << bit) != 0
    }
}

/// 按表的顺序逐张核对设备提供的特性位
pub fn select_features(offered: u32, tables: &[&[Capability]]) -> Negotiation {
    let mut remaining = offered;
    let mut requested = 0;
    let mut declined = 0;
    for cap in tables.iter().flat_map(|table| table.iter()) {
        let mask = cap.mask();
        if remaining & mask == 0 {
            continue;
        }
        if cap.support {
            requested |= mask;
        } else {
            declined |= mask;
        }
        remaining &= !mask;
    }
    Negotiation {
        offered,
        requested,
        declined,
        undocumented: remaining,
    }
}

impl<B: RegisterBus> Transport<B> {
    /// 协商特性，设备拒绝时返回 `FeaturesRejected`，此后不再写 `Status`
    pub fn negotiate(&mut self, tables: &[&[Capability]]) -> Result<Negotiation, VirtioError> {
        if self.state() != DeviceState::Acknowledged {
            return Err(VirtioError::NotReady);
        }
        let mmio = self.mmio();
        mmio.write(DEVICE_FEATURES_SEL, 0);
        mmio.write(DRIVER_FEATURES_SEL, 0);
        let offered = mmio.read(DEVICE_FEATURES);
        let result = select_features(offered, tables);

        if log_enabled!(Level::Info) {
            for_each_bit(result.declined, |bit| {
                if let Some(cap) = lookup(tables, bit) {
                    info!("virtio: device offers {}, not used: {}", cap.name, cap.help);
                }
            });
        }
        if result.undocumented != 0 {
            warn!("virtio: device offers undocumented feature bits {:#x}", result.undocumented);
        }

        mmio.write(DRIVER_FEATURES, result.requested);
        mmio.set_status(DeviceStatus::FEATURES_OK);
        if !mmio.status().contains(DeviceStatus::FEATURES_OK) {
            error!("virtio: device rejected features {:#x}", result.requested);
            return Err(VirtioError::FeaturesRejected {
                requested: result.requested,
            });
        }
        debug!(
            "virtio: features offered {:#x}, requested {:#x}",
            result.offered, result.requested
        );
        self.set_state(DeviceState::FeaturesNegotiated);
        Ok(result)
    }
}

fn for_each_bit(mut bits: u32, mut f: impl FnMut(u32)) {
    while bits != 0 {
        f(bits.trailing_zeros());
        bits &= bits - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        caps::{BLK_CAPS, TRANSPORT_CAPS},
        fake::FakeDevice,
        regs::STATUS,
        transport::probe,
    };
    use kernel_tracer::capture;
    use memory::fake::FakeMemory;

    const SIZE_MAX: u32 = 1 << 1;
    const BLK_SIZE: u32 = 1 << 6;

    fn only_size_max() -> [Capability; 1] {
        [Capability {
            name: "SIZE_MAX",
            bit: 1,
            support: true,
            help: "",
        }]
    }

    #[test]
    fn unknown_bit_is_reported_not_requested() {
        let table = only_size_max();
        let result = select_features(SIZE_MAX | 1 << 20, &[&table]);
        assert_eq!(result.requested, SIZE_MAX);
        assert_eq!(result.undocumented, 1 << 20);
        assert_eq!(result.declined, 0);
    }

    #[test]
    fn request_is_subset_of_supported_offer() {
        let tables = [BLK_CAPS, TRANSPORT_CAPS];
        let supported = tables
            .iter()
            .flat_map(|t| t.iter())
            .filter(|c| c.support)
            .fold(0, |acc, c| acc | c.mask());
        let documented = tables
            .iter()
            .flat_map(|t| t.iter())
            .fold(0, |acc, c| acc | c.mask());
        let mut offered = 0x9e37_79b9u32;
        for _ in 0..256 {
            let result = select_features(offered, &tables);
            assert_eq!(result.requested, offered & supported);
            assert_eq!(result.declined, offered & documented & !supported);
            assert_eq!(result.undocumented, offered & !documented);
            assert_eq!(
                result.requested | result.declined | result.undocumented,
                offered
            );
            offered = offered.rotate_left(5) ^ offered.wrapping_mul(0x0101_0101);
        }
    }

    #[test]
    fn negotiate_writes_request_and_features_ok() {
        let dev = FakeDevice::block(FakeMemory::new(), 64).with_features(SIZE_MAX | 1 << 20);
        let mut transport = probe(&dev).unwrap();
        transport.handshake();
        let table = only_size_max();
        let result = transport.negotiate(&[&table]).unwrap();
        assert_eq!(result.requested, SIZE_MAX);
        assert_eq!(dev.driver_features(), SIZE_MAX);
        assert_eq!(dev.status(), 0x0b);
        assert_eq!(transport.state(), DeviceState::FeaturesNegotiated);
        assert!(result.has(1) && !result.has(20));
        assert!(!result.has(32) && !result.has(u32::MAX));
    }

    #[test]
    fn offered_but_unused_bits_are_logged() {
        assert!(capture::install());
        let dev = FakeDevice::block(FakeMemory::new(), 64)
            .with_features(BLK_SIZE | (1 << 9) | (1 << 20));
        let mut transport = probe(&dev).unwrap();
        transport.handshake();
        let result = transport.negotiate(&[BLK_CAPS, TRANSPORT_CAPS]).unwrap();
        assert_eq!(result.requested, BLK_SIZE);
        assert!(capture::contains("undocumented feature bits 0x100000"));
        assert!(capture::contains("VIRTIO_BLK_F_FLUSH, not used"));
    }

    #[test]
    fn rejection_stops_status_writes() {
        let dev = FakeDevice::block(FakeMemory::new(), 64)
            .with_features(BLK_SIZE)
            .rejecting_features();
        let mut transport = probe(&dev).unwrap();
        transport.handshake();
        let err = transport.negotiate(&[BLK_CAPS]).unwrap_err();
        assert_eq!(err, VirtioError::FeaturesRejected { requested: BLK_SIZE });
        let last_status = dev
            .writes()
            .iter()
            .rev()
            .find(|&&(offset, _)| offset == STATUS.offset())
            .map(|&(_, value)| value);
        assert_eq!(last_status, Some(0x0b));
        assert_eq!(dev.status(), 0x03);
    }

    #[test]
    fn negotiate_requires_handshake() {
        let dev = FakeDevice::block(FakeMemory::new(), 64);
        let mut transport = probe(&dev).unwrap();
        assert_eq!(
            transport.negotiate(&[BLK_CAPS]).unwrap_err(),
            VirtioError::NotReady
        );
    }
}
