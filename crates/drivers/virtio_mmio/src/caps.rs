//! 驱动认识的特性位
//!
//! `support` 是驱动侧的编译期策略，与设备提供了什么无关。

/// 特性表中的一项
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capability {
    pub name: &'static str,
    /// 在 32 位特性字中的位置
    pub bit: u32,
    pub support: bool,
    pub help: &'static str,
}

impl Capability {
    const fn new(name: &'static str, bit: u32, support: bool, help: &'static str) -> Self {
        Self {
            name,
            bit,
            support,
            help,
        }
    }

    pub const fn mask(&self) -> u32 {
        1 << self.bit
    }
}

pub const VIRTIO_BLK_F_SIZE_MAX: u32 = 1;
pub const VIRTIO_BLK_F_SEG_MAX: u32 = 2;
pub const VIRTIO_BLK_F_GEOMETRY: u32 = 4;
pub const VIRTIO_BLK_F_RO: u32 = 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
pub const VIRTIO_BLK_F_FLUSH: u32 = 9;
pub const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;
pub const VIRTIO_BLK_F_CONFIG_WCE: u32 = 11;
pub const VIRTIO_BLK_F_DISCARD: u32 = 13;
pub const VIRTIO_BLK_F_WRITE_ZEROES: u32 = 14;

pub const VIRTIO_F_INDIRECT_DESC: u32 = 28;
pub const VIRTIO_F_EVENT_IDX: u32 = 29;

#[rustfmt::skip]
pub const BLK_CAPS: &[Capability] = &[
    Capability::new("VIRTIO_BLK_F_SIZE_MAX", VIRTIO_BLK_F_SIZE_MAX, false,
        "Maximum size of any single segment is in size_max."),
    Capability::new("VIRTIO_BLK_F_SEG_MAX", VIRTIO_BLK_F_SEG_MAX, false,
        "Maximum number of segments in a request is in seg_max."),
    Capability::new("VIRTIO_BLK_F_GEOMETRY", VIRTIO_BLK_F_GEOMETRY, false,
        "Disk-style geometry specified in geometry."),
    Capability::new("VIRTIO_BLK_F_RO", VIRTIO_BLK_F_RO, true,
        "Device is read-only."),
    Capability::new("VIRTIO_BLK_F_BLK_SIZE", VIRTIO_BLK_F_BLK_SIZE, true,
        "Block size of disk is in blk_size."),
    Capability::new("VIRTIO_BLK_F_FLUSH", VIRTIO_BLK_F_FLUSH, false,
        "Cache flush command support."),
    Capability::new("VIRTIO_BLK_F_TOPOLOGY", VIRTIO_BLK_F_TOPOLOGY, false,
        "Device exports information on optimal I/O alignment."),
    Capability::new("VIRTIO_BLK_F_CONFIG_WCE", VIRTIO_BLK_F_CONFIG_WCE, false,
        "Device can toggle its cache between writeback and writethrough modes."),
    Capability::new("VIRTIO_BLK_F_DISCARD", VIRTIO_BLK_F_DISCARD, false,
        "Device can support discard command."),
    Capability::new("VIRTIO_BLK_F_WRITE_ZEROES", VIRTIO_BLK_F_WRITE_ZEROES, false,
        "Device can support write zeroes command."),
];

/// 与设备类型无关的特性
#[rustfmt::skip]
pub const TRANSPORT_CAPS: &[Capability] = &[
    Capability::new("VIRTIO_F_INDIRECT_DESC", VIRTIO_F_INDIRECT_DESC, false,
        "Driver can use descriptors with the VIRTQ_DESC_F_INDIRECT flag set."),
    Capability::new("VIRTIO_F_EVENT_IDX", VIRTIO_F_EVENT_IDX, false,
        "Enables the used_event and the avail_event fields."),
];

/// 同一张表中不能有重复的位，位也必须落在 32 位特性字内
pub const fn bits_unique(table: &[Capability]) -> bool {
    let mut i = 0;
    while i < table.len() {
        if table[i].bit >= u32::BITS {
            return false;
        }
        let mut j = i + 1;
        while j < table.len() {
            if table[i].bit == table[j].bit {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(bits_unique(BLK_CAPS));
const _: () = assert!(bits_unique(TRANSPORT_CAPS));

/// 在多张表中按位查找
pub fn lookup<'a>(tables: &[&'a [Capability]], bit: u32) -> Option<&'a Capability> {
    tables
        .iter()
        .flat_map(|table| table.iter())
        .find(|cap| cap.bit == bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_well_formed() {
        assert!(bits_unique(BLK_CAPS));
        assert!(bits_unique(TRANSPORT_CAPS));
        let dup = [
            Capability::new("A", 3, true, ""),
            Capability::new("B", 3, false, ""),
        ];
        assert!(!bits_unique(&dup));
        assert!(!bits_unique(&[Capability::new("C", 32, true, "")]));
    }

    #[test]
    fn supported_blk_bits() {
        let supported: u32 = BLK_CAPS
            .iter()
            .filter(|cap| cap.support)
            .map(Capability::mask)
            .fold(0, |acc, m| acc | m);
        assert_eq!(supported, (1 << 5) | (1 << 6));
        assert!(TRANSPORT_CAPS.iter().all(|cap| !cap.support));
    }

    #[test]
    fn lookup_searches_every_table() {
        let tables = [BLK_CAPS, TRANSPORT_CAPS];
        assert_eq!(lookup(&tables, 5).map(|c| c.name), Some("VIRTIO_BLK_F_RO"));
        assert_eq!(
            lookup(&tables, 29).map(|c| c.name),
            Some("VIRTIO_F_EVENT_IDX")
        );
        assert!(lookup(&tables, 20).is_none());
    }
}
