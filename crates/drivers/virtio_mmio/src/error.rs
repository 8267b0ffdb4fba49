use core::fmt;

use defines::error::{errno, Error};

/// virtio 驱动的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// `MagicValue` 不是 "virt"
    BadMagic { found: u32 },
    /// 只支持 virtio-mmio 第 2 版
    BadVersion { found: u32 },
    /// `DeviceID` 为 0，槽位上没有设备
    EmptySlot,
    UnsupportedDevice { device_id: u32 },
    /// 设备清除了 `FEATURES_OK`
    FeaturesRejected { requested: u32 },
    /// 队列长度必须是不超过 32768 的 2 的幂
    InvalidQueueLen { len: u16 },
    /// 队列布局放不进一页
    QueueTooLarge { len: u16, size: usize },
    /// 设备上没有这个队列，队列太短，或者队列已经在用
    QueueUnavailable,
    NoMemory,
    /// 空闲描述符不够组成一条请求链
    QueueFull,
    /// 设备还没有进入 `DRIVER_OK`
    NotReady,
    /// 缓冲区长度不对或者不是物理连续的
    BadBuffer,
    OutOfRange { sector: u64, capacity: u64 },
    ReadOnly,
    /// 暂存缓冲区正在被设备使用
    Busy,
    /// 设备归还了一个不在途的请求
    UnknownRequest,
}

impl VirtioError {
    /// 返回 `true` 表示该设备已不可用；探测时的跳过和单个请求的失败都不算
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FeaturesRejected { .. }
                | Self::InvalidQueueLen { .. }
                | Self::QueueTooLarge { .. }
                | Self::QueueUnavailable
                | Self::NoMemory
                | Self::UnknownRequest
        )
    }
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => write!(f, "bad magic value {found:#x}"),
            Self::BadVersion { found } => write!(f, "unsupported transport version {found}"),
            Self::EmptySlot => f.write_str("empty slot"),
            Self::UnsupportedDevice { device_id } => {
                write!(f, "unsupported device id {device_id}")
            }
            Self::FeaturesRejected { requested } => {
                write!(f, "device rejected features {requested:#x}")
            }
            Self::InvalidQueueLen { len } => write!(f, "invalid queue length {len}"),
            Self::QueueTooLarge { len, size } => {
                write!(f, "queue of length {len} needs {size} bytes, more than a page")
            }
            Self::QueueUnavailable => f.write_str("queue unavailable"),
            Self::NoMemory => f.write_str("out of device-visible memory"),
            Self::QueueFull => f.write_str("no free descriptors"),
            Self::NotReady => f.write_str("device not ready"),
            Self::BadBuffer => f.write_str("bad data buffer"),
            Self::OutOfRange { sector, capacity } => {
                write!(f, "sector {sector} out of range (capacity {capacity})")
            }
            Self::ReadOnly => f.write_str("device is read-only"),
            Self::Busy => f.write_str("scratch buffer busy"),
            Self::UnknownRequest => f.write_str("device completed an unknown request"),
        }
    }
}

impl From<VirtioError> for Error {
    fn from(e: VirtioError) -> Self {
        match e {
            VirtioError::BadMagic { .. } | VirtioError::BadVersion { .. } => errno::ENXIO,
            VirtioError::EmptySlot | VirtioError::UnsupportedDevice { .. } => errno::ENODEV,
            VirtioError::FeaturesRejected { .. } | VirtioError::UnknownRequest => errno::EIO,
            VirtioError::InvalidQueueLen { .. } | VirtioError::QueueUnavailable => errno::EINVAL,
            VirtioError::QueueTooLarge { .. } | VirtioError::NoMemory => errno::ENOMEM,
            VirtioError::QueueFull => errno::EAGAIN,
            VirtioError::NotReady | VirtioError::Busy => errno::EBUSY,
            VirtioError::BadBuffer => errno::EFAULT,
            VirtioError::OutOfRange { .. } => errno::ERANGE,
            VirtioError::ReadOnly => errno::EPERM,
        }
    }
}
