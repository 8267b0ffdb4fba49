//! virtio-mmio 块设备驱动
//!
//! 启动时由 [`probe_slots`] 逐个探测槽位：确认魔数和版本，复位并握手，按 [`caps`] 中的表协商特性，
//! 建立并注册队列，最后置上 `DRIVER_OK`。请求以描述符链的形式提交，完成情况需要调用者轮询。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate kernel_tracer;

pub mod blk;
pub mod caps;
pub mod cmd;
mod error;
pub mod features;
pub mod queue;
pub mod regs;
mod registry;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use self::{
    blk::{BlkConfig, BlkStatus, Completion, Rejected, RequestToken, VirtioBlk, SECTOR_SIZE},
    error::VirtioError,
    registry::{probe_slots, qemu_slots, BlkRegistry},
    transport::{probe, DeviceClass, DeviceState, Transport},
};
