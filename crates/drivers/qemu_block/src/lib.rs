#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate kernel_tracer;

mod disk_driver;
mod sync_blk;

pub use disk_driver::{DiskDriver, SeekFrom};
pub use hal::BlockDevice;
pub use sync_blk::SyncVirtioBlk;
