//! 驱动与内核其余部分之间的接口

#![cfg_attr(not(test), no_std)]

use defines::error::KResult;

/// 中断控制器。驱动只负责打开自己的中断线，中断的分发与处理不在驱动中
pub trait IrqController {
    fn enable(&self, line: usize);
}

impl<T: IrqController + ?Sized> IrqController for &T {
    fn enable(&self, line: usize) {
        (**self).enable(line);
    }
}

/// 以块为单位同步读写的存储设备
pub trait BlockDevice {
    const BLOCK_SIZE: usize;

    /// 读取第 `block_id` 块，`buf` 的长度必须恰好为一块
    fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> KResult<()>;
    /// 写入第 `block_id` 块，`buf` 的长度必须恰好为一块
    fn write_block(&mut self, block_id: u64, buf: &[u8]) -> KResult<()>;
    fn flush(&mut self) -> KResult<()> {
        Ok(())
    }
    fn num_blocks(&self) -> u64;
}
