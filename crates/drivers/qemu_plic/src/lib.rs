//! QEMU virt 平台上的 PLIC
//!
//! 寄存器布局参考 RISC-V PLIC 规范，只实现了驱动用得到的部分。

#![cfg_attr(not(test), no_std)]

use defines::config::{HART_NUM, PA_TO_VA, QEMU_PLIC_ADDR};
use memory::VirtAddr;

const COUNT_SOURCE: usize = 1024;
const U32_BITS: usize = u32::BITS as usize;

const PRIORITY_BASE: usize = 0x0;
const ENABLE_BASE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const CONTEXT_BASE: usize = 0x20_0000;
const CONTEXT_STRIDE: usize = 0x1000;
const THRESHOLD: usize = 0x0;
const CLAIM_COMPLETE: usize = 0x4;

/// 每个核有 M 态和 S 态两个上下文
pub const CONTEXT_NUM: usize = HART_NUM * 2;

pub struct Plic {
    base: VirtAddr,
}

impl Plic {
    /// # Safety
    ///
    /// `base` 必须指向一段已映射的 PLIC 寄存器窗口，且在 `Plic` 存活期间有效
    pub const unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    /// 内核地址空间中的 QEMU PLIC
    ///
    /// # Safety
    ///
    /// PLIC 所在的 MMIO 区域必须已经映射到内核空间
    pub const unsafe fn qemu() -> Self {
        Self {
            base: VirtAddr(PA_TO_VA + QEMU_PLIC_ADDR),
        }
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        self.base.add(offset).as_mut_ptr()
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: 构造时保证了寄存器窗口有效
        unsafe { self.reg(offset).read_volatile() }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: 同上
        unsafe { self.reg(offset).write_volatile(value) }
    }

    fn enable_word(source: usize, context: usize) -> (usize, u32) {
        debug_assert!(source < COUNT_SOURCE);
        let offset = ENABLE_BASE + context * ENABLE_STRIDE + (source / U32_BITS) * 4;
        (offset, 1 << (source % U32_BITS))
    }

    /// 设置中断源优先级，0 表示永不触发
    pub fn set_priority(&self, source: usize, value: u32) {
        self.write(PRIORITY_BASE + source * 4, value);
    }

    pub fn priority(&self, source: usize) -> u32 {
        self.read(PRIORITY_BASE + source * 4)
    }

    pub fn enable(&self, source: usize, context: usize) {
        let (offset, bit) = Self::enable_word(source, context);
        self.write(offset, self.read(offset) | bit);
    }

    pub fn is_enabled(&self, source: usize, context: usize) -> bool {
        let (offset, bit) = Self::enable_word(source, context);
        self.read(offset) & bit != 0
    }

    pub fn set_threshold(&self, context: usize, value: u32) {
        self.write(CONTEXT_BASE + context * CONTEXT_STRIDE + THRESHOLD, value);
    }

    /// 在 `context` 中认领一个中断，返回中断源，0 表示没有待处理的中断
    pub fn claim(&self, context: usize) -> usize {
        self.read(CONTEXT_BASE + context * CONTEXT_STRIDE + CLAIM_COMPLETE) as usize
    }

    pub fn complete(&self, context: usize, source: usize) {
        self.write(
            CONTEXT_BASE + context * CONTEXT_STRIDE + CLAIM_COMPLETE,
            source as u32,
        );
    }
}

impl hal::IrqController for Plic {
    fn enable(&self, line: usize) {
        self.set_priority(line, 1);
        for context in 0..CONTEXT_NUM {
            self.enable(line, context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 足够覆盖所有上下文的 claim 寄存器
    const WINDOW: usize = CONTEXT_BASE + CONTEXT_NUM * CONTEXT_STRIDE;

    fn window() -> Vec<u32> {
        vec![0; WINDOW / 4]
    }

    fn plic(regs: &mut [u32]) -> Plic {
        unsafe { Plic::new(VirtAddr::from(regs.as_mut_ptr())) }
    }

    #[test]
    fn enable_sets_bits_per_context() {
        let mut regs = window();
        let plic = plic(&mut regs);
        plic.enable(33, 3);
        assert!(plic.is_enabled(33, 3));
        assert!(!plic.is_enabled(33, 2));
        assert!(!plic.is_enabled(32, 3));
        drop(plic);
        assert_eq!(regs[(ENABLE_BASE + 3 * ENABLE_STRIDE) / 4 + 1], 1 << 1);
    }

    #[test]
    fn irq_controller_arms_line_everywhere() {
        let mut regs = window();
        let plic = plic(&mut regs);
        hal::IrqController::enable(&plic, 1);
        assert_eq!(plic.priority(1), 1);
        assert!((0..CONTEXT_NUM).all(|ctx| plic.is_enabled(1, ctx)));
        assert!(!plic.is_enabled(2, 0));
    }

    #[test]
    fn claim_and_complete_share_a_register() {
        let mut regs = window();
        let plic = plic(&mut regs);
        plic.set_threshold(1, 0);
        plic.complete(1, 8);
        assert_eq!(plic.claim(1), 8);
        assert_eq!(plic.claim(0), 0);
    }
}
