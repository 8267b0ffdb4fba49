#![cfg_attr(not(test), no_std)]

use alloc::vec::Vec;

extern crate alloc;

/// 基于回收的分配器，即用 vector 收集释放的 id
///
/// 可以给定上限，用于管理数量固定的资源（如 virtqueue 的描述符）
#[derive(Clone, Debug)]
pub struct RecycleAllocator {
    current: usize,
    limit: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配，没有上限
    pub const fn new() -> Self {
        Self::bounded(usize::MAX)
    }

    /// 只分配 `[0, limit)` 范围内的 id
    pub const fn bounded(limit: usize) -> Self {
        RecycleAllocator {
            current: 0,
            limit,
            recycled: Vec::new(),
        }
    }

    /// 优先复用最近释放的 id，否则顺序分配新 id。耗尽时返回 `None`
    pub fn alloc(&mut self) -> Option<usize> {
        if let Some(id) = self.recycled.pop() {
            Some(id)
        } else if self.current < self.limit {
            self.current += 1;
            Some(self.current - 1)
        } else {
            None
        }
    }

    pub fn dealloc(&mut self, id: usize) {
        debug_assert!(id < self.current);
        debug_assert!(!self.recycled.contains(&id), "id {id} has been deallocated!");
        self.recycled.push(id);
    }

    /// 还能分配出去的 id 数量
    pub fn available(&self) -> usize {
        self.recycled.len() + (self.limit - self.current)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
