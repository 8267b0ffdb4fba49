use defines::error::{errno, KResult};
use hal::BlockDevice;
use memory::{DmaBuffer, KernelMemory};
use virtio_mmio::{regs::RegisterBus, BlkStatus, Completion, RequestToken, VirtioBlk, SECTOR_SIZE};

/// 以同步方式使用 [`VirtioBlk`]：提交后忙等直到请求完成
///
/// 数据经过一个自带的扇区缓冲区中转，调用者的缓冲区不需要是设备可见的。
pub struct SyncVirtioBlk<B, M> {
    dev: VirtioBlk<B, M>,
    bounce: Option<DmaBuffer>,
}

impl<B: RegisterBus, M: KernelMemory> SyncVirtioBlk<B, M> {
    pub fn new(dev: VirtioBlk<B, M>) -> KResult<Self> {
        let bounce = DmaBuffer::alloc(dev.mem(), SECTOR_SIZE)?;
        Ok(Self {
            dev,
            bounce: Some(bounce),
        })
    }

    pub fn device(&self) -> &VirtioBlk<B, M> {
        &self.dev
    }

    pub fn into_inner(self) -> VirtioBlk<B, M> {
        self.dev
    }

    /// 忙等 `token` 完成。没有超时，请求一旦提交就认为设备一定会完成它
    ///
    /// 设备交回的无效已用项只记录并跳过，对 `token` 的等待不会因此中断。
    fn wait(&mut self, token: RequestToken) -> KResult<Completion> {
        loop {
            match self.dev.poll_completion() {
                Ok(Some(done)) if done.token == token => return Ok(done),
                Ok(Some(done)) => {
                    warn!("virtio-blk: dropping unexpected completion {:?}", done.token);
                }
                Ok(None) => core::hint::spin_loop(),
                Err(e) => warn!("virtio-blk: skipping bad used entry while waiting: {e}"),
            }
        }
    }

    /// 提交 `bounce` 并等待，完成后把缓冲区放回
    fn transfer(&mut self, block_id: u64, write: bool) -> KResult<()> {
        let bounce = self.bounce.take().ok_or(errno::EBUSY)?;
        let submitted = if write {
            self.dev.submit_write(block_id, bounce)
        } else {
            self.dev.submit_read(block_id, bounce)
        };
        let token = submitted.map_err(|rejected| {
            self.bounce = Some(rejected.buffer);
            rejected.error
        })?;
        let done = self.wait(token)?;
        self.bounce = done.buffer;
        match done.status {
            BlkStatus::Ok => Ok(()),
            status => {
                warn!("virtio-blk: block {block_id} failed with {status:?}");
                Err(errno::EIO)
            }
        }
    }
}

impl<B: RegisterBus, M: KernelMemory> BlockDevice for SyncVirtioBlk<B, M> {
    const BLOCK_SIZE: usize = SECTOR_SIZE;

    fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> KResult<()> {
        if buf.len() != Self::BLOCK_SIZE {
            return Err(errno::EINVAL);
        }
        self.transfer(block_id, false)?;
        let bounce = self.bounce.as_ref().ok_or(errno::EBUSY)?;
        buf.copy_from_slice(bounce.as_slice());
        Ok(())
    }

    fn write_block(&mut self, block_id: u64, buf: &[u8]) -> KResult<()> {
        if buf.len() != Self::BLOCK_SIZE {
            return Err(errno::EINVAL);
        }
        let bounce = self.bounce.as_mut().ok_or(errno::EBUSY)?;
        bounce.as_mut_slice().copy_from_slice(buf);
        self.transfer(block_id, true)
    }

    fn num_blocks(&self) -> u64 {
        self.dev.capacity()
    }
}
