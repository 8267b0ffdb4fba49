use alloc::{vec, vec::Vec};

use defines::error::{errno, Error, KResult};
use hal::BlockDevice;

/// 以字节流的方式读写块设备，内部维护一个读写位置
pub struct DiskDriver<D> {
    device: D,
    block_id: u64,
    block_offset: usize,
    block_buffer: Vec<u8>,
}

impl<D: BlockDevice> core::fmt::Write for DiskDriver<D> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        match self.write(s.as_bytes()) {
            Ok(n) if n == s.len() => Ok(()),
            _ => Err(core::fmt::Error),
        }
    }
}

impl<D: BlockDevice> DiskDriver<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            block_id: 0,
            block_offset: 0,
            block_buffer: vec![0; D::BLOCK_SIZE],
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// 设备的总字节数
    pub fn size(&self) -> u64 {
        self.device.num_blocks() * D::BLOCK_SIZE as u64
    }

    /// 当前读写位置
    pub fn position(&self) -> u64 {
        self.block_id * D::BLOCK_SIZE as u64 + self.block_offset as u64
    }

    fn advance(&mut self, len: usize) {
        self.block_offset += len;
        if self.block_offset == D::BLOCK_SIZE {
            self.block_offset = 0;
            self.block_id += 1;
        }
    }

    /// 从当前位置读，读到设备末尾为止，返回读到的字节数
    ///
    /// 中途某块出错时，已经读到的部分照常返回，错误留给下一次调用。
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let mut tot_nread = 0;
        while tot_nread < buf.len() && self.block_id < self.device.num_blocks() {
            let copy_len = usize::min(buf.len() - tot_nread, D::BLOCK_SIZE - self.block_offset);
            if let Err(e) = self.device.read_block(self.block_id, &mut self.block_buffer) {
                return partial(tot_nread, e);
            }
            buf[tot_nread..tot_nread + copy_len].copy_from_slice(
                &self.block_buffer[self.block_offset..self.block_offset + copy_len],
            );
            self.advance(copy_len);
            tot_nread += copy_len;
        }
        Ok(tot_nread)
    }

    /// 从当前位置写，写到设备末尾为止，返回写入的字节数
    ///
    /// 不满一块的部分先读出整块再写回。出错时的处理同 [`Self::read`]。
    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        let mut tot_write = 0;
        while tot_write < buf.len() && self.block_id < self.device.num_blocks() {
            let copy_len = usize::min(buf.len() - tot_write, D::BLOCK_SIZE - self.block_offset);
            let src = &buf[tot_write..tot_write + copy_len];
            if let Err(e) = self.write_part(src) {
                return partial(tot_write, e);
            }
            self.advance(copy_len);
            tot_write += copy_len;
        }
        Ok(tot_write)
    }

    /// 把 `src` 写到当前块的当前偏移处
    fn write_part(&mut self, src: &[u8]) -> KResult<()> {
        if src.len() == D::BLOCK_SIZE {
            return self.device.write_block(self.block_id, src);
        }
        self.device
            .read_block(self.block_id, &mut self.block_buffer)?;
        self.block_buffer[self.block_offset..self.block_offset + src.len()].copy_from_slice(src);
        self.device.write_block(self.block_id, &self.block_buffer)
    }

    /// 移动读写位置，允许越过末尾，但不能移到 0 之前
    pub fn seek(&mut self, pos: SeekFrom) -> KResult<u64> {
        let offset = match pos {
            SeekFrom::Start(from_start) => Some(from_start),
            SeekFrom::End(from_end) => self.size().checked_add_signed(from_end),
            SeekFrom::Current(from_current) => self.position().checked_add_signed(from_current),
        }
        .ok_or(errno::EINVAL)?;
        self.block_id = offset / D::BLOCK_SIZE as u64;
        self.block_offset = (offset % D::BLOCK_SIZE as u64) as usize;
        Ok(offset)
    }

    pub fn flush(&mut self) -> KResult<()> {
        self.device.flush()
    }
}

/// 已经传输了一部分时报告字节数，否则报告错误
fn partial(done: usize, e: Error) -> KResult<usize> {
    if done > 0 {
        Ok(done)
    } else {
        Err(e)
    }
}

/// Enumeration of possible methods to seek within an I/O object.
#[derive(Copy, PartialEq, Eq, Clone, Debug)]
pub enum SeekFrom {
    /// Sets the offset to the provided number of bytes.
    Start(u64),

    /// Sets the offset to the size of this object plus the specified number of
    /// bytes.
    ///
    /// It is possible to seek beyond the end of an object, but it's an error to
    /// seek before byte 0.
    End(i64),

    /// Sets the offset to the current position plus the specified number of
    /// bytes.
    ///
    /// It is possible to seek beyond the end of an object, but it's an error to
    /// seek before byte 0.
    Current(i64),
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use super::*;
    use crate::SyncVirtioBlk;
    use memory::fake::FakeMemory;
    use virtio_mmio::{
        fake::{FakeDevice, FakeIrq},
        probe, BlkConfig, VirtioBlk,
    };

    /// 内存中的盘，记录每次块操作
    struct RamDisk {
        blocks: Vec<[u8; 8]>,
        ops: Vec<(char, u64)>,
        bad: Option<u64>,
    }

    impl RamDisk {
        fn new(n: usize) -> Self {
            Self {
                blocks: vec![[0; 8]; n],
                ops: Vec::new(),
                bad: None,
            }
        }

        fn check(&mut self, op: char, block_id: u64) -> KResult<()> {
            self.ops.push((op, block_id));
            if self.bad == Some(block_id) {
                return Err(errno::EIO);
            }
            Ok(())
        }
    }

    impl BlockDevice for RamDisk {
        const BLOCK_SIZE: usize = 8;

        fn read_block(&mut self, block_id: u64, buf: &mut [u8]) -> KResult<()> {
            self.check('r', block_id)?;
            let block = self.blocks.get(block_id as usize).ok_or(errno::ERANGE)?;
            buf.copy_from_slice(block);
            Ok(())
        }

        fn write_block(&mut self, block_id: u64, buf: &[u8]) -> KResult<()> {
            self.check('w', block_id)?;
            let block = self
                .blocks
                .get_mut(block_id as usize)
                .ok_or(errno::ERANGE)?;
            block.copy_from_slice(buf);
            Ok(())
        }

        fn num_blocks(&self) -> u64 {
            self.blocks.len() as u64
        }
    }

    #[test]
    fn unaligned_write_reads_modify_writes() {
        let mut disk = DiskDriver::new(RamDisk::new(4));
        disk.seek(SeekFrom::Start(6)).unwrap();
        assert_eq!(disk.write(b"abcdefghijkl").unwrap(), 12);
        assert_eq!(disk.position(), 18);
        assert_eq!(
            disk.device().ops,
            [('r', 0), ('w', 0), ('w', 1), ('r', 2), ('w', 2)]
        );
        assert_eq!(&disk.device().blocks[0][6..], b"ab");
        assert_eq!(&disk.device().blocks[1], b"cdefghij");
        assert_eq!(&disk.device().blocks[2][..2], b"kl");

        disk.seek(SeekFrom::Current(-12)).unwrap();
        let mut back = [0u8; 12];
        assert_eq!(disk.read(&mut back).unwrap(), 12);
        assert_eq!(&back, b"abcdefghijkl");
    }

    #[test]
    fn stops_at_end_of_device() {
        let mut disk = DiskDriver::new(RamDisk::new(2));
        assert_eq!(disk.size(), 16);
        assert_eq!(disk.seek(SeekFrom::End(-4)).unwrap(), 12);
        assert_eq!(disk.write(b"0123456789").unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(disk.read(&mut buf).unwrap(), 0);
        assert_eq!(disk.seek(SeekFrom::Current(-17)), Err(errno::EINVAL));
        assert!(write!(disk, "x").is_err());
    }

    #[test]
    fn failed_block_keeps_bytes_already_moved() {
        let mut ram = RamDisk::new(4);
        ram.blocks[0] = *b"01234567";
        ram.bad = Some(1);
        let mut disk = DiskDriver::new(ram);

        disk.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(disk.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"4567");
        assert_eq!(disk.position(), 8);
        assert_eq!(disk.read(&mut buf), Err(errno::EIO));
        assert_eq!(disk.position(), 8);

        disk.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(disk.write(b"abcdefghijkl").unwrap(), 4);
        assert_eq!(&disk.device().blocks[0], b"0123abcd");
        assert_eq!(disk.write(b"efgh"), Err(errno::EIO));
        assert_eq!(disk.position(), 8);
    }

    #[test]
    fn formats_onto_virtio_disk() {
        let mem = FakeMemory::new();
        let dev = FakeDevice::block(mem.clone(), 8);
        let transport = probe(dev.clone()).unwrap();
        let blk = VirtioBlk::init(
            transport,
            mem.clone(),
            &FakeIrq::default(),
            1,
            BlkConfig::default(),
        )
        .unwrap();
        let mut disk = DiskDriver::new(SyncVirtioBlk::new(blk).unwrap());
        disk.seek(SeekFrom::Start(510)).unwrap();
        write!(disk, "sector {}", 1).unwrap();
        disk.flush().unwrap();

        let first = dev.disk_sector(0).unwrap();
        let second = dev.disk_sector(1).unwrap();
        assert_eq!(&first[510..], b"se");
        assert_eq!(&second[..6], b"ctor 1");

        disk.seek(SeekFrom::Start(510)).unwrap();
        let mut back = [0u8; 8];
        assert_eq!(disk.read(&mut back).unwrap(), 8);
        assert_eq!(&back, b"sector 1");
    }
}
