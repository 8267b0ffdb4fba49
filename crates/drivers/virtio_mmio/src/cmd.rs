//! 调试用的命令，输出到任意 `fmt::Write`

use core::fmt::{self, Write};

use defines::error::{errno, Error, KResult};
use memory::KernelMemory;

use crate::{
    blk::VirtioBlk,
    regs::{
        RegisterBus, DEVICE_ID, INTERRUPT_STATUS, MAGIC_VALUE, QUEUE_READY, QUEUE_SEL, VENDOR_ID,
    },
};

fn io(_: fmt::Error) -> Error {
    errno::EIO
}

/// 输出设备寄存器和队列索引
pub fn cmd_status<B, M>(dev: &VirtioBlk<B, M>, out: &mut impl Write) -> KResult<()>
where
    B: RegisterBus,
    M: KernelMemory,
{
    let mmio = dev.transport().mmio();
    mmio.write(QUEUE_SEL, u32::from(dev.queue_index()));
    let queue = dev.queue();
    let status = mmio.status();
    let dump = |out: &mut dyn Write| -> fmt::Result {
        writeln!(out, "status:           {:#04x} {status:?}", status.bits())?;
        writeln!(out, "device id:        {}", mmio.read(DEVICE_ID))?;
        writeln!(out, "vendor id:        {:#010x}", mmio.read(VENDOR_ID))?;
        writeln!(out, "interrupt status: {:#x}", mmio.read(INTERRUPT_STATUS))?;
        writeln!(out, "magic:            {:#010x}", mmio.read(MAGIC_VALUE))?;
        writeln!(
            out,
            "queue {}:          ready {}, len {}",
            dev.queue_index(),
            mmio.read(QUEUE_READY),
            queue.len()
        )?;
        writeln!(out, "avail.idx:        {}", queue.avail_idx())?;
        writeln!(out, "used.idx:         {}", queue.used_idx())
    };
    dump(out).map_err(io)
}

fn parse_sector(arg: &str) -> Option<u64> {
    match arg.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => arg.parse().ok(),
    }
}

/// `read SECTOR`：把一个扇区读进设备的暂存缓冲区，用 `poll` 查看结果
pub fn cmd_read<B, M>(dev: &mut VirtioBlk<B, M>, argv: &[&str], out: &mut impl Write) -> KResult<()>
where
    B: RegisterBus,
    M: KernelMemory,
{
    let sector = match argv {
        [_, arg] => parse_sector(arg),
        _ => None,
    };
    let Some(sector) = sector else {
        writeln!(out, "usage: read SECTOR").map_err(io)?;
        return Err(errno::EINVAL);
    };
    let token = dev.submit_scratch_read(sector)?;
    writeln!(out, "read sector {sector} submitted ({token:?})").map_err(io)
}

/// 收取所有已完成的请求，返回收取的个数
pub fn cmd_poll<B, M>(dev: &mut VirtioBlk<B, M>, out: &mut impl Write) -> KResult<usize>
where
    B: RegisterBus,
    M: KernelMemory,
{
    let mut count = 0;
    while let Some(done) = dev.poll_completion()? {
        count += 1;
        writeln!(out, "{:?}: {:?}, {} bytes", done.token, done.status, done.written)
            .map_err(io)?;
        let data = match &done.buffer {
            Some(buffer) => Some(buffer.as_slice()),
            None => dev.scratch(),
        };
        if let Some(data) = data {
            for byte in data.iter().take(16) {
                write!(out, "{byte:02x} ").map_err(io)?;
            }
            writeln!(out).map_err(io)?;
        }
    }
    Ok(count)
}
