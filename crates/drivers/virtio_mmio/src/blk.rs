use alloc::vec::Vec;
use core::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};
use defines::config::VIRTIO_BLK_QUEUE_LEN;
use hal::IrqController;
use memory::{DmaBuffer, DmaObject, DmaPool, KernelMemory, PhysAddr, VirtAddr};

use crate::{
    caps::{BLK_CAPS, TRANSPORT_CAPS, VIRTIO_BLK_F_BLK_SIZE, VIRTIO_BLK_F_RO},
    features::Negotiation,
    queue::{Segment, VirtQueue},
    regs::{RegisterBus, INTERRUPT_ACK, INTERRUPT_STATUS, QUEUE_NOTIFY},
    transport::{DeviceClass, DeviceState, Transport},
    VirtioError,
};

pub const SECTOR_SIZE: usize = 512;

/// 配置空间中 `capacity` 的偏移（以扇区计）
const CONFIG_CAPACITY: usize = 0x00;
/// 配置空间中 `blk_size` 的偏移
const CONFIG_BLK_SIZE: usize = 0x14;

/// 请求状态字节在设备写入之前的值
const STATUS_PENDING: u8 = 0xff;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    In = 0,
    Out = 1,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlkReqHeader {
    pub req_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

/// 请求头和状态字节放在同一个池对象里，但作为两个描述符交给设备
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct BlkReq {
    header: BlkReqHeader,
    status: u8,
    _pad: [u8; 7],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlkStatus {
    Ok,
    IoErr,
    Unsupported,
    /// 设备还没有写状态字节
    Pending,
    Other(u8),
}

impl From<u8> for BlkStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::IoErr,
            2 => Self::Unsupported,
            STATUS_PENDING => Self::Pending,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlkConfig {
    pub queue_len: u16,
    pub queue_index: u16,
}

impl Default for BlkConfig {
    fn default() -> Self {
        Self {
            queue_len: VIRTIO_BLK_QUEUE_LEN,
            queue_index: 0,
        }
    }
}

/// 标识一个已提交的请求
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

#[derive(Debug)]
pub struct Completion {
    pub token: RequestToken,
    pub status: BlkStatus,
    /// 设备报告写入的字节数，含状态字节
    pub written: u32,
    /// 提交时交出的缓冲区；暂存缓冲区的请求为 `None`，缓冲区直接回到设备手中
    pub buffer: Option<DmaBuffer>,
}

/// 提交失败，缓冲区原样奉还
#[derive(Debug)]
pub struct Rejected {
    pub error: VirtioError,
    pub buffer: DmaBuffer,
}

struct InFlight {
    token: RequestToken,
    req: DmaObject,
    buffer: Option<DmaBuffer>,
    scratch: bool,
}

/// virtio 块设备
pub struct VirtioBlk<B, M> {
    transport: Transport<B>,
    mem: M,
    queue: VirtQueue,
    queue_index: u16,
    irq_line: usize,
    capacity: u64,
    blk_size: Option<u32>,
    features: Negotiation,
    pool: Option<DmaPool>,
    in_flight: Vec<Option<InFlight>>,
    next_token: u64,
    scratch: Option<DmaBuffer>,
}

impl<B: RegisterBus, M: KernelMemory> VirtioBlk<B, M> {
    /// 初始化一台已探测到的块设备，完成后设备处于 `DRIVER_OK`
    ///
    /// 设备拒绝特性时不再改动 `Status`；之后的步骤失败则置上 `FAILED`。
    pub fn init<C: IrqController + ?Sized>(
        mut transport: Transport<B>,
        mem: M,
        irq: &C,
        irq_line: usize,
        cfg: BlkConfig,
    ) -> Result<Self, VirtioError> {
        if transport.class() != DeviceClass::Block {
            warn!("virtio: {} is not supported", transport.class().name());
            return Err(VirtioError::UnsupportedDevice {
                device_id: transport.class().id(),
            });
        }
        transport.handshake();
        let features = transport.negotiate(&[BLK_CAPS, TRANSPORT_CAPS])?;

        let mmio = transport.mmio();
        let capacity = mmio.config_read64(CONFIG_CAPACITY);
        let blk_size = features
            .has(VIRTIO_BLK_F_BLK_SIZE)
            .then(|| mmio.config_read32(CONFIG_BLK_SIZE));

        let setup = Self::setup_queue(&transport, &mem, cfg).and_then(|queue| {
            let scratch = DmaBuffer::alloc(&mem, SECTOR_SIZE).map_err(|e| {
                warn!("virtio-blk: failed to allocate scratch buffer: {e}");
                VirtioError::NoMemory
            })?;
            Ok((queue, scratch))
        });
        let (queue, scratch) = match setup {
            Ok(ok) => ok,
            Err(e) => {
                transport.fail();
                return Err(e);
            }
        };
        transport.set_state(DeviceState::QueueReady);
        irq.enable(irq_line);
        transport.driver_ok();
        info!(
            "virtio-blk: {capacity} sectors, queue {} of length {}, irq {irq_line}",
            cfg.queue_index,
            queue.len()
        );
        if let Some(size) = blk_size {
            info!("virtio-blk: block size {size}");
        }

        let in_flight = (0..queue.len()).map(|_| None).collect();
        Ok(Self {
            transport,
            mem,
            queue,
            queue_index: cfg.queue_index,
            irq_line,
            capacity,
            blk_size,
            features,
            pool: None,
            in_flight,
            next_token: 0,
            scratch: Some(scratch),
        })
    }

    fn setup_queue(
        transport: &Transport<B>,
        mem: &M,
        cfg: BlkConfig,
    ) -> Result<VirtQueue, VirtioError> {
        let max = VirtQueue::max_len(transport.mmio(), cfg.queue_index)?;
        let queue = VirtQueue::new(mem, cfg.queue_len.min(max))?;
        queue.register(transport.mmio(), cfg.queue_index)?;
        Ok(queue)
    }

    pub fn transport(&self) -> &Transport<B> {
        &self.transport
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn queue(&self) -> &VirtQueue {
        &self.queue
    }

    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    pub fn irq_line(&self) -> usize {
        self.irq_line
    }

    /// 以扇区计的容量
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn blk_size(&self) -> Option<u32> {
        self.blk_size
    }

    pub fn features(&self) -> &Negotiation {
        &self.features
    }

    pub fn read_only(&self) -> bool {
        self.features.has(VIRTIO_BLK_F_RO)
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// 暂存缓冲区的内容，正在被设备使用时为 `None`
    pub fn scratch(&self) -> Option<&[u8]> {
        self.scratch.as_ref().map(DmaBuffer::as_slice)
    }

    /// 提交一个读请求，设备把第 `sector` 扇区写进 `buffer`，不等待完成
    pub fn submit_read(
        &mut self,
        sector: u64,
        buffer: DmaBuffer,
    ) -> Result<RequestToken, Rejected> {
        self.submit(RequestType::In, sector, buffer, false)
    }

    /// 提交一个写请求，把 `buffer` 写到第 `sector` 扇区，不等待完成
    pub fn submit_write(
        &mut self,
        sector: u64,
        buffer: DmaBuffer,
    ) -> Result<RequestToken, Rejected> {
        self.submit(RequestType::Out, sector, buffer, false)
    }

    /// 把第 `sector` 扇区读进驱动自带的暂存缓冲区
    pub fn submit_scratch_read(&mut self, sector: u64) -> Result<RequestToken, VirtioError> {
        let buffer = self.scratch.take().ok_or(VirtioError::Busy)?;
        self.submit(RequestType::In, sector, buffer, true)
            .map_err(|rejected| {
                self.scratch = Some(rejected.buffer);
                rejected.error
            })
    }

    fn submit(
        &mut self,
        ty: RequestType,
        sector: u64,
        buffer: DmaBuffer,
        scratch: bool,
    ) -> Result<RequestToken, Rejected> {
        let posted = self
            .check(ty, sector, buffer.va(), buffer.len())
            .and_then(|data| self.post(ty, sector, data, buffer.len()));
        match posted {
            Ok((head, token)) => {
                if let Some(Some(entry)) = self.in_flight.get_mut(head as usize) {
                    entry.buffer = Some(buffer);
                    entry.scratch = scratch;
                }
                Ok(token)
            }
            Err(error) => Err(Rejected { error, buffer }),
        }
    }

    /// 提交前的检查，返回数据缓冲区的物理地址
    fn check(
        &self,
        ty: RequestType,
        sector: u64,
        va: VirtAddr,
        len: usize,
    ) -> Result<PhysAddr, VirtioError> {
        if self.transport.state() != DeviceState::DriverOk {
            return Err(VirtioError::NotReady);
        }
        if ty == RequestType::Out && self.read_only() {
            return Err(VirtioError::ReadOnly);
        }
        if sector >= self.capacity {
            return Err(VirtioError::OutOfRange {
                sector,
                capacity: self.capacity,
            });
        }
        if len != SECTOR_SIZE {
            return Err(VirtioError::BadBuffer);
        }
        // 设备只看物理地址，整个扇区必须物理连续
        let pa = self.mem.translate(va).ok_or(VirtioError::BadBuffer)?;
        let last = self
            .mem
            .translate(va.add(len - 1))
            .ok_or(VirtioError::BadBuffer)?;
        if last.0 != pa.0 + len - 1 {
            return Err(VirtioError::BadBuffer);
        }
        if self.queue.free_descriptors() < 3 {
            return Err(VirtioError::QueueFull);
        }
        Ok(pa)
    }

    /// 组装 header / data / status 三个描述符的链，放进可用环并通知设备
    fn post(
        &mut self,
        ty: RequestType,
        sector: u64,
        data: PhysAddr,
        len: usize,
    ) -> Result<(u16, RequestToken), VirtioError> {
        if self.pool.is_none() {
            self.pool = DmaPool::new(size_of::<BlkReq>(), 8);
        }
        let pool = self.pool.as_mut().ok_or(VirtioError::NoMemory)?;
        let req = pool.alloc(&self.mem).map_err(|e| {
            warn!("virtio-blk: failed to allocate request: {e}");
            VirtioError::NoMemory
        })?;
        let content = BlkReq {
            header: BlkReqHeader {
                req_type: (ty as u32).to_le(),
                reserved: 0,
                sector: sector.to_le(),
            },
            status: STATUS_PENDING,
            _pad: [0; 7],
        };
        // SAFETY: 池对象至少有 size_of::<BlkReq>() 字节，按 8 字节对齐
        unsafe { req.va().as_mut_ptr::<BlkReq>().write_volatile(content) };

        let segments = [
            Segment {
                pa: req.pa(),
                len: size_of::<BlkReqHeader>() as u32,
                device_writes: false,
            },
            Segment {
                pa: data,
                len: len as u32,
                device_writes: ty == RequestType::In,
            },
            Segment {
                pa: req.pa() + offset_of!(BlkReq, status),
                len: 1,
                device_writes: true,
            },
        ];
        let head = match self.queue.add_chain(&segments) {
            Ok(head) => head,
            Err(e) => {
                pool.dealloc(req);
                return Err(e);
            }
        };
        let token = RequestToken(self.next_token);
        self.next_token += 1;
        self.in_flight[head as usize] = Some(InFlight {
            token,
            req,
            buffer: None,
            scratch: false,
        });
        self.queue.publish(head);
        self.transport
            .mmio()
            .write(QUEUE_NOTIFY, u32::from(self.queue_index));
        trace!("virtio-blk: {ty:?} sector {sector} posted at descriptor {head}");
        Ok((head, token))
    }

    /// 取出一个已完成的请求，没有则返回 `Ok(None)`
    pub fn poll_completion(&mut self) -> Result<Option<Completion>, VirtioError> {
        let mmio = self.transport.mmio();
        let isr = mmio.read(INTERRUPT_STATUS);
        if isr != 0 {
            mmio.write(INTERRUPT_ACK, isr);
        }
        let Some(used) = self.queue.pop_used()? else {
            return Ok(None);
        };
        let entry = self
            .in_flight
            .get_mut(used.head as usize)
            .and_then(Option::take)
            .ok_or(VirtioError::UnknownRequest)?;
        // SAFETY: 请求对象仍归驱动所有，设备已经写完
        let status = unsafe {
            entry
                .req
                .va()
                .add(offset_of!(BlkReq, status))
                .as_ptr::<u8>()
                .read_volatile()
        };
        if let Some(pool) = &mut self.pool {
            pool.dealloc(entry.req);
        }
        let buffer = if entry.scratch {
            self.scratch = entry.buffer;
            None
        } else {
            entry.buffer
        };
        Ok(Some(Completion {
            token: entry.token,
            status: BlkStatus::from(status),
            written: used.len,
            buffer,
        }))
    }
}
