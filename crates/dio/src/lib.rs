//! 直接 I/O：绕过页缓存，在用户缓冲区与块设备之间直接搬运数据
//!
//! 用户页先被钉住，再按块交给文件系统映射；设备上连续的块合并成 [`IoBatch`] 异步提交。
//! 设备完成批次后经由完成队列交还给发起者，发起者归还批次持有的页引用。
//! 发起者只在最后等待在途批次时睡眠，这一等待不可中断。

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate kernel_tracer;

mod batch;
mod device;
mod mapping;
mod reaper;
mod request;

pub use batch::{Fragment, IoBatch};
pub use device::BlockDevice;
pub use mapping::{BlockMapper, BlockMapping, MapFlags};

use defines::{
    config::{DIO_PAGES, DIO_REAP_INTERVAL, PAGE_SIZE, SECTOR_SIZE},
    error::{errno, KResult},
};
use kernel_tracer::Instrument;
use memory::{MemorySystem, UserSpace, VirtAddr};

use crate::request::DioRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 从设备读到用户内存
    Read,
    /// 从用户内存写到设备
    Write,
}

impl Direction {
    pub fn is_write(self) -> bool {
        self == Direction::Write
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DioConfig {
    /// 一次钉住的用户页数上限，不超过 [`DIO_PAGES`]
    pub pin_window: usize,
    /// 每开启这么多个新批次，顺手回收一次已完成的批次
    pub reap_interval: usize,
}

impl Default for DioConfig {
    fn default() -> Self {
        Self {
            pin_window: DIO_PAGES,
            reap_interval: DIO_REAP_INTERVAL,
        }
    }
}

impl DioConfig {
    pub fn validate(&self) -> KResult<()> {
        if !(1..=DIO_PAGES).contains(&self.pin_window) || self.reap_interval == 0 {
            return Err(errno::EINVAL);
        }
        Ok(())
    }
}

/// 一段用户缓冲区
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoSegment {
    pub addr: VirtAddr,
    pub len: usize,
}

impl IoSegment {
    pub fn new(addr: VirtAddr, len: usize) -> Self {
        Self { addr, len }
    }

    /// 跨越的用户页数
    pub fn nr_pages(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        self.addr.add(self.len).vpn_ceil() - self.addr.vpn()
    }
}

/// 一次直接 I/O 的计数，供观测与测试使用
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DioStats {
    pub batches_submitted: usize,
    pub batches_reaped: usize,
    pub pages_pinned: usize,
    /// 组装期间真正回收到批次的次数
    pub reap_passes: usize,
    pub bytes_queued: usize,
}

/// 直接 I/O 的入口，绑定了内存系统、发起者的地址空间与目标设备
pub struct DirectIo<'a> {
    mm: &'a MemorySystem,
    space: &'a UserSpace,
    device: &'a dyn BlockDevice,
    config: DioConfig,
}

impl<'a> DirectIo<'a> {
    pub fn new(mm: &'a MemorySystem, space: &'a UserSpace, device: &'a dyn BlockDevice) -> Self {
        Self {
            mm,
            space,
            device,
            config: DioConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DioConfig) -> Self {
        self.config = config;
        self
    }

    /// 在 `buf` 与文件偏移 `offset` 之间传输 `buf.len` 字节，返回传输成功的字节数。
    ///
    /// 地址、长度与偏移都必须按设备的逻辑块大小对齐，否则返回 `EINVAL`；
    /// 越过地址空间顶端的缓冲区返回 `EFAULT`。两种情况都没有任何副作用
    pub async fn direct_io(
        &self,
        direction: Direction,
        mapper: &dyn BlockMapper,
        buf: IoSegment,
        offset: u64,
    ) -> KResult<usize> {
        self.direct_io_vectored(direction, mapper, &[buf], offset).await
    }

    /// 多段用户缓冲区依次对应文件中连续的区域
    pub async fn direct_io_vectored(
        &self,
        direction: Direction,
        mapper: &dyn BlockMapper,
        segments: &[IoSegment],
        offset: u64,
    ) -> KResult<usize> {
        self.direct_io_with_stats(direction, mapper, segments, offset)
            .await
            .0
    }

    pub async fn direct_io_with_stats(
        &self,
        direction: Direction,
        mapper: &dyn BlockMapper,
        segments: &[IoSegment],
        offset: u64,
    ) -> (KResult<usize>, DioStats) {
        let blkbits = match self.check(segments, offset) {
            Ok(blkbits) => blkbits,
            Err(err) => {
                debug!("direct I/O rejected: {err:?}");
                return (Err(err), DioStats::default());
            }
        };
        let span = debug_span!(
            "direct_io",
            dir = direction.name(),
            offset = offset,
            segments = segments.len()
        );
        self.run(direction, mapper, segments, offset, blkbits)
            .instrument(span)
            .await
    }

    /// 检查对齐与地址范围，返回块大小的 bit 数
    fn check(&self, segments: &[IoSegment], offset: u64) -> KResult<usize> {
        self.config.validate()?;
        let block_size = self.device.logical_block_size();
        if !block_size.is_power_of_two()
            || !(SECTOR_SIZE..=PAGE_SIZE).contains(&block_size)
            || self.device.max_segments() == 0
            || self.device.max_transfer_bytes() < block_size
        {
            return Err(errno::EINVAL);
        }
        let mask = block_size - 1;
        if offset & mask as u64 != 0 {
            return Err(errno::EINVAL);
        }
        let mut total = 0usize;
        for segment in segments {
            if segment.addr.0 & mask != 0 || segment.len & mask != 0 {
                return Err(errno::EINVAL);
            }
            // 结束地址向上取整到页后仍不能越过地址空间顶端
            let end = segment.addr.0.checked_add(segment.len).ok_or(errno::EFAULT)?;
            if end > usize::MAX - (PAGE_SIZE - 1) {
                return Err(errno::EFAULT);
            }
            total = total.checked_add(segment.len).ok_or(errno::EFAULT)?;
        }
        if offset.checked_add(total as u64).is_none() {
            return Err(errno::EINVAL);
        }
        Ok(block_size.trailing_zeros() as usize)
    }

    async fn run(
        &self,
        direction: Direction,
        mapper: &dyn BlockMapper,
        segments: &[IoSegment],
        offset: u64,
        blkbits: usize,
    ) -> (KResult<usize>, DioStats) {
        let total: usize = segments.iter().map(|segment| segment.len).sum();
        let pages_in_io = segments.iter().map(IoSegment::nr_pages).sum();
        debug!("{} {total} bytes at offset {offset}", direction.name());

        let mut dio = DioRequest::new(self, mapper, direction, blkbits, offset, pages_in_io);
        let mut first_error = None;
        for segment in segments.iter().filter(|segment| segment.len > 0) {
            if let Err(err) = dio.run_segment(segment) {
                first_error = Some(err);
                break;
            }
        }
        dio.submit_batch();
        dio.await_completion().await;

        let result = dio.result(first_error);
        let stats = dio.stats();
        debug!(
            "direct I/O finished: {result:?}, {} batches, {} pages pinned",
            stats.batches_submitted, stats.pages_pinned
        );
        (result, stats)
    }
}
