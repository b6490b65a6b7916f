//! 一次直接 I/O 的控制块
//!
//! 用户缓冲区按页钉住，放进一个有界的窗口；每页再按块切开，交给映射者得到设备块号，
//! 设备上连续的块并入当前批次。遇到不连续、批次已满或映射给出边界标记时，当前批次提交，
//! 随后开启新的批次。

use defines::{
    config::{DIO_PAGES, PAGE_SIZE, SECTOR_SIZE_BITS},
    error::{errno, Error, KResult},
};
use heapless::Deque;
use klocks::CompletionQueue;
use memory::{MemorySystem, PinnedPage, UserSpace, VirtPageNum};
use triomphe::Arc;

use crate::{
    batch::IoBatch, device::BlockDevice, mapping::BlockMapper, DioConfig, DioStats, DirectIo,
    Direction, IoSegment,
};

pub(crate) struct DioRequest<'a> {
    pub(crate) mm: &'a MemorySystem,
    space: &'a UserSpace,
    device: &'a dyn BlockDevice,
    mapper: &'a dyn BlockMapper,
    direction: Direction,
    pub(crate) config: DioConfig,
    blkbits: usize,

    /// 下一个要映射的文件块
    block_in_file: u64,
    /// 当前用户段结束处的文件块
    final_block_in_request: u64,
    /// 已经交给批次的字节数
    pub(crate) bytes_queued: usize,

    /// 当前页中第一个要处理的块
    first_block_in_page: usize,
    /// 下一个要钉住的用户页
    curr_vpn: VirtPageNum,
    /// 当前用户段中已经钉过的页数
    curr_page: usize,
    /// 当前用户段跨越的页数
    total_pages: usize,
    /// 已钉住但尚未处理的页
    pages: Deque<PinnedPage, DIO_PAGES>,
    /// 还没有完整交给批次的用户页数，新批次的片段数不超过它
    pages_in_io: usize,

    /// 正在组装的批次
    batch: Option<IoBatch>,
    last_block_in_batch: u64,
    /// 上一个块的映射要求在它之后断开批次
    boundary: bool,

    pub(crate) in_flight: usize,
    pub(crate) reap_counter: usize,
    pub(crate) completions: Arc<CompletionQueue<IoBatch>>,
    /// 请求中偏移最小的失败批次
    pub(crate) failed: Option<(usize, Error)>,
    pub(crate) stats: DioStats,
}

impl<'a> DioRequest<'a> {
    pub fn new(
        io: &DirectIo<'a>,
        mapper: &'a dyn BlockMapper,
        direction: Direction,
        blkbits: usize,
        offset: u64,
        pages_in_io: usize,
    ) -> Self {
        Self {
            mm: io.mm,
            space: io.space,
            device: io.device,
            mapper,
            direction,
            config: io.config,
            blkbits,
            block_in_file: offset >> blkbits,
            final_block_in_request: offset >> blkbits,
            bytes_queued: 0,
            first_block_in_page: 0,
            curr_vpn: VirtPageNum(0),
            curr_page: 0,
            total_pages: 0,
            pages: Deque::new(),
            pages_in_io,
            batch: None,
            last_block_in_batch: 0,
            boundary: false,
            in_flight: 0,
            reap_counter: 0,
            completions: Arc::new(CompletionQueue::new()),
            failed: None,
            stats: DioStats::default(),
        }
    }

    /// 把一段用户缓冲区切成块放进批次。出错时停止映射，但已经提交的批次不受影响
    pub fn run_segment(&mut self, segment: &IoSegment) -> KResult<()> {
        let addr = segment.addr;
        // 起始地址只要求按块对齐，第一页可能从页中间开始
        self.first_block_in_page = addr.page_offset() >> self.blkbits;
        self.final_block_in_request = self.block_in_file + (segment.len >> self.blkbits) as u64;
        self.curr_vpn = addr.vpn();
        self.curr_page = 0;
        self.total_pages = segment.nr_pages();

        let result = self.do_direct_io();
        self.release_unused_pages();
        result
    }

    fn do_direct_io(&mut self) -> KResult<()> {
        while self.block_in_file < self.final_block_in_request {
            let page = self.next_page()?;
            let queued = self.bytes_queued;
            let result = self.map_page(&page);
            // 片段各自持有页引用，窗口里的这一份可以放开了。没有块进入批次的页不算写过
            if self.bytes_queued > queued {
                self.mm.unpin_page(page);
            } else {
                self.mm.unpin_unused(page);
            }
            result?;
            self.first_block_in_page = 0;
            self.pages_in_io = self.pages_in_io.saturating_sub(1);
        }
        Ok(())
    }

    fn map_page(&mut self, page: &PinnedPage) -> KResult<()> {
        let blocks_per_page = PAGE_SIZE >> self.blkbits;
        let block_size = 1 << self.blkbits;
        for block_in_page in self.first_block_in_page..blocks_per_page {
            if self.block_in_file == self.final_block_in_request {
                break;
            }
            let mapping = self
                .mapper
                .get_block(self.block_in_file, self.direction.is_write())?;
            let Some(block) = mapping.block() else {
                warn!("direct I/O hit a hole at file block {}", self.block_in_file);
                return Err(errno::ENOTBLK);
            };
            if mapping.is_new() {
                self.device.invalidate_alias(block);
            }
            self.queue_block(page, block_in_page << self.blkbits, block);
            self.boundary = mapping.is_boundary();
            self.block_in_file += 1;
            self.bytes_queued += block_size;
        }
        Ok(())
    }

    /// 把设备块 `block` 放进批次，它的数据位于 `page` 的 `offset` 处
    fn queue_block(&mut self, page: &PinnedPage, offset: usize, block: u64) {
        let contiguous = self.last_block_in_batch.checked_add(1) == Some(block);
        if self.boundary || !contiguous {
            self.submit_batch();
        }
        let len = 1 << self.blkbits;
        loop {
            let mut batch = match self.batch.take() {
                Some(batch) => batch,
                None => self.new_batch(block),
            };
            if batch.try_add(self.mm, page, offset, len) {
                self.batch = Some(batch);
                break;
            }
            // 批次满了，新的批次一定放得下一个块
            self.submit(batch);
        }
        self.last_block_in_batch = block;
    }

    fn new_batch(&mut self, block: u64) -> IoBatch {
        self.reap_if_due();
        let max_fragments = self.pages_in_io.min(self.device.max_segments()).max(1);
        IoBatch::new(
            self.direction,
            block << (self.blkbits - SECTOR_SIZE_BITS),
            self.bytes_queued,
            max_fragments,
            self.device.max_transfer_bytes(),
            Arc::clone(&self.completions),
        )
    }

    fn submit(&mut self, batch: IoBatch) {
        self.in_flight += 1;
        self.stats.batches_submitted += 1;
        trace!(
            "submit batch: sector {}, {} bytes in {} fragments, {} in flight",
            batch.sector(),
            batch.size(),
            batch.fragments().len(),
            self.in_flight
        );
        self.device.submit(batch);
    }

    /// 提交正在组装的批次，如果有的话
    pub fn submit_batch(&mut self) {
        if let Some(batch) = self.batch.take() {
            self.submit(batch);
        }
    }

    fn next_page(&mut self) -> KResult<PinnedPage> {
        if self.pages.is_empty() {
            self.refill_pages()?;
        }
        self.pages.pop_front().ok_or(errno::EFAULT)
    }

    /// 一次钉住至多一个窗口的用户页
    fn refill_pages(&mut self) -> KResult<()> {
        let nr = (self.total_pages - self.curr_page).min(self.config.pin_window);
        // 从设备读就是写用户内存
        let writable = !self.direction.is_write();
        let pages = self
            .space
            .pin_pages(self.mm, self.curr_vpn.page_start(), nr, writable)?;
        self.curr_vpn = self.curr_vpn + nr;
        self.curr_page += nr;
        self.stats.pages_pinned += nr;
        for page in pages {
            if let Err(page) = self.pages.push_back(page) {
                error!("direct I/O page window overflow");
                self.mm.unpin_unused(page);
            }
        }
        Ok(())
    }

    fn release_unused_pages(&mut self) {
        while let Some(page) = self.pages.pop_front() {
            self.mm.unpin_unused(page);
        }
    }

    /// 传输成功的最长前缀。一个字节都没有成功时返回最先遇到的错误
    pub fn result(&self, first_error: Option<Error>) -> KResult<usize> {
        let transferred = match self.failed {
            Some((offset, _)) => offset.min(self.bytes_queued),
            None => self.bytes_queued,
        };
        if transferred > 0 {
            return Ok(transferred);
        }
        match first_error.or(self.failed.map(|(_, err)| err)) {
            Some(err) => Err(err),
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> DioStats {
        DioStats {
            bytes_queued: self.bytes_queued,
            ..self.stats
        }
    }
}
