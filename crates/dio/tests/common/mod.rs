#![allow(dead_code)]

use std::{
    cell::Cell,
    collections::BTreeMap,
    future::Future,
    sync::Mutex,
    thread,
    time::Duration,
};

use defines::error::{Error, KResult};
use dio::{BlockDevice, IoBatch};
use memory::{
    AnonFaultHandler, MapPermission, MemoryConfig, MemoryLayout, MemorySystem, NoReclaim,
    PhysPageNum, UserSpace, VirtAddr, VirtPageNum, ZoneType,
};

/// 用户缓冲区所在区域的起始地址
pub const BUF: usize = 0x10_0000;
pub const BUF_PAGES: usize = 64;

/// 设备以什么顺序完成批次
#[derive(Clone, Copy, Debug)]
pub enum Completion {
    /// 在 `submit` 里直接完成
    Immediate,
    /// 发起者开始等待后按提交顺序完成
    InOrder,
    Reverse,
    Shuffled(u64),
    /// 每个批次由一个新线程稍后完成，模拟中断
    Thread,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub sector: u64,
    pub size: usize,
    pub request_offset: usize,
    pub fragments: Vec<(PhysPageNum, usize, usize)>,
}

pub struct MockDevice {
    block_size: usize,
    max_segments: usize,
    max_transfer: usize,
    mode: Completion,
    /// 第 n 个提交的批次以对应的错误完成
    failures: BTreeMap<usize, Error>,
    submitted: Mutex<Vec<Submission>>,
    pending: Mutex<Vec<(usize, IoBatch)>>,
    invalidated: Mutex<Vec<u64>>,
}

impl MockDevice {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            max_segments: 128,
            max_transfer: 128 * 1024,
            mode: Completion::Immediate,
            failures: BTreeMap::new(),
            submitted: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
        }
    }

    pub fn segments(mut self, max_segments: usize) -> Self {
        self.max_segments = max_segments;
        self
    }

    pub fn max_transfer(mut self, bytes: usize) -> Self {
        self.max_transfer = bytes;
        self
    }

    pub fn completion(mut self, mode: Completion) -> Self {
        self.mode = mode;
        self
    }

    pub fn fail(mut self, nth: usize, err: Error) -> Self {
        self.failures.insert(nth, err);
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn invalidated(&self) -> Vec<u64> {
        self.invalidated.lock().unwrap().clone()
    }

    fn status_of(&self, nth: usize) -> KResult<()> {
        self.failures.get(&nth).map_or(Ok(()), |&err| Err(err))
    }

    /// 完成所有积压的批次，返回完成的个数
    pub fn flush(&self) -> usize {
        let mut pending = std::mem::take(&mut *self.pending.lock().unwrap());
        match self.mode {
            Completion::Reverse => pending.reverse(),
            Completion::Shuffled(seed) => fastrand::Rng::with_seed(seed).shuffle(&mut pending),
            _ => {}
        }
        let count = pending.len();
        for (nth, batch) in pending {
            batch.complete(self.status_of(nth));
        }
        count
    }
}

impl BlockDevice for MockDevice {
    fn logical_block_size(&self) -> usize {
        self.block_size
    }

    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn max_transfer_bytes(&self) -> usize {
        self.max_transfer
    }

    fn submit(&self, batch: IoBatch) {
        let nth = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(Submission {
                sector: batch.sector(),
                size: batch.size(),
                request_offset: batch.request_offset(),
                fragments: batch
                    .fragments()
                    .iter()
                    .map(|fragment| (fragment.pfn(), fragment.offset(), fragment.len()))
                    .collect(),
            });
            submitted.len() - 1
        };
        let status = self.status_of(nth);
        match self.mode {
            Completion::Immediate => batch.complete(status),
            Completion::Thread => {
                let delay = Duration::from_micros(fastrand::Rng::with_seed(nth as u64).u64(..500));
                thread::spawn(move || {
                    thread::sleep(delay);
                    batch.complete(status);
                });
            }
            _ => self.pending.lock().unwrap().push((nth, batch)),
        }
    }

    fn invalidate_alias(&self, block: u64) {
        self.invalidated.lock().unwrap().push(block);
    }
}

/// 驱动一次直接 I/O，同时在它等待时让设备完成积压的批次
pub fn run<T>(device: &MockDevice, io: impl Future<Output = T>) -> T {
    let finished = Cell::new(false);
    smol::block_on(async {
        let io = async {
            let out = io.await;
            finished.set(true);
            out
        };
        let completer = async {
            while !finished.get() {
                device.flush();
                smol::future::yield_now().await;
            }
        };
        smol::future::zip(io, completer).await.0
    })
}

pub struct Env {
    pub mm: MemorySystem,
    pub space: UserSpace,
}

impl Env {
    pub fn new(perm: MapPermission) -> Self {
        kernel_tracer::init_std();
        let config = MemoryConfig {
            min_free_kbytes: 0,
            ..MemoryConfig::default()
        };
        let mm = MemorySystem::boot(
            MemoryLayout::flat(ZoneType::Normal, PhysPageNum(0x8_0000), 1024),
            config,
            Box::new(NoReclaim),
        )
        .unwrap();
        let space = UserSpace::new(7, Box::new(AnonFaultHandler::default()));
        space
            .map_area(VirtAddr(BUF), BUF_PAGES * 4096, perm)
            .unwrap();
        Self { mm, space }
    }

    pub fn rw() -> Self {
        Self::new(MapPermission::R | MapPermission::W | MapPermission::U)
    }

    /// 预先调入整个缓冲区，返回每页的物理页号
    pub fn prefault(&self) -> Vec<PhysPageNum> {
        let pages = self
            .space
            .pin_pages(&self.mm, VirtAddr(BUF), BUF_PAGES, false)
            .unwrap();
        let pfns = pages.iter().map(|page| page.pfn()).collect();
        for page in pages {
            self.mm.unpin_unused(page);
        }
        pfns
    }

    pub fn pfn(&self, page: usize) -> PhysPageNum {
        self.space
            .translate(VirtAddr(BUF).vpn() + page)
            .unwrap()
    }

    pub fn counts(&self) -> Vec<usize> {
        (0..BUF_PAGES)
            .map(|page| {
                self.space
                    .translate(VirtPageNum(BUF / 4096 + page))
                    .map_or(0, |pfn| self.mm.page_count(pfn))
            })
            .collect()
    }

    /// 所有钉住的页都已放开，每页只剩地址空间持有的那一个引用
    pub fn assert_released(&self) {
        assert_eq!(self.mm.pin_stats().outstanding(), 0);
        assert!(self.counts().iter().all(|&count| count <= 1));
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.space.release(&self.mm);
    }
}
