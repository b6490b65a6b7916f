//! 物理页帧的元数据
//!
//! 所有页帧放在一个按 pfn 索引的数组里，伙伴、所属 zone 等都由下标计算得出。
//! 页帧的引用计数是原子的，可以不持 zone 锁增减；只有计数归零时才会进入 zone 的空闲链表。

use alloc::vec::Vec;
use core::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
};

use bitflags::bitflags;
use klocks::SpinMutex;

use crate::{
    address::PhysPageNum,
    layout::MemoryLayout,
    zone::{ZoneId, ZoneType},
};

bitflags! {
    /// 页帧标志位，对应 Linux 的 `page->flags`
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const LOCKED     = 1 << 0;
        const ERROR      = 1 << 1;
        const REFERENCED = 1 << 2;
        const UPTODATE   = 1 << 3;
        const DIRTY      = 1 << 4;
        const LRU        = 1 << 5;
        const ACTIVE     = 1 << 6;
        /// 启动时保留的页（内核镜像、空洞等），永远不进入空闲链表
        const RESERVED   = 1 << 7;
        const HIGHMEM    = 1 << 8;
        const PRIVATE    = 1 << 9;
        const WRITEBACK  = 1 << 10;
    }
}

impl PageFlags {
    /// 页被释放时保留的标志位，其余的都要清掉
    const STICKY: Self = Self::RESERVED.union(Self::HIGHMEM);
}

/// 页帧当前缓存的是哪个对象的第几页。只用于标识，不持有所有权
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageMapping {
    pub owner: usize,
    pub index: usize,
}

const NO_NODE: u8 = u8::MAX;

pub struct PageFrame {
    pfn: PhysPageNum,
    count: AtomicU32,
    flags: AtomicU32,
    /// 作为一段分配出去的连续页的首页时，该段的阶
    order: AtomicU8,
    node: u8,
    zone: u8,
    mapping: SpinMutex<Option<PageMapping>>,
}

impl PageFrame {
    fn hole(pfn: PhysPageNum) -> Self {
        Self {
            pfn,
            count: AtomicU32::new(0),
            flags: AtomicU32::new(PageFlags::RESERVED.bits()),
            order: AtomicU8::new(0),
            node: NO_NODE,
            zone: 0,
            mapping: SpinMutex::new(None),
        }
    }

    pub fn pfn(&self) -> PhysPageNum {
        self.pfn
    }

    /// 引用计数，为 0 说明页是空闲的（或在 per-cpu 缓存中）
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn test_flags(&self, flags: PageFlags) -> bool {
        self.flags().contains(flags)
    }

    /// 置位并返回之前是否已经全部置位
    pub fn test_and_set_flags(&self, flags: PageFlags) -> bool {
        let old = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        PageFlags::from_bits_retain(old).contains(flags)
    }

    /// 清除并返回之前是否已经全部置位
    pub fn test_and_clear_flags(&self, flags: PageFlags) -> bool {
        let old = self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        PageFlags::from_bits_retain(old).contains(flags)
    }

    pub fn is_reserved(&self) -> bool {
        self.test_flags(PageFlags::RESERVED)
    }

    pub fn is_highmem(&self) -> bool {
        self.test_flags(PageFlags::HIGHMEM)
    }

    pub fn is_dirty(&self) -> bool {
        self.test_flags(PageFlags::DIRTY)
    }

    pub fn mapping(&self) -> Option<PageMapping> {
        *self.mapping.lock()
    }

    pub fn set_mapping(&self, mapping: Option<PageMapping>) {
        *self.mapping.lock() = mapping;
    }

    /// 所在的 zone，空洞中的页帧没有 zone
    pub fn zone_id(&self) -> Option<ZoneId> {
        if self.node == NO_NODE {
            return None;
        }
        Some(ZoneId {
            node: self.node as usize,
            kind: ZoneType::from_index(self.zone as usize)?,
        })
    }

    pub fn order(&self) -> usize {
        self.order.load(Ordering::Acquire) as usize
    }

    /// 计数非零时加一。空闲页不能被直接引用
    pub(crate) fn try_get(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count != 0).then_some(count + 1)
            })
            .is_ok()
    }

    /// 已经持有一个引用时再加一个
    pub(crate) fn get(&self) {
        let old = self.count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old > 0, "get on free page {}", self.pfn);
    }

    /// 减一，返回是否降到了 0
    pub(crate) fn put_testzero(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "put on free page {}", self.pfn);
        old == 1
    }

    /// 刚从伙伴系统中取出，成为一段连续页的首页
    pub(crate) fn prep_new(&self, order: usize) {
        debug_assert_eq!(self.count(), 0, "allocating busy page {}", self.pfn);
        self.flags.fetch_and(PageFlags::STICKY.bits(), Ordering::AcqRel);
        *self.mapping.lock() = None;
        self.order.store(order as u8, Ordering::Release);
        self.count.store(1, Ordering::Release);
    }

    /// 即将回到空闲链表，清理掉使用期间留下的状态
    pub(crate) fn prep_free(&self) {
        self.flags.fetch_and(PageFlags::STICKY.bits(), Ordering::AcqRel);
        *self.mapping.lock() = None;
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("pfn", &self.pfn)
            .field("count", &self.count())
            .field("flags", &self.flags())
            .field("order", &self.order())
            .field("zone", &self.zone_id())
            .finish()
    }
}

/// 所有页帧的元数据，覆盖从最低到最高的 pfn，空洞中的页帧标记为保留
pub struct FrameTable {
    base: PhysPageNum,
    frames: Vec<PageFrame>,
}

impl FrameTable {
    pub fn new(layout: &MemoryLayout) -> Self {
        let spans = || layout.nodes.iter().flat_map(|node| node.zones.iter());
        let base = spans().map(|span| span.start_pfn).min().unwrap_or_default();
        let end = spans()
            .map(|span| span.start_pfn + span.pages)
            .max()
            .unwrap_or_default();

        let mut frames: Vec<PageFrame> = (base.0..end.0)
            .map(|pfn| PageFrame::hole(PhysPageNum(pfn)))
            .collect();
        for node in &layout.nodes {
            for span in &node.zones {
                let mut flags = PageFlags::empty();
                if span.kind == ZoneType::HighMem {
                    flags |= PageFlags::HIGHMEM;
                }
                for frame in &mut frames[span.start_pfn - base..span.start_pfn - base + span.pages]
                {
                    frame.node = node.id as u8;
                    frame.zone = span.kind as u8;
                    let reserved = span
                        .reserved
                        .iter()
                        .any(|range| range.contains(&frame.pfn));
                    let flags = if reserved {
                        flags | PageFlags::RESERVED
                    } else {
                        flags
                    };
                    *frame.flags.get_mut() = flags.bits();
                }
            }
        }
        Self { base, frames }
    }

    pub fn page(&self, pfn: PhysPageNum) -> Option<&PageFrame> {
        pfn.0
            .checked_sub(self.base.0)
            .and_then(|index| self.frames.get(index))
    }

    pub fn pfn_range(&self) -> Range<PhysPageNum> {
        self.base..self.base + self.frames.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageFrame> {
        self.frames.iter()
    }
}

/// 对一个页帧的计数引用。必须用 `MemorySystem::put_page` 归还
#[must_use = "page references must be returned with `put_page`"]
#[derive(Debug, PartialEq, Eq)]
pub struct PageRef {
    pfn: PhysPageNum,
}

impl PageRef {
    /// 调用者需要已经为这个引用增加了计数
    pub(crate) fn new(pfn: PhysPageNum) -> Self {
        Self { pfn }
    }

    pub fn pfn(&self) -> PhysPageNum {
        self.pfn
    }
}

/// 一段 `2^order` 页的物理连续页，首页的计数为 1
#[must_use = "allocated pages must be returned with `free_pages`"]
#[derive(Debug, PartialEq, Eq)]
pub struct PageRun {
    pfn: PhysPageNum,
    order: u8,
}

impl PageRun {
    pub(crate) fn new(pfn: PhysPageNum, order: usize) -> Self {
        Self {
            pfn,
            order: order as u8,
        }
    }

    pub fn pfn(&self) -> PhysPageNum {
        self.pfn
    }

    pub fn order(&self) -> usize {
        self.order as usize
    }

    pub fn nr_pages(&self) -> usize {
        1 << self.order
    }

    pub fn pfns(&self) -> Range<PhysPageNum> {
        self.pfn..self.pfn + self.nr_pages()
    }

    /// 把首页的那个计数当作普通的页引用交出去，之后最后一次 `put_page` 会释放整段
    pub fn into_ref(self) -> PageRef {
        PageRef::new(self.pfn)
    }
}
