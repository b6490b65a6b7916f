//! zone：一段具有相同寻址能力的物理内存
//!
//! 每个 zone 有一把关中断的自旋锁保护伙伴系统空闲链表，另有每个 CPU 一份的冷热页缓存。
//! 加锁顺序总是先 per-cpu 缓存再 zone 锁。

use alloc::vec::Vec;
use core::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use defines::config::MAX_ORDER;
use klocks::SpinNoIrqMutex;

use crate::{
    address::PhysPageNum,
    buddy::FreeArea,
    layout::ZoneSpan,
    pcp::{PerCpuPageset, PerCpuPages},
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZoneType {
    /// 可供老式设备 DMA 的低端内存
    Dma = 0,
    Normal = 1,
    /// 内核无法直接映射的高端内存
    HighMem = 2,
}

impl ZoneType {
    pub const ALL: [ZoneType; 3] = [ZoneType::Dma, ZoneType::Normal, ZoneType::HighMem];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ZoneType::Dma => "DMA",
            ZoneType::Normal => "Normal",
            ZoneType::HighMem => "HighMem",
        }
    }
}

/// 全局唯一地标识一个 zone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ZoneId {
    pub node: usize,
    pub kind: ZoneType,
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}/{}", self.node, self.kind.name())
    }
}

bitflags! {
    /// 分配请求的标志，对应 Linux 的 gfp 标志
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// 只从 DMA zone 分配
        const DMA        = 1 << 0;
        /// 可以使用高端内存
        const HIGHMEM    = 1 << 1;
        /// 紧急分配，可以用掉一半的 min 水位
        const HIGH       = 1 << 2;
        /// 不触发回收
        const NO_RECLAIM = 1 << 3;
        /// 页马上要交给设备，不在乎缓存热度
        const COLD       = 1 << 4;
        /// 失败时不打印警告
        const NOWARN     = 1 << 5;
    }
}

impl AllocFlags {
    /// 分配的目标 zone 类型
    pub fn zone_type(self) -> ZoneType {
        if self.contains(AllocFlags::DMA) {
            ZoneType::Dma
        } else if self.contains(AllocFlags::HIGHMEM) {
            ZoneType::HighMem
        } else {
            ZoneType::Normal
        }
    }
}

/// 三条水位线，单位为页
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn from_min(min: usize) -> Self {
        Self {
            min,
            low: min + min / 4,
            high: min + min / 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneStat {
    /// 分配出去的页数
    PgAlloc,
    /// 释放回来的页数
    PgFree,
    /// 不需要补充就由 per-cpu 缓存满足的单页分配
    PcpHit,
    /// per-cpu 缓存从伙伴系统批量补充的次数
    PcpRefill,
    /// 以该 zone 为首选却最终失败的分配
    AllocFail,
}

const NR_ZONE_STATS: usize = 5;

pub struct Zone {
    id: ZoneId,
    start_pfn: PhysPageNum,
    spanned_pages: usize,
    present_pages: usize,
    watermarks: Watermarks,
    free_area: SpinNoIrqMutex<FreeArea>,
    /// 伙伴系统中的空闲页数，只在持 zone 锁时修改
    free_pages: AtomicUsize,
    /// 节点下线后置位，此后伙伴系统不再交出任何页。只在持 zone 锁时读写
    sealed: AtomicBool,
    pageset: Vec<SpinNoIrqMutex<PerCpuPageset>>,
    stats: [AtomicUsize; NR_ZONE_STATS],
}

impl Zone {
    pub(crate) fn new(
        node: usize,
        span: &ZoneSpan,
        watermarks: Watermarks,
        nr_cpus: usize,
        batch: usize,
    ) -> Self {
        let mut free_area = FreeArea::new(span.pages);
        let start = span.start_pfn.0;
        let mut reserved: Vec<Range<usize>> = span
            .reserved
            .iter()
            .map(|r| r.start.0 - start..r.end.0 - start)
            .collect();
        reserved.sort_unstable_by_key(|r| r.start);
        let mut cursor = 0;
        for r in reserved.iter().chain(core::iter::once(&(span.pages..span.pages))) {
            if r.start > cursor {
                free_area.add_range(cursor, r.start);
            }
            cursor = cursor.max(r.end);
        }

        Self {
            id: ZoneId {
                node,
                kind: span.kind,
            },
            start_pfn: span.start_pfn,
            spanned_pages: span.pages,
            present_pages: span.present_pages(),
            watermarks,
            free_pages: AtomicUsize::new(free_area.nr_free_pages()),
            free_area: SpinNoIrqMutex::new(free_area),
            sealed: AtomicBool::new(false),
            pageset: (0..nr_cpus)
                .map(|_| SpinNoIrqMutex::new(PerCpuPageset::new(batch)))
                .collect(),
            stats: Default::default(),
        }
    }

    pub fn id(&self) -> ZoneId {
        self.id
    }

    pub fn kind(&self) -> ZoneType {
        self.id.kind
    }

    pub fn node(&self) -> usize {
        self.id.node
    }

    pub fn start_pfn(&self) -> PhysPageNum {
        self.start_pfn
    }

    pub fn spanned_pages(&self) -> usize {
        self.spanned_pages
    }

    pub fn present_pages(&self) -> usize {
        self.present_pages
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    pub fn is_highmem(&self) -> bool {
        self.id.kind == ZoneType::HighMem
    }

    /// zone 中是否有可用的页
    pub fn populated(&self) -> bool {
        self.present_pages > 0
    }

    pub fn contains(&self, pfn: PhysPageNum) -> bool {
        (self.start_pfn..self.start_pfn + self.spanned_pages).contains(&pfn)
    }

    /// 伙伴系统中的空闲页数，不含 per-cpu 缓存中的页
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    /// 各 CPU 缓存中的页数
    pub fn pcp_pages(&self) -> usize {
        self.pageset.iter().map(|pcp| pcp.lock().count()).sum()
    }

    pub fn stat(&self, item: ZoneStat) -> usize {
        self.stats[item as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn count_fail(&self) {
        self.count(ZoneStat::AllocFail, 1);
    }

    fn count(&self, item: ZoneStat, n: usize) {
        self.stats[item as usize].fetch_add(n, Ordering::Relaxed);
    }

    fn pfn_of(&self, idx: usize) -> PhysPageNum {
        self.start_pfn + idx
    }

    fn idx_of(&self, pfn: PhysPageNum) -> usize {
        debug_assert!(self.contains(pfn));
        pfn - self.start_pfn
    }

    /// 分配 `2^order` 页后，剩下的空闲页是否仍高于水位 `mark`。
    ///
    /// 比请求阶小的空闲块对这次分配没有帮助，逐阶扣除，同时水位减半
    pub fn watermark_ok(&self, order: usize, mark: usize, flags: AllocFlags) -> bool {
        let mut min = mark as isize;
        if flags.contains(AllocFlags::HIGH) {
            min -= min / 2;
        }
        let area = self.free_area.lock();
        let mut free = area.nr_free_pages() as isize - (1 << order) + 1;
        if free <= min {
            return false;
        }
        for o in 0..order {
            free -= (area.nr_free(o) << o) as isize;
            min >>= 1;
            if free <= min {
                return false;
            }
        }
        true
    }

    /// 从该 zone 取出 `2^order` 页。单页走 per-cpu 缓存
    pub(crate) fn rmqueue(&self, order: usize, flags: AllocFlags, cpu: usize) -> Option<PhysPageNum> {
        let pfn = if order == 0 {
            let mut pageset = self.pageset[cpu].lock();
            let pcp = pageset.list(flags.contains(AllocFlags::COLD));
            if pcp.needs_refill() {
                let got = self.rmqueue_bulk(pcp);
                if got > 0 {
                    self.count(ZoneStat::PcpRefill, 1);
                }
                trace!("{} cpu{cpu} pcp refilled {got} pages", self.id);
            } else {
                self.count(ZoneStat::PcpHit, 1);
            }
            pcp.list.pop().map(|idx| self.pfn_of(idx))
        } else {
            let mut area = self.free_area.lock();
            if self.sealed.load(Ordering::Relaxed) {
                return None;
            }
            let idx = area.alloc(order);
            self.free_pages.store(area.nr_free_pages(), Ordering::Release);
            idx.map(|idx| self.pfn_of(idx))
        };
        if pfn.is_some() {
            self.count(ZoneStat::PgAlloc, 1 << order);
        }
        pfn
    }

    fn rmqueue_bulk(&self, pcp: &mut PerCpuPages) -> usize {
        let mut area = self.free_area.lock();
        if self.sealed.load(Ordering::Relaxed) {
            return 0;
        }
        let mut got = 0;
        while got < pcp.batch {
            let Some(idx) = area.alloc(0) else {
                break;
            };
            pcp.list.push(idx);
            got += 1;
        }
        self.free_pages.store(area.nr_free_pages(), Ordering::Release);
        got
    }

    /// 把 `2^order` 页还给该 zone。单页进入 per-cpu 缓存
    pub(crate) fn free(&self, pfn: PhysPageNum, order: usize, cold: bool, cpu: usize) {
        let idx = self.idx_of(pfn);
        self.count(ZoneStat::PgFree, 1 << order);
        if order == 0 {
            let mut pageset = self.pageset[cpu].lock();
            let pcp = pageset.list(cold);
            if pcp.needs_drain() {
                let mut area = self.free_area.lock();
                for idx in pcp.take_batch() {
                    area.free(idx, 0);
                }
                self.free_pages.store(area.nr_free_pages(), Ordering::Release);
                trace!("{} cpu{cpu} pcp drained a batch", self.id);
            }
            pcp.list.push(idx);
        } else {
            let mut area = self.free_area.lock();
            area.free(idx, order);
            self.free_pages.store(area.nr_free_pages(), Ordering::Release);
        }
    }

    /// 把某个 CPU 缓存的页全部还给伙伴系统
    pub(crate) fn drain_pages(&self, cpu: usize) -> usize {
        let Some(pageset) = self.pageset.get(cpu) else {
            return 0;
        };
        let mut guard = pageset.lock();
        let pageset = &mut *guard;
        let mut area = self.free_area.lock();
        let mut drained = 0;
        for pcp in [&mut pageset.hot, &mut pageset.cold] {
            for idx in pcp.list.drain(..) {
                area.free(idx, 0);
                drained += 1;
            }
        }
        self.free_pages.store(area.nr_free_pages(), Ordering::Release);
        drained
    }

    /// 排空所有 CPU 的缓存后，若整个 zone 都空闲就封住它，之后的分配都会落空。
    ///
    /// 检查与封住在同一把 zone 锁下完成，不会有分配夹在两者之间
    pub(crate) fn seal(&self) -> bool {
        for cpu in 0..self.pageset.len() {
            self.drain_pages(cpu);
        }
        let area = self.free_area.lock();
        if area.nr_free_pages() != self.present_pages {
            return false;
        }
        self.sealed.store(true, Ordering::Relaxed);
        true
    }

    pub(crate) fn unseal(&self) {
        let _area = self.free_area.lock();
        self.sealed.store(false, Ordering::Relaxed);
    }

    pub fn free_area_report(&self) -> FreeAreaReport {
        let area = self.free_area.lock();
        FreeAreaReport {
            zone: self.id,
            nr_free: core::array::from_fn(|order| area.nr_free(order)),
        }
    }

    /// 每一阶上空闲块首页的 pfn，升序
    pub fn buddy_snapshot(&self) -> [Vec<PhysPageNum>; MAX_ORDER] {
        let snapshot = self.free_area.lock().snapshot();
        snapshot.map(|blocks| blocks.into_iter().map(|idx| self.pfn_of(idx)).collect())
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("start_pfn", &self.start_pfn)
            .field("present_pages", &self.present_pages)
            .field("free_pages", &self.free_pages())
            .field("watermarks", &self.watermarks)
            .finish()
    }
}

/// 一个 zone 每一阶上的空闲块数，格式同 `/proc/buddyinfo`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeAreaReport {
    pub zone: ZoneId,
    pub nr_free: [usize; MAX_ORDER],
}

impl FreeAreaReport {
    pub fn free_pages(&self) -> usize {
        self.nr_free
            .iter()
            .enumerate()
            .map(|(order, n)| n << order)
            .sum()
    }
}

impl fmt::Display for FreeAreaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {}, zone {:>8}", self.zone.node, self.zone.kind.name())?;
        for n in self.nr_free {
            write!(f, " {n:>6}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use defines::config::MAX_ORDER;

    use super::{AllocFlags, Watermarks, Zone, ZoneStat, ZoneType};
    use crate::{address::PhysPageNum, layout::ZoneSpan};

    fn zone(pages: usize, min: usize, batch: usize) -> Zone {
        let span = ZoneSpan::new(ZoneType::Normal, PhysPageNum(0x1000), pages);
        Zone::new(0, &span, Watermarks::from_min(min), 2, batch)
    }

    #[test]
    fn reserved_pages_are_not_free() {
        let span = ZoneSpan::new(ZoneType::Dma, PhysPageNum(0), 64)
            .reserve(PhysPageNum(0)..PhysPageNum(4))
            .reserve(PhysPageNum(60)..PhysPageNum(64));
        let zone = Zone::new(0, &span, Watermarks::default(), 1, 1);
        assert_eq!(zone.present_pages(), 56);
        assert_eq!(zone.free_pages(), 56);
        let snapshot = zone.buddy_snapshot();
        assert_eq!(snapshot[2], [PhysPageNum(4), PhysPageNum(56)]);
        assert_eq!(snapshot[3], [PhysPageNum(8), PhysPageNum(48)]);
        assert_eq!(snapshot[4], [PhysPageNum(16), PhysPageNum(32)]);
        assert!(snapshot[5].is_empty());
    }

    #[test]
    fn watermark_discounts_small_blocks() {
        let zone = zone(64, 8, 1);
        assert!(zone.watermark_ok(0, 8, AllocFlags::empty()));
        assert!(zone.watermark_ok(5, 8, AllocFlags::empty()));
        assert!(!zone.watermark_ok(0, 64, AllocFlags::empty()));
        // HIGH 可以用掉一半水位
        assert!(!zone.watermark_ok(0, 100, AllocFlags::empty()));
        assert!(zone.watermark_ok(0, 100, AllocFlags::HIGH));

        // 只剩下单页时，多页请求不会通过
        let mut taken = Vec::new();
        while let Some(pfn) = zone.rmqueue(1, AllocFlags::empty(), 0) {
            taken.push(pfn);
        }
        assert_eq!(taken.len(), 32);
        assert_eq!(zone.free_pages(), 0);
        for pfn in taken {
            zone.free(pfn + 1, 0, false, 0);
        }
        zone.drain_pages(0);
        assert_eq!(zone.free_pages(), 32);
        assert!(zone.watermark_ok(0, 0, AllocFlags::empty()));
        assert!(!zone.watermark_ok(1, 0, AllocFlags::empty()));
    }

    #[test]
    fn pcp_refills_and_drains_in_batches() {
        let zone = zone(256, 0, 4);
        let first = zone.rmqueue(0, AllocFlags::empty(), 0).unwrap();
        // 热链表的 low 为 8，一次只补充 batch = 4 页
        assert_eq!(zone.stat(ZoneStat::PcpRefill), 1);
        assert_eq!(zone.pcp_pages(), 3);
        assert_eq!(zone.free_pages(), 252);

        zone.free(first, 0, false, 0);
        assert_eq!(zone.pcp_pages(), 4);
        let mut pages = Vec::new();
        for _ in 0..24 {
            pages.push(zone.rmqueue(0, AllocFlags::empty(), 1).unwrap());
        }
        for pfn in pages {
            zone.free(pfn, 0, false, 1);
        }
        // 分配结束时 cpu1 缓存了 8 页；high 为 24，达到后先还一批再放入
        assert_eq!(zone.pcp_pages(), 4 + 24);

        assert_eq!(zone.drain_pages(0) + zone.drain_pages(1), 28);
        assert_eq!(zone.free_pages(), 256);
        assert_eq!(zone.buddy_snapshot()[8], [PhysPageNum(0x1000)]);
    }

    #[test]
    fn sealed_zone_hands_out_nothing() {
        let zone = zone(64, 0, 2);
        let run = zone.rmqueue(2, AllocFlags::empty(), 0).unwrap();
        assert!(!zone.seal());
        zone.free(run, 2, false, 0);

        // 缓存里的页会被排空，但仍被占用的页让封住失败
        let page = zone.rmqueue(0, AllocFlags::empty(), 1).unwrap();
        assert!(!zone.seal());
        zone.free(page, 0, false, 1);
        assert!(zone.seal());
        assert_eq!(zone.pcp_pages(), 0);
        assert_eq!(zone.free_pages(), 64);

        assert_eq!(zone.rmqueue(0, AllocFlags::empty(), 0), None);
        assert_eq!(zone.rmqueue(0, AllocFlags::COLD, 1), None);
        assert_eq!(zone.rmqueue(3, AllocFlags::empty(), 0), None);
        assert_eq!(zone.free_pages(), 64);

        zone.unseal();
        assert!(zone.rmqueue(3, AllocFlags::empty(), 0).is_some());
    }

    #[test]
    fn cold_pages_use_their_own_list() {
        let zone = zone(64, 0, 2);
        let pfn = zone.rmqueue(0, AllocFlags::COLD, 0).unwrap();
        zone.free(pfn, 0, true, 0);
        assert_eq!(zone.pcp_pages(), 2);
        assert_eq!(zone.rmqueue(0, AllocFlags::COLD, 0), Some(pfn));
    }

    #[test]
    fn report_counts_blocks_per_order() {
        let zone = zone(1024 + 3, 0, 1);
        let report = zone.free_area_report();
        assert_eq!(report.nr_free[MAX_ORDER - 1], 1);
        assert_eq!(report.nr_free[1], 1);
        assert_eq!(report.nr_free[0], 1);
        assert_eq!(report.free_pages(), 1027);
        let line = report.to_string();
        assert!(line.starts_with("Node 0, zone   Normal"));
        assert_eq!(line.split_whitespace().count(), 4 + MAX_ORDER);
    }
}
