//! 整个内存管理子系统的上下文对象
//!
//! 启动时按布局构造一次，之后以 `&MemorySystem` 传给所有分配、释放与钉页的入口。

use alloc::{boxed::Box, vec::Vec};

use defines::{
    config::MAX_ORDER,
    error::{errno, KResult},
};

use crate::{
    address::PhysPageNum,
    frame::{FrameTable, PageFlags, PageFrame, PageRef, PageRun},
    layout::{MemoryConfig, MemoryLayout},
    node::{NodeDirectory, NodeStat, Zonelist},
    pin::{PinCounters, PinStats},
    zone::{AllocFlags, FreeAreaReport, Watermarks, Zone, ZoneStat, ZoneType},
};

/// 回收策略。分配器在内存紧张时调用，自身不关心回收如何进行
pub trait Reclaimer: Send + Sync {
    /// 尝试在 `zone` 中腾出空闲页，返回是否有进展
    fn try_reclaim(&self, mm: &MemorySystem, zone: &Zone) -> bool;
}

/// 什么也回收不了
pub struct NoReclaim;

impl Reclaimer for NoReclaim {
    fn try_reclaim(&self, _mm: &MemorySystem, _zone: &Zone) -> bool {
        false
    }
}

/// 类似 `/proc/meminfo` 的汇总，单位为页
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: usize,
    pub free: usize,
    pub free_highmem: usize,
    pub free_lowmem: usize,
    /// 躺在 per-cpu 缓存里的页，不计入 `free`
    pub pcp_cached: usize,
}

pub struct MemorySystem {
    frames: FrameTable,
    directory: NodeDirectory,
    reclaimer: Box<dyn Reclaimer>,
    config: MemoryConfig,
    pub(crate) pins: PinCounters,
}

impl MemorySystem {
    pub fn boot(
        layout: MemoryLayout,
        config: MemoryConfig,
        reclaimer: Box<dyn Reclaimer>,
    ) -> KResult<Self> {
        layout.validate()?;
        config.validate()?;
        let frames = FrameTable::new(&layout);
        let directory = NodeDirectory::new(&layout, &config);
        let mm = Self {
            frames,
            directory,
            reclaimer,
            config,
            pins: PinCounters::default(),
        };
        info!(
            "memory online: {} nodes, {} present pages, {} free",
            mm.directory.nodes().count(),
            mm.meminfo().total,
            mm.nr_free_pages()
        );
        Ok(mm)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn page(&self, pfn: PhysPageNum) -> Option<&PageFrame> {
        self.frames.page(pfn)
    }

    pub fn page_zone(&self, pfn: PhysPageNum) -> Option<&Zone> {
        self.directory.zone(self.page(pfn)?.zone_id()?)
    }

    fn current_cpu(&self) -> usize {
        (self.config.cpu_id)() % self.config.nr_cpus
    }

    /// 当前 CPU 所在的节点
    pub fn numa_node_id(&self) -> usize {
        (self.config.cpu_node)(self.current_cpu())
    }

    /// 沿 zonelist 分配 `2^order` 页。
    ///
    /// 先按 low 水位尝试一遍；不行就让回收器在每个 zone 上试一次，把 per-cpu 缓存还给伙伴系统，
    /// 再按 min 水位尝试一遍。本函数从不阻塞，也不会无限重试
    pub fn alloc_pages(
        &self,
        zonelist: &Zonelist,
        order: usize,
        flags: AllocFlags,
    ) -> KResult<PageRun> {
        if order >= MAX_ORDER {
            return Err(errno::EINVAL);
        }
        let cpu = self.current_cpu();
        if let Some(run) = self.get_page_from_zonelist(zonelist, order, flags, cpu, |w| w.low) {
            return Ok(run);
        }

        if !flags.contains(AllocFlags::NO_RECLAIM) {
            for &id in zonelist.zones() {
                let Some(zone) = self.directory.zone(id) else {
                    continue;
                };
                if self.reclaimer.try_reclaim(self, zone) {
                    debug!("reclaim made progress in {id}");
                }
            }
        }
        self.drain_all_pages();

        if let Some(run) = self.get_page_from_zonelist(zonelist, order, flags, cpu, |w| w.min) {
            return Ok(run);
        }

        if let Some(zone) = zonelist.preferred().and_then(|id| self.directory.zone(id)) {
            zone.count_fail();
        }
        if !flags.contains(AllocFlags::NOWARN) {
            warn!(
                "page allocation failure: order {order}, flags {flags:?}, {} pages free",
                self.nr_free_pages()
            );
        }
        Err(errno::ENOMEM)
    }

    fn get_page_from_zonelist(
        &self,
        zonelist: &Zonelist,
        order: usize,
        flags: AllocFlags,
        cpu: usize,
        mark: impl Fn(Watermarks) -> usize,
    ) -> Option<PageRun> {
        for &id in zonelist.zones() {
            let Some(zone) = self.directory.zone(id) else {
                continue;
            };
            if !zone.watermark_ok(order, mark(zone.watermarks()), flags) {
                continue;
            }
            let Some(pfn) = zone.rmqueue(order, flags, cpu) else {
                continue;
            };
            self.zone_statistics(zonelist, zone);
            if let Some(frame) = self.frames.page(pfn) {
                frame.prep_new(order);
            }
            return Some(PageRun::new(pfn, order));
        }
        None
    }

    fn zone_statistics(&self, zonelist: &Zonelist, zone: &Zone) {
        let count = |id: usize, item: NodeStat| {
            if let Some(node) = self.directory.node(id) {
                node.count(item);
            }
        };
        let preferred = zonelist.preferred().map_or(zone.node(), |id| id.node);
        if zone.node() == preferred {
            count(zone.node(), NodeStat::NumaHit);
        } else {
            count(zone.node(), NodeStat::NumaMiss);
            count(preferred, NodeStat::NumaForeign);
        }
        if zone.node() == self.numa_node_id() {
            count(zone.node(), NodeStat::LocalNode);
        } else {
            count(zone.node(), NodeStat::OtherNode);
        }
    }

    /// 在指定节点的 zonelist 上分配
    pub fn alloc_pages_node(&self, node: usize, order: usize, flags: AllocFlags) -> KResult<PageRun> {
        let zonelist = self.directory.zonelist(node, flags)?;
        self.alloc_pages(&zonelist, order, flags)
    }

    /// 在当前 CPU 所在节点上分配
    pub fn alloc_pages_current(&self, order: usize, flags: AllocFlags) -> KResult<PageRun> {
        self.alloc_pages_node(self.numa_node_id(), order, flags)
    }

    pub fn alloc_page(&self, flags: AllocFlags) -> KResult<PageRun> {
        self.alloc_pages_current(0, flags)
    }

    /// 归还一段分配得到的页。如果还有别人持有首页的引用，等最后一个引用释放时才真正回到空闲链表
    pub fn free_pages(&self, run: PageRun) {
        self.put_page(run.into_ref());
    }

    /// 同 [`MemorySystem::free_pages`]，但单页进入冷链表
    pub fn free_cold_page(&self, run: PageRun) {
        self.release(run.pfn(), true);
    }

    /// 对一个正在使用的页增加引用。空闲页与保留页不能被引用
    pub fn get_page(&self, pfn: PhysPageNum) -> KResult<PageRef> {
        let frame = self.page(pfn).ok_or(errno::EFAULT)?;
        if frame.is_reserved() || !frame.try_get() {
            return Err(errno::EINVAL);
        }
        Ok(PageRef::new(pfn))
    }

    /// 已经持有一个引用时再复制一个
    pub fn dup_page(&self, page: &PageRef) -> PageRef {
        if let Some(frame) = self.page(page.pfn()) {
            frame.get();
        }
        PageRef::new(page.pfn())
    }

    pub fn put_page(&self, page: PageRef) {
        self.release(page.pfn(), false);
    }

    fn release(&self, pfn: PhysPageNum, cold: bool) {
        let Some(frame) = self.page(pfn) else {
            return;
        };
        if !frame.put_testzero() {
            return;
        }
        let order = frame.order();
        frame.prep_free();
        match frame.zone_id().and_then(|id| self.directory.zone(id)) {
            Some(zone) => zone.free(pfn, order, cold, self.current_cpu()),
            None => error!("freeing page {pfn} outside of any zone"),
        }
    }

    pub fn page_count(&self, pfn: PhysPageNum) -> usize {
        self.page(pfn).map_or(0, PageFrame::count)
    }

    /// 标记页为脏，返回之前是否是干净的
    pub fn set_page_dirty(&self, pfn: PhysPageNum) -> bool {
        self.page(pfn)
            .is_some_and(|frame| !frame.test_and_set_flags(PageFlags::DIRTY))
    }

    /// 把某个 CPU 的缓存页全部还给伙伴系统
    pub fn drain_cpu_pages(&self, cpu: usize) -> usize {
        self.all_zones().map(|zone| zone.drain_pages(cpu)).sum()
    }

    pub fn drain_all_pages(&self) -> usize {
        let drained: usize = (0..self.config.nr_cpus)
            .map(|cpu| self.drain_cpu_pages(cpu))
            .sum();
        if drained > 0 {
            trace!("drained {drained} pages from per-cpu lists");
        }
        drained
    }

    /// 包括下线节点在内的所有 zone
    fn all_zones(&self) -> impl Iterator<Item = &Zone> {
        self.directory.all_nodes().flat_map(|node| node.zones())
    }

    pub fn nr_free_pages(&self) -> usize {
        self.directory.zones().map(Zone::free_pages).sum()
    }

    /// 可以用作缓冲区的空闲页，即不在高端内存中的空闲页
    pub fn nr_free_buffer_pages(&self) -> usize {
        self.directory
            .zones()
            .filter(|zone| zone.kind() <= ZoneType::Normal)
            .map(Zone::free_pages)
            .sum()
    }

    pub fn nr_free_highpages(&self) -> usize {
        self.directory
            .zones()
            .filter(|zone| zone.is_highmem())
            .map(Zone::free_pages)
            .sum()
    }

    pub fn meminfo(&self) -> MemInfo {
        let free = self.nr_free_pages();
        let free_highmem = self.nr_free_highpages();
        MemInfo {
            total: self.directory.zones().map(Zone::present_pages).sum(),
            free,
            free_highmem,
            free_lowmem: free - free_highmem,
            pcp_cached: self.directory.zones().map(Zone::pcp_pages).sum(),
        }
    }

    pub fn free_area_report(&self) -> Vec<FreeAreaReport> {
        self.directory
            .zones()
            .map(Zone::free_area_report)
            .collect()
    }

    pub fn online_node(&self, id: usize) -> KResult<()> {
        self.directory.online_node(id)
    }

    pub fn offline_node(&self, id: usize) -> KResult<()> {
        self.directory.offline_node(id)
    }

    pub fn pin_stats(&self) -> PinStats {
        self.pins.stats()
    }

    /// 某个 zone 的统计量之和，供测试与报告使用
    pub fn zone_stat(&self, item: ZoneStat) -> usize {
        self.directory.zones().map(|zone| zone.stat(item)).sum()
    }
}
