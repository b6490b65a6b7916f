//! 进程用户地址空间的最小模型：若干 VM 区域和已驻留的页
//!
//! 不驻留的页由 [`FaultHandler`] 按需调入，驻留页持有一个页引用，直到区域被解除映射。

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::ops::Range;

use bitflags::bitflags;
use defines::error::{errno, KResult};
use klocks::SpinMutex;

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    frame::{PageFlags, PageMapping, PageRef},
    system::MemorySystem,
    zone::AllocFlags,
};

bitflags! {
    /// 区域的访问权限：`R W X U`
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}

#[derive(Clone, Debug)]
pub struct VmArea {
    range: Range<VirtPageNum>,
    perm: MapPermission,
}

impl VmArea {
    pub fn range(&self) -> Range<VirtPageNum> {
        self.range.clone()
    }

    pub fn perm(&self) -> MapPermission {
        self.perm
    }

    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.range.contains(&vpn)
    }
}

/// 缺页处理。返回的引用由地址空间持有，代表“该页映射在这里”
pub trait FaultHandler: Send + Sync {
    fn fault_in_page(
        &self,
        mm: &MemorySystem,
        space: &UserSpace,
        vpn: VirtPageNum,
        writable: bool,
    ) -> KResult<PageRef>;
}

/// 匿名内存：缺页时分配一个新页
pub struct AnonFaultHandler {
    flags: AllocFlags,
}

impl AnonFaultHandler {
    pub fn new(flags: AllocFlags) -> Self {
        Self { flags }
    }
}

impl Default for AnonFaultHandler {
    fn default() -> Self {
        Self::new(AllocFlags::HIGHMEM)
    }
}

impl FaultHandler for AnonFaultHandler {
    fn fault_in_page(
        &self,
        mm: &MemorySystem,
        space: &UserSpace,
        vpn: VirtPageNum,
        _writable: bool,
    ) -> KResult<PageRef> {
        let run = mm.alloc_page(self.flags)?;
        if let Some(frame) = mm.page(run.pfn()) {
            frame.set_mapping(Some(PageMapping {
                owner: space.id(),
                index: vpn.0,
            }));
            frame.set_flags(PageFlags::UPTODATE);
        }
        trace!("anon fault at {vpn:?} -> {}", run.pfn());
        Ok(run.into_ref())
    }
}

pub struct UserSpace {
    id: usize,
    /// 起始 vpn 映射到区域
    areas: SpinMutex<BTreeMap<VirtPageNum, VmArea>>,
    resident: SpinMutex<BTreeMap<VirtPageNum, PageRef>>,
    fault_handler: Box<dyn FaultHandler>,
}

impl UserSpace {
    pub fn new(id: usize, fault_handler: Box<dyn FaultHandler>) -> Self {
        Self {
            id,
            areas: SpinMutex::new(BTreeMap::new()),
            resident: SpinMutex::new(BTreeMap::new()),
            fault_handler,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// 映射一段区域，起始地址需要页对齐，且不能与已有区域重叠
    pub fn map_area(&self, start: VirtAddr, len: usize, perm: MapPermission) -> KResult<()> {
        if start.page_offset() != 0 || len == 0 {
            return Err(errno::EINVAL);
        }
        let range = start.vpn()..start.add(len).vpn_ceil();
        let mut areas = self.areas.lock();
        let overlaps = areas
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, area)| area.range.end > range.start);
        if overlaps {
            return Err(errno::EINVAL);
        }
        areas.insert(range.start, VmArea { range, perm });
        Ok(())
    }

    /// 解除以 `start` 开头的区域，归还其中驻留的页
    pub fn unmap_area(&self, mm: &MemorySystem, start: VirtAddr) -> KResult<()> {
        let area = self
            .areas
            .lock()
            .remove(&start.vpn())
            .ok_or(errno::EINVAL)?;
        let pages: Vec<PageRef> = {
            let mut resident = self.resident.lock();
            let vpns: Vec<VirtPageNum> = resident.range(area.range()).map(|(vpn, _)| *vpn).collect();
            vpns.into_iter()
                .filter_map(|vpn| resident.remove(&vpn))
                .collect()
        };
        for page in pages {
            mm.put_page(page);
        }
        Ok(())
    }

    pub fn area(&self, vpn: VirtPageNum) -> Option<VmArea> {
        self.areas
            .lock()
            .range(..=vpn)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(vpn))
            .cloned()
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PhysPageNum> {
        self.resident.lock().get(&vpn).map(PageRef::pfn)
    }

    pub fn resident_pages(&self) -> usize {
        self.resident.lock().len()
    }

    /// 确保 `vpn` 驻留，并为调用者额外取得一个引用
    pub(crate) fn get_user_page(
        &self,
        mm: &MemorySystem,
        vpn: VirtPageNum,
        writable: bool,
    ) -> KResult<PageRef> {
        let area = self.area(vpn).ok_or(errno::EFAULT)?;
        let needed = if writable {
            MapPermission::W | MapPermission::U
        } else {
            MapPermission::R | MapPermission::U
        };
        if !area.perm.contains(needed) {
            return Err(errno::EFAULT);
        }

        if let Some(page) = self.resident.lock().get(&vpn) {
            return Ok(mm.dup_page(page));
        }
        // 调页时不持锁，之后可能发现别人已经调入了
        let page = self.fault_handler.fault_in_page(mm, self, vpn, writable)?;
        let mut resident = self.resident.lock();
        match resident.get(&vpn) {
            Some(existing) => {
                let pinned = mm.dup_page(existing);
                mm.put_page(page);
                Ok(pinned)
            }
            None => {
                let pinned = mm.dup_page(&page);
                resident.insert(vpn, page);
                Ok(pinned)
            }
        }
    }

    /// 解除所有映射，归还所有驻留页
    pub fn release(&self, mm: &MemorySystem) {
        self.areas.lock().clear();
        let resident = core::mem::take(&mut *self.resident.lock());
        for page in resident.into_values() {
            mm.put_page(page);
        }
    }
}
