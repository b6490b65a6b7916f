//! 钉住用户页
//!
//! 被钉住的页多持有一个引用，I/O 期间不会被释放。钉页是全有或全无的：
//! 中途失败时已经钉住的页会立刻放掉。为写入而钉住的页在放开前标记为脏。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use defines::error::KResult;
use scopeguard::ScopeGuard;

use crate::{
    address::{PhysPageNum, VirtAddr},
    frame::PageRef,
    system::MemorySystem,
    user_space::UserSpace,
};

#[derive(Default)]
pub(crate) struct PinCounters {
    pinned: AtomicUsize,
    unpinned: AtomicUsize,
}

impl PinCounters {
    pub fn stats(&self) -> PinStats {
        PinStats {
            pinned: self.pinned.load(Ordering::Relaxed),
            unpinned: self.unpinned.load(Ordering::Relaxed),
        }
    }
}

/// 累计钉住与放开的页数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinStats {
    pub pinned: usize,
    pub unpinned: usize,
}

impl PinStats {
    /// 仍然钉着的页数
    pub fn outstanding(&self) -> usize {
        self.pinned - self.unpinned
    }
}

/// 一个被钉住的用户页
#[must_use = "pinned pages must be released with `unpin_page`"]
#[derive(Debug)]
pub struct PinnedPage {
    page: PageRef,
    writable: bool,
}

impl PinnedPage {
    pub fn pfn(&self) -> PhysPageNum {
        self.page.pfn()
    }

    /// I/O 是否会写入该页
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// 为 I/O 片段额外取一个引用，片段完成后用 `put_page` 归还
    pub fn dup(&self, mm: &MemorySystem) -> PageRef {
        mm.dup_page(&self.page)
    }
}

impl UserSpace {
    /// 钉住从 `addr` 所在页开始的 `count` 个页，必要时先调页。
    ///
    /// 任何一页不在可访问的区域内都返回 `EFAULT`，调页失败返回其错误，此时不会留下任何钉住的页
    pub fn pin_pages(
        &self,
        mm: &MemorySystem,
        addr: VirtAddr,
        count: usize,
        writable: bool,
    ) -> KResult<Vec<PinnedPage>> {
        let start = addr.vpn();
        let mut pinned = scopeguard::guard(Vec::with_capacity(count), |pinned: Vec<PinnedPage>| {
            if !pinned.is_empty() {
                debug!("pin of {count} pages at {addr:?} failed, releasing {}", pinned.len());
            }
            for page in pinned {
                mm.release_pin(page, false);
            }
        });
        for i in 0..count {
            let page = self.get_user_page(mm, start + i, writable)?;
            mm.pins.pinned.fetch_add(1, Ordering::Relaxed);
            pinned.push(PinnedPage { page, writable });
        }
        Ok(ScopeGuard::into_inner(pinned))
    }
}

impl MemorySystem {
    fn release_pin(&self, page: PinnedPage, dirty: bool) {
        if dirty && page.writable {
            self.set_page_dirty(page.pfn());
        }
        self.pins.unpinned.fetch_add(1, Ordering::Relaxed);
        self.put_page(page.page);
    }

    /// 放开一个钉住的页，写入过的页标记为脏
    pub fn unpin_page(&self, page: PinnedPage) {
        self.release_pin(page, true);
    }

    /// 放开一个还没有参与 I/O 的钉住页，不标记为脏
    pub fn unpin_unused(&self, page: PinnedPage) {
        self.release_pin(page, false);
    }

    pub fn unpin_pages(&self, pages: impl IntoIterator<Item = PinnedPage>) {
        for page in pages {
            self.unpin_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use defines::error::{errno, KResult};

    use crate::{
        address::{PhysPageNum, VirtAddr, VirtPageNum},
        frame::PageRef,
        layout::{MemoryConfig, MemoryLayout},
        system::{MemorySystem, NoReclaim},
        user_space::{AnonFaultHandler, FaultHandler, MapPermission, UserSpace},
        zone::ZoneType,
    };

    fn mm(pages: usize) -> MemorySystem {
        let config = MemoryConfig {
            min_free_kbytes: 0,
            ..MemoryConfig::default()
        };
        MemorySystem::boot(
            MemoryLayout::flat(ZoneType::Normal, PhysPageNum(0x100), pages),
            config,
            Box::new(NoReclaim),
        )
        .unwrap()
    }

    fn space(perm: MapPermission, pages: usize) -> UserSpace {
        let space = UserSpace::new(1, Box::new(AnonFaultHandler::default()));
        space.map_area(VirtAddr(0x10000), pages * 0x1000, perm).unwrap();
        space
    }

    fn rw() -> MapPermission {
        MapPermission::R | MapPermission::W | MapPermission::U
    }

    #[test]
    fn pin_takes_one_reference_per_page() {
        let mm = mm(64);
        let space = space(rw(), 4);
        let pages = space.pin_pages(&mm, VirtAddr(0x10800), 3, false).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(space.resident_pages(), 3);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(space.translate(VirtPageNum(0x10 + i)), Some(page.pfn()));
            assert_eq!(mm.page_count(page.pfn()), 2);
        }
        assert_eq!(mm.pin_stats().outstanding(), 3);

        let pfns: Vec<_> = pages.iter().map(|page| page.pfn()).collect();
        mm.unpin_pages(pages);
        assert!(pfns.iter().all(|&pfn| mm.page_count(pfn) == 1));
        assert!(pfns.iter().all(|&pfn| !mm.page(pfn).unwrap().is_dirty()));
        assert_eq!(mm.pin_stats().pinned, 3);
        assert_eq!(mm.pin_stats().outstanding(), 0);
        space.release(&mm);
    }

    #[test]
    fn writable_pins_dirty_their_pages() {
        let mm = mm(64);
        let space = space(rw(), 2);
        let mut pages = space.pin_pages(&mm, VirtAddr(0x10000), 2, true).unwrap();
        let fragment = pages[0].dup(&mm);
        assert_eq!(mm.page_count(fragment.pfn()), 3);
        mm.put_page(fragment);

        let last = pages.pop().unwrap();
        let pfn = last.pfn();
        assert!(last.writable());
        mm.unpin_page(last);
        assert!(mm.page(pfn).unwrap().is_dirty());
        mm.unpin_pages(pages);
        space.release(&mm);
    }

    #[test]
    fn unused_pins_stay_clean() {
        let mm = mm(64);
        let space = space(rw(), 1);
        let page = space.pin_pages(&mm, VirtAddr(0x10000), 1, true).unwrap().remove(0);
        let pfn = page.pfn();
        mm.unpin_unused(page);
        assert!(!mm.page(pfn).unwrap().is_dirty());
        assert_eq!(mm.page_count(pfn), 1);
        assert_eq!(mm.pin_stats().outstanding(), 0);
        space.release(&mm);
    }

    #[test]
    fn pin_outside_area_is_all_or_nothing() {
        let mm = mm(64);
        let space = space(rw(), 2);
        let err = space.pin_pages(&mm, VirtAddr(0x10000), 3, false).unwrap_err();
        assert_eq!(err, errno::EFAULT);
        assert_eq!(mm.pin_stats().outstanding(), 0);
        assert_eq!(mm.pin_stats().pinned, 2);
        // 调入的页仍然驻留，只是没有被钉住
        for vpn in [0x10, 0x11] {
            let pfn = space.translate(VirtPageNum(vpn)).unwrap();
            assert_eq!(mm.page_count(pfn), 1);
        }
        space.release(&mm);
    }

    #[test]
    fn write_pin_needs_writable_area() {
        let mm = mm(64);
        let space = space(MapPermission::R | MapPermission::U, 2);
        assert_eq!(
            space.pin_pages(&mm, VirtAddr(0x10000), 1, true).unwrap_err(),
            errno::EFAULT
        );
        assert_eq!(space.resident_pages(), 0);
        assert_eq!(mm.pin_stats(), Default::default());
    }

    #[test]
    fn out_of_memory_while_faulting() {
        let mm = mm(4);
        let space = space(rw(), 8);
        let err = space.pin_pages(&mm, VirtAddr(0x10000), 8, true).unwrap_err();
        assert_eq!(err, errno::ENOMEM);
        assert_eq!(mm.pin_stats().outstanding(), 0);
        assert_eq!(space.resident_pages(), 4);
        space.release(&mm);
        mm.drain_all_pages();
        assert_eq!(mm.nr_free_pages(), 4);
    }

    struct BrokenDisk;

    impl FaultHandler for BrokenDisk {
        fn fault_in_page(
            &self,
            _mm: &MemorySystem,
            _space: &UserSpace,
            _vpn: VirtPageNum,
            _writable: bool,
        ) -> KResult<PageRef> {
            Err(errno::EIO)
        }
    }

    #[test]
    fn fault_handler_errors_propagate() {
        let mm = mm(8);
        let space = UserSpace::new(2, Box::new(BrokenDisk));
        space.map_area(VirtAddr(0), 0x1000, rw()).unwrap();
        assert_eq!(
            space.pin_pages(&mm, VirtAddr(0), 1, false).unwrap_err(),
            errno::EIO
        );
        assert!(space.pin_pages(&mm, VirtAddr(0), 0, false).unwrap().is_empty());
    }
}
