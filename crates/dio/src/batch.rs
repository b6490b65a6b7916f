//! 一批设备上连续的块 I/O，相当于 bio
//!
//! 每个片段持有它所在页的一个引用，批次完成并被回收时归还。

use core::fmt;

use defines::error::KResult;
use klocks::CompletionQueue;
use memory::{MemorySystem, PageRef, PhysPageNum, PinnedPage};
use smallvec::SmallVec;
use triomphe::Arc;

use crate::Direction;

/// 页内的一段连续字节
#[derive(Debug)]
pub struct Fragment {
    page: PageRef,
    offset: usize,
    len: usize,
}

impl Fragment {
    pub fn pfn(&self) -> PhysPageNum {
        self.page.pfn()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[must_use = "a batch must be submitted or completed, or its page references leak"]
pub struct IoBatch {
    direction: Direction,
    sector: u64,
    /// 批次第一个字节在整个请求中的偏移
    request_offset: usize,
    fragments: SmallVec<[Fragment; 4]>,
    max_fragments: usize,
    max_bytes: usize,
    size: usize,
    status: KResult<()>,
    done: Arc<CompletionQueue<IoBatch>>,
}

impl IoBatch {
    pub(crate) fn new(
        direction: Direction,
        sector: u64,
        request_offset: usize,
        max_fragments: usize,
        max_bytes: usize,
        done: Arc<CompletionQueue<IoBatch>>,
    ) -> Self {
        Self {
            direction,
            sector,
            request_offset,
            fragments: SmallVec::new(),
            max_fragments,
            max_bytes,
            size: 0,
            status: Ok(()),
            done,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 起始扇区
    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn request_offset(&self) -> usize {
        self.request_offset
    }

    /// 批次的总字节数
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn status(&self) -> KResult<()> {
        self.status
    }

    /// 设备结束了这一批 I/O。不会阻塞，可以在中断上下文调用
    pub fn complete(mut self, status: KResult<()>) {
        self.status = status;
        let done = Arc::clone(&self.done);
        done.push(self);
    }

    /// 尝试追加页 `page` 中 `offset` 处的 `len` 字节。
    ///
    /// 紧接着上一个片段的字节并入该片段，否则新开一个片段并为其取一个页引用。
    /// 超出字节数上限或片段数上限时返回 `false`
    pub(crate) fn try_add(
        &mut self,
        mm: &MemorySystem,
        page: &PinnedPage,
        offset: usize,
        len: usize,
    ) -> bool {
        if self.size + len > self.max_bytes {
            return false;
        }
        if let Some(last) = self.fragments.last_mut() {
            if last.page.pfn() == page.pfn() && last.offset + last.len == offset {
                last.len += len;
                self.size += len;
                return true;
            }
        }
        if self.fragments.len() >= self.max_fragments {
            return false;
        }
        self.fragments.push(Fragment {
            page: page.dup(mm),
            offset,
            len,
        });
        self.size += len;
        true
    }

    /// 归还所有片段的页引用，返回设备报告的状态
    pub(crate) fn release(self, mm: &MemorySystem) -> KResult<()> {
        for fragment in self.fragments {
            mm.put_page(fragment.page);
        }
        self.status
    }
}

impl fmt::Debug for IoBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBatch")
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("request_offset", &self.request_offset)
            .field("size", &self.size)
            .field("fragments", &self.fragments.len())
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use defines::error::errno;
    use memory::{
        AnonFaultHandler, MapPermission, MemoryConfig, MemoryLayout, MemorySystem, NoReclaim,
        PhysPageNum, UserSpace, VirtAddr, ZoneType,
    };
    use triomphe::Arc;

    use super::IoBatch;
    use crate::Direction;

    fn setup() -> (MemorySystem, UserSpace) {
        let config = MemoryConfig {
            min_free_kbytes: 0,
            ..MemoryConfig::default()
        };
        let mm = MemorySystem::boot(
            MemoryLayout::flat(ZoneType::Normal, PhysPageNum(0x80), 32),
            config,
            Box::new(NoReclaim),
        )
        .unwrap();
        let space = UserSpace::new(1, Box::new(AnonFaultHandler::default()));
        space
            .map_area(
                VirtAddr(0x1000),
                0x4000,
                MapPermission::R | MapPermission::W | MapPermission::U,
            )
            .unwrap();
        (mm, space)
    }

    #[test]
    fn adjacent_bytes_extend_the_last_fragment() {
        let (mm, space) = setup();
        let pages = space.pin_pages(&mm, VirtAddr(0x1000), 2, true).unwrap();
        let done = Arc::new(Default::default());
        let mut batch = IoBatch::new(Direction::Read, 8, 0, 2, 4 * 4096, Arc::clone(&done));
        assert!(batch.try_add(&mm, &pages[0], 1024, 1024));
        assert!(batch.try_add(&mm, &pages[0], 2048, 2048));
        assert!(batch.try_add(&mm, &pages[1], 0, 512));
        // 片段数已满，但仍可以延长最后一个片段
        assert!(!batch.try_add(&mm, &pages[0], 0, 512));
        assert!(batch.try_add(&mm, &pages[1], 512, 512));
        assert_eq!(batch.size(), 4096);
        let shape: Vec<_> = batch
            .fragments()
            .iter()
            .map(|fragment| (fragment.pfn(), fragment.offset(), fragment.len()))
            .collect();
        assert_eq!(
            shape,
            [(pages[0].pfn(), 1024, 3072), (pages[1].pfn(), 0, 1024)]
        );
        assert_eq!(mm.page_count(pages[0].pfn()), 3);

        batch.complete(Err(errno::EIO));
        let batch = done.try_pop().unwrap();
        assert_eq!(batch.status(), Err(errno::EIO));
        assert_eq!(batch.release(&mm), Err(errno::EIO));
        assert_eq!(mm.page_count(pages[0].pfn()), 2);
        mm.unpin_pages(pages);
        space.release(&mm);
    }

    #[test]
    fn byte_limit_refuses_even_adjacent_bytes() {
        let (mm, space) = setup();
        let pages = space.pin_pages(&mm, VirtAddr(0x1000), 1, false).unwrap();
        let mut batch = IoBatch::new(Direction::Write, 0, 0, 4, 1024, Default::default());
        assert!(batch.try_add(&mm, &pages[0], 0, 1024));
        assert!(!batch.try_add(&mm, &pages[0], 1024, 512));
        assert_eq!(batch.release(&mm), Ok(()));
        mm.unpin_pages(pages);
        space.release(&mm);
    }
}
