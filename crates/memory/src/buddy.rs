//! 伙伴系统的空闲链表
//!
//! 下标都是相对 zone 起始 pfn 的偏移，阶为 `order` 的块的伙伴是 `idx ^ (1 << order)`。
//! 每一阶一条双向链表，链接信息按页存放在 `links` 中，只有空闲块的首页才在链表上。
//! 整个结构由 zone 锁保护。

use alloc::{vec, vec::Vec};

use defines::config::MAX_ORDER;

const NIL: u32 = u32::MAX;
/// `order_of` 中表示“不是空闲块的首页”
const NOT_FREE: u8 = u8::MAX;

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

#[derive(Clone, Copy)]
struct FreeList {
    head: u32,
    nr_free: usize,
}

pub(crate) struct FreeArea {
    pages: usize,
    lists: [FreeList; MAX_ORDER],
    links: Vec<Link>,
    order_of: Vec<u8>,
    nr_free_pages: usize,
}

impl FreeArea {
    /// 创建一个全部页都不空闲的 free area，空闲页由 [`FreeArea::add_range`] 加入
    pub fn new(pages: usize) -> Self {
        debug_assert!(pages < NIL as usize);
        Self {
            pages,
            lists: [FreeList {
                head: NIL,
                nr_free: 0,
            }; MAX_ORDER],
            links: vec![
                Link {
                    prev: NIL,
                    next: NIL,
                };
                pages
            ],
            order_of: vec![NOT_FREE; pages],
            nr_free_pages: 0,
        }
    }

    /// 空闲页总数
    pub fn nr_free_pages(&self) -> usize {
        self.nr_free_pages
    }

    /// 某一阶上的空闲块数
    pub fn nr_free(&self, order: usize) -> usize {
        self.lists[order].nr_free
    }

    pub fn is_free_head(&self, idx: usize) -> bool {
        self.order_of[idx] != NOT_FREE
    }

    fn push(&mut self, idx: usize, order: usize) {
        let list = &mut self.lists[order];
        let old_head = list.head;
        self.links[idx] = Link {
            prev: NIL,
            next: old_head,
        };
        if old_head != NIL {
            self.links[old_head as usize].prev = idx as u32;
        }
        list.head = idx as u32;
        list.nr_free += 1;
        self.order_of[idx] = order as u8;
    }

    fn remove(&mut self, idx: usize, order: usize) {
        debug_assert_eq!(self.order_of[idx], order as u8);
        let Link { prev, next } = self.links[idx];
        if prev == NIL {
            self.lists[order].head = next;
        } else {
            self.links[prev as usize].next = next;
        }
        if next != NIL {
            self.links[next as usize].prev = prev;
        }
        self.lists[order].nr_free -= 1;
        self.order_of[idx] = NOT_FREE;
    }

    /// 取出一个 `order` 阶的块。没有恰好大小的块时拆分更大的块，
    /// 每次拆分保留低半部分，高半部分放回低一阶的链表
    pub fn alloc(&mut self, order: usize) -> Option<usize> {
        let current = (order..MAX_ORDER).find(|&o| self.lists[o].head != NIL)?;
        let idx = self.lists[current].head as usize;
        self.remove(idx, current);
        let mut size = 1 << current;
        for lower in (order..current).rev() {
            size >>= 1;
            self.push(idx + size, lower);
        }
        self.nr_free_pages -= 1 << order;
        Some(idx)
    }

    /// 放回一个 `order` 阶的块，并尽可能与伙伴合并
    pub fn free(&mut self, mut idx: usize, mut order: usize) {
        debug_assert!(idx + (1 << order) <= self.pages);
        debug_assert!(!self.is_free_head(idx), "double free of block {idx}");
        self.nr_free_pages += 1 << order;
        while order < MAX_ORDER - 1 {
            let buddy = idx ^ (1 << order);
            if buddy >= self.pages || self.order_of[buddy] != order as u8 {
                break;
            }
            self.remove(buddy, order);
            idx &= buddy;
            order += 1;
        }
        self.push(idx, order);
    }

    /// 把 `[start, end)` 中的页作为空闲页加入，按对齐切成尽量大的块
    pub fn add_range(&mut self, mut start: usize, end: usize) {
        while start < end {
            let align = if start == 0 {
                MAX_ORDER - 1
            } else {
                start.trailing_zeros() as usize
            };
            let fit = (end - start).ilog2() as usize;
            let order = align.min(fit).min(MAX_ORDER - 1);
            self.free(start, order);
            start += 1 << order;
        }
    }

    /// 每一阶上空闲块首页的有序列表
    pub fn snapshot(&self) -> [Vec<usize>; MAX_ORDER] {
        let mut snapshot: [Vec<usize>; MAX_ORDER] = Default::default();
        for (order, blocks) in snapshot.iter_mut().enumerate() {
            let mut cursor = self.lists[order].head;
            while cursor != NIL {
                blocks.push(cursor as usize);
                cursor = self.links[cursor as usize].next;
            }
            blocks.sort_unstable();
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use defines::config::MAX_ORDER;

    use super::FreeArea;

    #[test]
    fn whole_area_coalesces_into_max_blocks() {
        let mut area = FreeArea::new(2048);
        for idx in 0..2048 {
            area.free(idx, 0);
        }
        let snapshot = area.snapshot();
        assert_eq!(snapshot[MAX_ORDER - 1], [0, 1024]);
        assert!(snapshot[..MAX_ORDER - 1].iter().all(Vec::is_empty));
        assert_eq!(area.nr_free_pages(), 2048);
    }

    #[test]
    fn split_keeps_lower_half() {
        let mut area = FreeArea::new(16);
        area.add_range(0, 16);
        assert_eq!(area.snapshot()[4], [0]);

        assert_eq!(area.alloc(0), Some(0));
        let snapshot = area.snapshot();
        assert_eq!(snapshot[0], [1]);
        assert_eq!(snapshot[1], [2]);
        assert_eq!(snapshot[2], [4]);
        assert_eq!(snapshot[3], [8]);
        assert_eq!(area.nr_free_pages(), 15);

        area.free(0, 0);
        assert_eq!(area.snapshot()[4], [0]);
        assert_eq!(area.nr_free(4), 1);
    }

    #[test]
    fn unaligned_tail_is_split_by_alignment() {
        let mut area = FreeArea::new(13);
        area.add_range(1, 13);
        let snapshot = area.snapshot();
        // 1 | 2..4 | 4..8 | 8..12 | 12
        assert_eq!(snapshot[0], [1, 12]);
        assert_eq!(snapshot[1], [2]);
        assert_eq!(snapshot[2], [4, 8]);
        assert_eq!(area.nr_free_pages(), 12);
    }

    #[test]
    fn buddy_outside_area_is_never_merged() {
        let mut area = FreeArea::new(3);
        area.add_range(0, 3);
        assert_eq!(area.snapshot()[1], [0]);
        assert_eq!(area.snapshot()[0], [2]);
        assert_eq!(area.alloc(1), Some(0));
        assert_eq!(area.alloc(1), None);
        assert_eq!(area.alloc(0), Some(2));
        assert_eq!(area.alloc(0), None);
    }

    #[test]
    fn removal_from_middle_of_list() {
        let mut area = FreeArea::new(8);
        for idx in [0, 2, 4, 6] {
            area.free(idx, 0);
        }
        assert_eq!(area.nr_free(0), 4);
        // 3 与 2 是伙伴，合并后 2..4 再与 0 无法合并
        area.free(3, 0);
        let snapshot = area.snapshot();
        assert_eq!(snapshot[0], [0, 4, 6]);
        assert_eq!(snapshot[1], [2]);
        area.free(1, 0);
        let snapshot = area.snapshot();
        assert_eq!(snapshot[0], [4, 6]);
        assert_eq!(snapshot[2], [0]);
    }
}
