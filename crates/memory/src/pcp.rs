//! per-cpu 单页缓存
//!
//! 每个 CPU 在每个 zone 中有冷热两条链表。单页分配与释放只碰本 CPU 的链表，
//! 只有链表过短或过长时才持 zone 锁与伙伴系统批量交换 `batch` 页。

use alloc::vec::Vec;

/// 一条缓存链表，后进先出，链表尾部是最“热”的页
pub(crate) struct PerCpuPages {
    pub low: usize,
    pub high: usize,
    pub batch: usize,
    /// zone 内的页下标
    pub list: Vec<usize>,
}

impl PerCpuPages {
    fn new(low: usize, high: usize, batch: usize) -> Self {
        Self {
            low,
            high,
            batch,
            list: Vec::with_capacity(high + batch),
        }
    }

    pub fn count(&self) -> usize {
        self.list.len()
    }

    pub fn needs_refill(&self) -> bool {
        self.count() <= self.low
    }

    pub fn needs_drain(&self) -> bool {
        self.count() >= self.high
    }

    /// 从冷端取出最多 `batch` 页还给伙伴系统
    pub fn take_batch(&mut self) -> impl Iterator<Item = usize> + '_ {
        let n = self.batch.min(self.count());
        self.list.drain(..n)
    }
}

pub(crate) struct PerCpuPageset {
    pub hot: PerCpuPages,
    pub cold: PerCpuPages,
}

impl PerCpuPageset {
    pub fn new(batch: usize) -> Self {
        let batch = batch.max(1);
        Self {
            hot: PerCpuPages::new(2 * batch, 6 * batch, batch),
            cold: PerCpuPages::new(0, 2 * batch, batch),
        }
    }

    pub fn list(&mut self, cold: bool) -> &mut PerCpuPages {
        if cold {
            &mut self.cold
        } else {
            &mut self.hot
        }
    }

    pub fn count(&self) -> usize {
        self.hot.count() + self.cold.count()
    }
}

/// 按 zone 大小推算批量：大约每 1024 页一个，限制在 `1..=32`
pub(crate) fn zone_batchsize(present_pages: usize) -> usize {
    (present_pages / 1024).clamp(1, 32)
}
