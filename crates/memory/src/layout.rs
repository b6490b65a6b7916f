//! 启动时传入的物理内存布局与运行期配置

use alloc::vec::Vec;
use core::ops::Range;

use defines::{
    config::{
        DEFAULT_MIN_FREE_KBYTES, LOCAL_DISTANCE, MAX_CPUS, MAX_NR_ZONES, MAX_NUMNODES,
        PCP_DEFAULT_BATCH,
    },
    error::{errno, KResult},
};

use crate::{address::PhysPageNum, zone::ZoneType};

/// 一个 zone 覆盖的物理页
#[derive(Clone, Debug)]
pub struct ZoneSpan {
    pub kind: ZoneType,
    pub start_pfn: PhysPageNum,
    pub pages: usize,
    /// 不交给伙伴系统管理的页
    pub reserved: Vec<Range<PhysPageNum>>,
}

impl ZoneSpan {
    pub fn new(kind: ZoneType, start_pfn: PhysPageNum, pages: usize) -> Self {
        Self {
            kind,
            start_pfn,
            pages,
            reserved: Vec::new(),
        }
    }

    pub fn reserve(mut self, range: Range<PhysPageNum>) -> Self {
        self.reserved.push(range);
        self
    }

    pub fn end_pfn(&self) -> PhysPageNum {
        self.start_pfn + self.pages
    }

    /// 扣除保留页之后真正可用的页数
    pub fn present_pages(&self) -> usize {
        let mut reserved: Vec<Range<usize>> = self
            .reserved
            .iter()
            .map(|r| r.start.0.max(self.start_pfn.0)..r.end.0.min(self.end_pfn().0))
            .filter(|r| !r.is_empty())
            .collect();
        reserved.sort_unstable_by_key(|r| r.start);
        // 保留区间之间可能重叠，合并后再计数
        let mut counted = 0;
        let mut cursor = 0;
        for r in reserved {
            let start = r.start.max(cursor);
            if r.end > start {
                counted += r.end - start;
            }
            cursor = cursor.max(r.end);
        }
        self.pages - counted
    }
}

#[derive(Clone, Debug)]
pub struct NodeLayout {
    pub id: usize,
    pub zones: Vec<ZoneSpan>,
}

impl NodeLayout {
    pub fn new(id: usize, zones: impl IntoIterator<Item = ZoneSpan>) -> Self {
        Self {
            id,
            zones: zones.into_iter().collect(),
        }
    }
}

/// 整机的内存布局。未给出 NUMA 距离表时，本地为 10，远端为 20
#[derive(Clone, Debug, Default)]
pub struct MemoryLayout {
    pub nodes: Vec<NodeLayout>,
    pub distance: Option<Vec<Vec<u8>>>,
}

impl MemoryLayout {
    pub fn with_node(mut self, node: NodeLayout) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_distance(mut self, distance: Vec<Vec<u8>>) -> Self {
        self.distance = Some(distance);
        self
    }

    /// 单节点、单 zone 的布局
    pub fn flat(kind: ZoneType, start_pfn: PhysPageNum, pages: usize) -> Self {
        Self::default().with_node(NodeLayout::new(0, [ZoneSpan::new(kind, start_pfn, pages)]))
    }

    pub fn validate(&self) -> KResult<()> {
        if self.nodes.is_empty() || self.nodes.len() > MAX_NUMNODES {
            return Err(errno::EINVAL);
        }
        let mut spans: Vec<&ZoneSpan> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id >= MAX_NUMNODES || self.nodes[..i].iter().any(|n| n.id == node.id) {
                return Err(errno::EINVAL);
            }
            if node.zones.len() > MAX_NR_ZONES {
                return Err(errno::EINVAL);
            }
            for (j, span) in node.zones.iter().enumerate() {
                if node.zones[..j].iter().any(|z| z.kind == span.kind) {
                    return Err(errno::EINVAL);
                }
                if span
                    .reserved
                    .iter()
                    .any(|r| r.start < span.start_pfn || r.end > span.end_pfn())
                {
                    return Err(errno::EINVAL);
                }
                spans.push(span);
            }
        }
        spans.sort_unstable_by_key(|span| span.start_pfn);
        if spans
            .windows(2)
            .any(|pair| pair[0].end_pfn() > pair[1].start_pfn)
        {
            return Err(errno::EINVAL);
        }

        if let Some(distance) = &self.distance {
            let max_id = self.nodes.iter().map(|n| n.id).max().unwrap_or(0);
            if distance.len() <= max_id || distance.iter().any(|row| row.len() <= max_id) {
                return Err(errno::EINVAL);
            }
            for node in &self.nodes {
                if distance[node.id][node.id] != LOCAL_DISTANCE {
                    return Err(errno::EINVAL);
                }
            }
        }
        Ok(())
    }
}

/// 运行期可调的内存管理参数
#[derive(Clone, Copy, Debug)]
pub struct MemoryConfig {
    /// 按此值计算各 zone 的水位线，为 0 时不设水位线
    pub min_free_kbytes: usize,
    pub nr_cpus: usize,
    /// per-cpu 缓存的批量大小，为 0 时按 zone 大小推算
    pub pcp_batch: usize,
    /// 当前 CPU 号
    pub cpu_id: fn() -> usize,
    /// CPU 所在的 NUMA 节点
    pub cpu_node: fn(usize) -> usize,
}

fn boot_cpu() -> usize {
    0
}

fn node_of_cpu(_cpu: usize) -> usize {
    0
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_free_kbytes: DEFAULT_MIN_FREE_KBYTES,
            nr_cpus: 1,
            pcp_batch: PCP_DEFAULT_BATCH,
            cpu_id: boot_cpu,
            cpu_node: node_of_cpu,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> KResult<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(errno::EINVAL);
        }
        Ok(())
    }
}
