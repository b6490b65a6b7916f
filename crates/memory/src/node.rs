//! NUMA 节点与 zonelist
//!
//! zonelist 是某个节点上某类分配请求的后备顺序：先按 NUMA 距离排列节点，
//! 每个节点再从目标 zone 类型往下（HighMem → Normal → DMA）排列有页的 zone。
//! zonelist 读多写少，只在节点上下线时整体重建。

use alloc::vec::Vec;
use core::{
    array,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use defines::{
    config::{LOCAL_DISTANCE, MAX_NR_ZONES, MAX_NUMNODES, PAGE_SIZE_BITS, REMOTE_DISTANCE},
    error::{errno, KResult},
};
use klocks::{RwLock, SpinMutex};
use smallvec::SmallVec;
use triomphe::Arc;

use crate::{
    layout::{MemoryConfig, MemoryLayout, ZoneSpan},
    pcp::zone_batchsize,
    zone::{AllocFlags, Watermarks, Zone, ZoneId, ZoneType},
};

/// 一次分配请求依次尝试的 zone
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Zonelist {
    zones: SmallVec<[ZoneId; 8]>,
}

impl Zonelist {
    pub fn zones(&self) -> &[ZoneId] {
        &self.zones
    }

    /// 首选的 zone，NUMA 命中与否以它所在的节点为准
    pub fn preferred(&self) -> Option<ZoneId> {
        self.zones.first().copied()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

impl FromIterator<ZoneId> for Zonelist {
    fn from_iter<I: IntoIterator<Item = ZoneId>>(iter: I) -> Self {
        Self {
            zones: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStat {
    /// 在首选节点上分配成功
    NumaHit,
    /// 首选的是别的节点，却在本节点上分配了
    NumaMiss,
    /// 首选本节点，却在别的节点上分配了
    NumaForeign,
    /// 分配给运行在本节点 CPU 上的请求
    LocalNode,
    OtherNode,
}

const NR_NODE_STATS: usize = 5;

pub struct Node {
    id: usize,
    zones: [Option<Zone>; MAX_NR_ZONES],
    online: AtomicBool,
    stats: [AtomicUsize; NR_NODE_STATS],
}

impl Node {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn zone(&self, kind: ZoneType) -> Option<&Zone> {
        self.zones[kind.index()].as_ref()
    }

    /// 本节点的 zone，从 DMA 到 HighMem
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().flatten()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn present_pages(&self) -> usize {
        self.zones().map(Zone::present_pages).sum()
    }

    pub fn free_pages(&self) -> usize {
        self.zones().map(Zone::free_pages).sum()
    }

    pub fn stat(&self, item: NodeStat) -> usize {
        self.stats[item as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn count(&self, item: NodeStat) {
        self.stats[item as usize].fetch_add(1, Ordering::Relaxed);
    }
}

type NodeZonelists = [Arc<Zonelist>; MAX_NR_ZONES];

pub struct NodeDirectory {
    /// 按节点号升序
    nodes: Vec<Node>,
    distance: [[u8; MAX_NUMNODES]; MAX_NUMNODES],
    /// 以节点号为下标，下线的节点为 `None`
    zonelists: RwLock<[Option<NodeZonelists>; MAX_NUMNODES]>,
    /// 节点上下线互斥
    hotplug: SpinMutex<()>,
}

impl NodeDirectory {
    /// 按布局创建所有节点与 zone，并计算水位线。布局需要事先校验过
    pub fn new(layout: &MemoryLayout, config: &MemoryConfig) -> Self {
        let distance = array::from_fn(|from| {
            array::from_fn(|to| {
                layout
                    .distance
                    .as_ref()
                    .and_then(|table| table.get(from)?.get(to).copied())
                    .unwrap_or(if from == to {
                        LOCAL_DISTANCE
                    } else {
                        REMOTE_DISTANCE
                    })
            })
        });

        let min_pages = ZoneMinPages::new(layout, config.min_free_kbytes);
        let mut nodes: Vec<Node> = layout
            .nodes
            .iter()
            .map(|node_layout| {
                let mut zones: [Option<Zone>; MAX_NR_ZONES] = Default::default();
                for span in &node_layout.zones {
                    let present = span.present_pages();
                    let batch = match config.pcp_batch {
                        0 => zone_batchsize(present),
                        batch => batch,
                    };
                    let watermarks = Watermarks::from_min(min_pages.of(span));
                    let zone = Zone::new(node_layout.id, span, watermarks, config.nr_cpus, batch);
                    info!(
                        "{}: pfn {}..{}, {present} present pages, watermarks {}/{}/{}, pcp batch {batch}",
                        zone.id(),
                        span.start_pfn,
                        span.end_pfn(),
                        watermarks.min,
                        watermarks.low,
                        watermarks.high,
                    );
                    zones[span.kind.index()] = Some(zone);
                }
                Node {
                    id: node_layout.id,
                    zones,
                    online: AtomicBool::new(true),
                    stats: Default::default(),
                }
            })
            .collect();
        nodes.sort_unstable_by_key(Node::id);

        let directory = Self {
            nodes,
            distance,
            zonelists: RwLock::new(Default::default()),
            hotplug: SpinMutex::new(()),
        };
        directory.build_zonelists();
        directory
    }

    pub fn node(&self, id: usize) -> Option<&Node> {
        self.nodes
            .binary_search_by_key(&id, Node::id)
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// 包括下线节点在内的所有节点
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// 在线的节点
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.is_online())
    }

    /// 在线节点上的所有 zone
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.nodes().flat_map(|node| node.zones())
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.node(id.node)?.zone(id.kind)
    }

    /// 遍历顺序中的下一个 zone：先是同一节点中更高的 zone，然后是下一个在线节点的第一个 zone
    pub fn next_zone(&self, id: ZoneId) -> Option<ZoneId> {
        let node = self.node(id.node)?;
        if let Some(zone) = node.zones().find(|zone| zone.kind() > id.kind) {
            return Some(zone.id());
        }
        self.nodes()
            .filter(|next| next.id() > id.node)
            .find_map(|next| next.zones().next())
            .map(Zone::id)
    }

    pub fn is_highmem(&self, id: ZoneId) -> bool {
        id.kind == ZoneType::HighMem
    }

    pub fn populated_zone(&self, id: ZoneId) -> bool {
        self.zone(id).is_some_and(Zone::populated)
    }

    pub fn node_distance(&self, from: usize, to: usize) -> u8 {
        if from >= MAX_NUMNODES || to >= MAX_NUMNODES {
            return u8::MAX;
        }
        self.distance[from][to]
    }

    /// 节点 `local` 上满足 `flags` 的分配请求所用的 zonelist
    pub fn zonelist(&self, local: usize, flags: AllocFlags) -> KResult<Arc<Zonelist>> {
        let zonelists = self.zonelists.read();
        let lists = zonelists
            .get(local)
            .and_then(Option::as_ref)
            .ok_or(errno::ENODEV)?;
        Ok(Arc::clone(&lists[flags.zone_type().index()]))
    }

    /// 按距离由近到远排列在线节点，距离相同时按节点号从 `local` 往后轮转
    fn node_order(&self, local: usize) -> SmallVec<[usize; MAX_NUMNODES]> {
        let mut order: SmallVec<[usize; MAX_NUMNODES]> = self.nodes().map(Node::id).collect();
        order.sort_unstable_by_key(|&n| {
            (
                self.node_distance(local, n),
                (n + MAX_NUMNODES - local) % MAX_NUMNODES,
            )
        });
        order
    }

    fn build_zonelist(&self, local: usize, goal: ZoneType) -> Zonelist {
        self.node_order(local)
            .into_iter()
            .filter_map(|n| self.node(n))
            .flat_map(|node| {
                ZoneType::ALL
                    .into_iter()
                    .take(goal.index() + 1)
                    .rev()
                    .filter_map(move |kind| node.zone(kind))
                    .filter(|zone| zone.populated())
                    .map(Zone::id)
            })
            .collect()
    }

    /// 为每个在线节点重建所有 zonelist
    pub fn build_zonelists(&self) {
        let mut built: [Option<NodeZonelists>; MAX_NUMNODES] = Default::default();
        for node in self.nodes() {
            let lists = ZoneType::ALL.map(|goal| Arc::new(self.build_zonelist(node.id(), goal)));
            debug!(
                "node{} zonelist: {:?}",
                node.id(),
                lists[ZoneType::HighMem.index()].zones()
            );
            built[node.id()] = Some(lists);
        }
        *self.zonelists.write() = built;
    }

    pub fn online_node(&self, id: usize) -> KResult<()> {
        let node = self.node(id).ok_or(errno::ENODEV)?;
        let _hotplug = self.hotplug.lock();
        if !node.is_online() {
            for zone in node.zones() {
                zone.unseal();
            }
            node.online.store(true, Ordering::Release);
            info!("node{id} online");
            self.build_zonelists();
        }
        Ok(())
    }

    /// 下线一个节点。节点上还有页被占用时返回 `EBUSY`。
    ///
    /// 每个 zone 在确认全部空闲的同时被封住，仍持有旧 zonelist 的分配者也拿不到它的页
    pub fn offline_node(&self, id: usize) -> KResult<()> {
        let node = self.node(id).ok_or(errno::ENODEV)?;
        let _hotplug = self.hotplug.lock();
        if !node.is_online() {
            return Ok(());
        }
        let zones: SmallVec<[&Zone; MAX_NR_ZONES]> = node.zones().collect();
        for (sealed, zone) in zones.iter().enumerate() {
            if !zone.seal() {
                warn!(
                    "cannot offline node{id}: {} has {} pages in use",
                    zone.id(),
                    zone.present_pages().saturating_sub(zone.free_pages())
                );
                for zone in &zones[..sealed] {
                    zone.unseal();
                }
                return Err(errno::EBUSY);
            }
        }
        node.online.store(false, Ordering::Release);
        info!("node{id} offline");
        self.build_zonelists();
        Ok(())
    }
}

/// 按 `min_free_kbytes` 为每个 zone 分配 min 水位：低端 zone 按大小比例分摊，
/// 高端内存 zone 只保留一个很小的数目
struct ZoneMinPages {
    pages_min: usize,
    lowmem_pages: usize,
}

impl ZoneMinPages {
    fn new(layout: &MemoryLayout, min_free_kbytes: usize) -> Self {
        let lowmem_pages = layout
            .nodes
            .iter()
            .flat_map(|node| node.zones.iter())
            .filter(|span| span.kind != ZoneType::HighMem)
            .map(ZoneSpan::present_pages)
            .sum();
        Self {
            pages_min: min_free_kbytes >> (PAGE_SIZE_BITS - 10),
            lowmem_pages,
        }
    }

    fn of(&self, span: &ZoneSpan) -> usize {
        let present = span.present_pages();
        if self.pages_min == 0 || present == 0 {
            return 0;
        }
        if span.kind == ZoneType::HighMem {
            return (present / 1024).clamp(32, 128).min(present);
        }
        (self.pages_min as u64 * present as u64 / self.lowmem_pages.max(1) as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use defines::error::errno;

    use super::{NodeDirectory, NodeStat};
    use crate::{
        address::PhysPageNum,
        layout::{MemoryConfig, MemoryLayout, NodeLayout, ZoneSpan},
        zone::{AllocFlags, ZoneId, ZoneType},
    };

    fn id(node: usize, kind: ZoneType) -> ZoneId {
        ZoneId { node, kind }
    }

    /// 节点 0 有三个 zone，节点 1 只有 Normal，节点 2 有 Normal 与 HighMem
    fn three_nodes() -> MemoryLayout {
        MemoryLayout::default()
            .with_node(NodeLayout::new(
                0,
                [
                    ZoneSpan::new(ZoneType::Dma, PhysPageNum(0), 256),
                    ZoneSpan::new(ZoneType::Normal, PhysPageNum(256), 1024),
                    ZoneSpan::new(ZoneType::HighMem, PhysPageNum(1280), 512),
                ],
            ))
            .with_node(NodeLayout::new(
                1,
                [ZoneSpan::new(ZoneType::Normal, PhysPageNum(2048), 1024)],
            ))
            .with_node(NodeLayout::new(
                2,
                [
                    ZoneSpan::new(ZoneType::Normal, PhysPageNum(4096), 1024),
                    ZoneSpan::new(ZoneType::HighMem, PhysPageNum(5120), 1024),
                ],
            ))
            .with_distance(vec![vec![10, 30, 20], vec![30, 10, 20], vec![20, 20, 10]])
    }

    fn directory() -> NodeDirectory {
        NodeDirectory::new(&three_nodes(), &MemoryConfig::default())
    }

    #[test]
    fn zonelist_prefers_near_nodes_and_lower_zones() {
        let dir = directory();
        let list = dir.zonelist(0, AllocFlags::HIGHMEM).unwrap();
        assert_eq!(
            list.zones(),
            [
                id(0, ZoneType::HighMem),
                id(0, ZoneType::Normal),
                id(0, ZoneType::Dma),
                id(2, ZoneType::HighMem),
                id(2, ZoneType::Normal),
                id(1, ZoneType::Normal),
            ]
        );
        let list = dir.zonelist(1, AllocFlags::empty()).unwrap();
        assert_eq!(
            list.zones(),
            [
                id(1, ZoneType::Normal),
                id(2, ZoneType::Normal),
                id(0, ZoneType::Normal),
                id(0, ZoneType::Dma),
            ]
        );
        let list = dir.zonelist(2, AllocFlags::DMA).unwrap();
        assert_eq!(list.zones(), [id(0, ZoneType::Dma)]);
        assert_eq!(list.preferred(), Some(id(0, ZoneType::Dma)));
    }

    #[test]
    fn equal_distances_rotate_from_local_node() {
        let layout = MemoryLayout::default()
            .with_node(NodeLayout::new(0, [ZoneSpan::new(ZoneType::Normal, PhysPageNum(0), 64)]))
            .with_node(NodeLayout::new(1, [ZoneSpan::new(ZoneType::Normal, PhysPageNum(64), 64)]))
            .with_node(NodeLayout::new(2, [ZoneSpan::new(ZoneType::Normal, PhysPageNum(128), 64)]));
        let dir = NodeDirectory::new(&layout, &MemoryConfig::default());
        let nodes: Vec<usize> = dir
            .zonelist(1, AllocFlags::empty())
            .unwrap()
            .zones()
            .iter()
            .map(|zone| zone.node)
            .collect();
        assert_eq!(nodes, [1, 2, 0]);
    }

    #[test]
    fn offline_node_leaves_every_zonelist() {
        let dir = directory();
        dir.offline_node(2).unwrap();
        assert_eq!(dir.zonelist(2, AllocFlags::empty()), Err(errno::ENODEV));
        let list = dir.zonelist(0, AllocFlags::HIGHMEM).unwrap();
        assert!(list.zones().iter().all(|zone| zone.node != 2));
        assert_eq!(dir.nodes().count(), 2);

        dir.online_node(2).unwrap();
        assert_eq!(dir.zonelist(0, AllocFlags::HIGHMEM).unwrap().len(), 6);
        assert_eq!(dir.online_node(5), Err(errno::ENODEV));
    }

    #[test]
    fn iteration_helpers() {
        let dir = directory();
        assert_eq!(dir.zones().count(), 6);
        assert_eq!(dir.next_zone(id(0, ZoneType::Dma)), Some(id(0, ZoneType::Normal)));
        assert_eq!(dir.next_zone(id(0, ZoneType::HighMem)), Some(id(1, ZoneType::Normal)));
        assert_eq!(dir.next_zone(id(1, ZoneType::Normal)), Some(id(2, ZoneType::Normal)));
        assert_eq!(dir.next_zone(id(2, ZoneType::HighMem)), None);
        assert!(dir.is_highmem(id(2, ZoneType::HighMem)));
        assert!(dir.populated_zone(id(1, ZoneType::Normal)));
        assert!(!dir.populated_zone(id(1, ZoneType::Dma)));
        assert_eq!(dir.node_distance(0, 2), 20);
        assert_eq!(dir.node(1).unwrap().stat(NodeStat::NumaHit), 0);
    }

    #[test]
    fn watermarks_split_by_zone_size() {
        let dir = directory();
        // 1024 KiB = 256 页，低端内存共 256 + 3 * 1024 页
        let dma = dir.zone(id(0, ZoneType::Dma)).unwrap().watermarks();
        assert_eq!(dma.min, 256 * 256 / 3328);
        let normal = dir.zone(id(1, ZoneType::Normal)).unwrap().watermarks();
        assert_eq!(normal.min, 256 * 1024 / 3328);
        assert_eq!(normal.low, normal.min + normal.min / 4);
        assert_eq!(normal.high, normal.min + normal.min / 2);
        let high = dir.zone(id(0, ZoneType::HighMem)).unwrap().watermarks();
        assert_eq!(high.min, 32);

        let config = MemoryConfig {
            min_free_kbytes: 0,
            ..MemoryConfig::default()
        };
        let dir = NodeDirectory::new(&three_nodes(), &config);
        assert!(dir.zones().all(|zone| zone.watermarks().min == 0));
    }
}
