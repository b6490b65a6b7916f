//! 编译期确定的配置项

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 扇区大小的 bit 数，块设备以 512 字节的扇区寻址
pub const SECTOR_SIZE_BITS: usize = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SIZE_BITS;

/// 伙伴系统的阶数上限，合法的阶为 `0..MAX_ORDER`，最大的块为 `1 << (MAX_ORDER - 1)` 页
pub const MAX_ORDER: usize = 11;

/// 每个节点最多的 zone 数（DMA、NORMAL、HIGHMEM）
pub const MAX_NR_ZONES: usize = 3;
/// 最多支持的 NUMA 节点数
pub const MAX_NUMNODES: usize = 8;
/// 最多支持的 CPU 数，决定了每个 zone 中 per-cpu 页缓存的数量
pub const MAX_CPUS: usize = 8;

/// 本地节点的 NUMA 距离
pub const LOCAL_DISTANCE: u8 = 10;
/// 远端节点的默认 NUMA 距离
pub const REMOTE_DISTANCE: u8 = 20;

/// per-cpu 页缓存每次从伙伴系统批量搬运的页数的默认值
pub const PCP_DEFAULT_BATCH: usize = 16;

/// 启动时按此值划分各 zone 的 `pages_min`
pub const DEFAULT_MIN_FREE_KBYTES: usize = 1024;

/// 直接 I/O 一次最多钉住的用户页数
pub const DIO_PAGES: usize = 64;
/// 直接 I/O 每提交这么多个批次，就顺手回收一次已完成的批次
pub const DIO_REAP_INTERVAL: usize = 64;
