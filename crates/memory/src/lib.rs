//! 分区的伙伴系统物理页分配器，以及钉住用户页的服务
//!
//! - [`FrameTable`]：每个物理页帧的元数据，原子引用计数与标志位
//! - [`Zone`]：伙伴系统空闲链表、水位线与 per-cpu 冷热页缓存
//! - [`NodeDirectory`]：NUMA 节点、zone 遍历与 zonelist
//! - [`MemorySystem`]：以上全部的上下文对象，分配与释放的入口
//! - [`UserSpace::pin_pages`]：为 I/O 钉住用户页
#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate kernel_tracer;

mod address;
mod buddy;
mod frame;
mod layout;
mod node;
mod pcp;
mod pin;
mod system;
mod user_space;
mod zone;

pub use self::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use self::frame::{FrameTable, PageFlags, PageFrame, PageMapping, PageRef, PageRun};
pub use self::layout::{MemoryConfig, MemoryLayout, NodeLayout, ZoneSpan};
pub use self::node::{Node, NodeDirectory, NodeStat, Zonelist};
pub use self::pin::{PinStats, PinnedPage};
pub use self::system::{MemInfo, MemorySystem, NoReclaim, Reclaimer};
pub use self::user_space::{AnonFaultHandler, FaultHandler, MapPermission, UserSpace, VmArea};
pub use self::zone::{
    AllocFlags, FreeAreaReport, Watermarks, Zone, ZoneId, ZoneStat, ZoneType,
};
