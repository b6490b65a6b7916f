//! 逻辑块到设备块的映射，由文件系统提供

use bitflags::bitflags;
use defines::error::KResult;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// 映射到了设备块。没有该标志的映射是空洞
        const MAPPED = 1 << 0;
        /// 该块刚刚分配，设备上可能还有它旧身份的缓存
        const NEW = 1 << 1;
        /// 下一个逻辑块不要与这一块合并到同一个批次，即使设备块号相邻
        const BOUNDARY = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockMapping {
    block: u64,
    flags: MapFlags,
}

impl BlockMapping {
    pub fn mapped(block: u64) -> Self {
        Self {
            block,
            flags: MapFlags::MAPPED,
        }
    }

    pub fn hole() -> Self {
        Self {
            block: 0,
            flags: MapFlags::empty(),
        }
    }

    /// 标记为新分配的块
    pub fn new_block(mut self) -> Self {
        self.flags |= MapFlags::NEW;
        self
    }

    /// 在这一块之后断开批次
    pub fn boundary(mut self) -> Self {
        self.flags |= MapFlags::BOUNDARY;
        self
    }

    /// 设备块号。空洞返回 `None`
    pub fn block(&self) -> Option<u64> {
        self.flags.contains(MapFlags::MAPPED).then_some(self.block)
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn is_new(&self) -> bool {
        self.flags.contains(MapFlags::NEW)
    }

    pub fn is_boundary(&self) -> bool {
        self.flags.contains(MapFlags::BOUNDARY)
    }
}

/// 文件的块映射，即 `get_block`。
///
/// `create` 为真时表示这是一次写入，映射者可以为空洞分配新块并打上 [`MapFlags::NEW`]
pub trait BlockMapper {
    fn get_block(&self, block: u64, create: bool) -> KResult<BlockMapping>;
}

impl<F> BlockMapper for F
where
    F: Fn(u64, bool) -> KResult<BlockMapping>,
{
    fn get_block(&self, block: u64, create: bool) -> KResult<BlockMapping> {
        self(block, create)
    }
}
