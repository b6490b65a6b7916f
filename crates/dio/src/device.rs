//! 直接 I/O 所面对的块设备

use crate::batch::IoBatch;

/// 异步块设备。
///
/// [`BlockDevice::submit`] 立即返回；设备在 I/O 结束后对批次调用 [`IoBatch::complete`]，
/// 这可能发生在任意线程或中断上下文中，顺序也不必与提交顺序一致
pub trait BlockDevice: Send + Sync {
    /// 逻辑块大小，是 512 到页大小之间的 2 的幂
    fn logical_block_size(&self) -> usize;

    /// 一个批次最多容纳的片段数
    fn max_segments(&self) -> usize;

    /// 一个批次最多传输的字节数
    fn max_transfer_bytes(&self) -> usize;

    fn submit(&self, batch: IoBatch);

    /// 设备块刚被重新分配，丢弃它在元数据缓存中的旧别名
    fn invalidate_alias(&self, _block: u64) {}
}
