//! 回收完成的批次
//!
//! 组装过程中每开启若干个新批次就顺手处理一次已完成的批次，不等待；
//! 组装结束后再等所有在途批次完成。

use crate::{batch::IoBatch, request::DioRequest};

impl DioRequest<'_> {
    /// 每开启 `reap_interval` 个新批次，处理一次此刻已经完成的批次
    pub(crate) fn reap_if_due(&mut self) {
        self.reap_counter += 1;
        if self.reap_counter < self.config.reap_interval {
            return;
        }
        self.reap_counter = 0;
        let done = self.completions.take_all();
        if done.is_empty() {
            return;
        }
        self.stats.reap_passes += 1;
        trace!("reaping {} completed batches", done.len());
        for batch in done {
            self.complete_batch(batch);
        }
    }

    fn complete_batch(&mut self, batch: IoBatch) {
        let offset = batch.request_offset();
        let size = batch.size();
        let status = batch.release(self.mm);
        self.in_flight -= 1;
        self.stats.batches_reaped += 1;
        match status {
            Ok(()) => trace!("batch at offset {offset} ({size} bytes) completed"),
            Err(err) => {
                warn!("direct I/O batch at offset {offset} ({size} bytes) failed: {err:?}");
                if !matches!(self.failed, Some((first, _)) if first <= offset) {
                    self.failed = Some((offset, err));
                }
            }
        }
    }

    /// 等待所有在途批次完成。
    ///
    /// 这里不可被信号打断：已经提交的批次持有页引用，必须全部回收后才能返回
    pub(crate) async fn await_completion(&mut self) {
        while self.in_flight > 0 {
            let batch = self.completions.pop().await;
            self.complete_batch(batch);
        }
    }
}
