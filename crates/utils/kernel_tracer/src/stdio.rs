//! 宿主机上的 [`Tracer`] 实现，日志写到 stderr
//!
//! 每个线程有自己的 span 栈，所以并发的测试线程之间互不干扰。

use std::{cell::RefCell, io::Write as _, string::String, vec::Vec};

use slab::Slab;
use spin::mutex::SpinMutex;

use crate::{set_tracer, write_log, Record, SpanAttr, SpanId, Tracer, CLOG};

std::thread_local! {
    static SPAN_STACK: RefCell<Vec<SpanId>> = const { RefCell::new(Vec::new()) };
}

pub struct StdTracer {
    slab: SpinMutex<Slab<SpanAttr>>,
}

impl StdTracer {
    pub const fn new() -> Self {
        Self {
            slab: SpinMutex::new(Slab::new()),
        }
    }

    /// 当前线程所处的 span 名，由外到内
    pub fn current_spans(&self) -> Vec<&'static str> {
        let slab = self.slab.lock();
        SPAN_STACK.with_borrow(|stack| {
            stack
                .iter()
                .filter_map(|id| slab.get(id.as_slab_index()))
                .map(SpanAttr::name)
                .collect()
        })
    }
}

impl Default for StdTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for StdTracer {
    fn log(&self, record: &Record<'_>) {
        let mut line = String::new();
        {
            let slab = self.slab.lock();
            SPAN_STACK.with_borrow(|stack| {
                let spans = stack.iter().filter_map(|id| slab.get(id.as_slab_index()));
                // 写入 String 不会失败
                let _ = write_log(&mut line, record, spans, CLOG);
            });
        }
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    fn new_span(&self, attr: SpanAttr) -> SpanId {
        SpanId::from_slab_index(self.slab.lock().insert(attr))
    }

    fn enter(&self, id: &SpanId) {
        SPAN_STACK.with_borrow_mut(|stack| stack.push(id.clone()));
    }

    fn exit(&self, id: &SpanId) {
        let _span_id = SPAN_STACK.with_borrow_mut(Vec::pop);
        // 维持一个栈结构，因此退出的 id 应当与进入的 id 保持一致
        debug_assert_eq!(_span_id.as_ref(), Some(id));
    }

    fn drop_span(&self, id: SpanId) {
        self.slab.lock().try_remove(id.as_slab_index());
    }
}

static STD_TRACER: StdTracer = StdTracer::new();

/// 安装 [`StdTracer`]，可以重复调用
pub fn init_std() -> &'static StdTracer {
    set_tracer(&STD_TRACER);
    &STD_TRACER
}
