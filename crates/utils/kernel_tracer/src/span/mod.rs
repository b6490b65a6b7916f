pub mod instrument;

pub mod loggable;

use core::{
    fmt::{Debug, Write},
    marker::PhantomData,
    num::NonZeroU32,
};

use compact_str::CompactString;

use crate::{tracer, Level};

use self::loggable::Loggable;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpanId(NonZeroU32);

impl SpanId {
    /// 由 slab 下标构造，下标从 0 开始
    pub fn from_slab_index(index: usize) -> Self {
        let raw = u32::try_from(index + 1).unwrap_or(u32::MAX);
        // `index + 1` 至少为 1
        Self(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
    }

    pub fn as_slab_index(&self) -> usize {
        self.0.get() as usize - 1
    }
}

pub struct Span {
    id: Option<SpanId>,
}

impl Span {
    /// 创建一个新的 span。但只是将其注册，而没有实际实际启用。
    ///
    /// 调用 `entered()` 以进入该 span。没有安装 [`Tracer`](crate::Tracer) 时得到的是一个空的 span
    pub fn new<'a>(
        level: Level,
        name: &'static str,
        kvs: Option<&'a [(&'static str, &'a dyn Loggable)]>,
    ) -> Self {
        let Some(tracer) = tracer() else {
            return Self::disabled();
        };
        let kvs = kvs.filter(|kvs| !kvs.is_empty()).map(|kvs| {
            let mut kvs_str = CompactString::new("");
            for (i, (key, value)) in kvs.iter().enumerate() {
                if i > 0 {
                    kvs_str.push(' ');
                }
                // 写入 CompactString 不会失败
                let _ = write!(kvs_str, "{key}=");
                value.log(&mut kvs_str);
            }
            kvs_str
        });

        let id = tracer.new_span(SpanAttr::new(level, name, kvs));
        Span { id: Some(id) }
    }

    pub fn disabled() -> Self {
        Self { id: None }
    }

    pub fn is_disabled(&self) -> bool {
        self.id.is_none()
    }

    pub(crate) fn enter(&self) -> RefEnterGuard<'_> {
        if let (Some(id), Some(tracer)) = (&self.id, tracer()) {
            tracer.enter(id);
        }
        RefEnterGuard {
            span: self,
            _not_send: PhantomData,
        }
    }

    pub fn entered(self) -> OwnedEnterGuard {
        if let (Some(id), Some(tracer)) = (&self.id, tracer()) {
            tracer.enter(id);
        }
        OwnedEnterGuard {
            span: self,
            _not_send: PhantomData,
        }
    }
}

impl Drop for Span {
    #[inline]
    fn drop(&mut self) {
        if let (Some(id), Some(tracer)) = (self.id.take(), tracer()) {
            tracer.drop_span(id);
        }
    }
}

#[must_use = "once a span has been entered, it should be exited"]
pub struct RefEnterGuard<'a> {
    span: &'a Span,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RefEnterGuard<'_> {
    fn drop(&mut self) {
        if let (Some(id), Some(tracer)) = (&self.span.id, tracer()) {
            tracer.exit(id);
        }
    }
}

#[must_use = "once a span has been entered, it should be exited"]
pub struct OwnedEnterGuard {
    span: Span,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OwnedEnterGuard {
    fn drop(&mut self) {
        if let (Some(id), Some(tracer)) = (&self.span.id, tracer()) {
            tracer.exit(id);
        }
    }
}

/// 注册到 [`Tracer`](crate::Tracer) 中的 span 信息
#[derive(Debug)]
pub struct SpanAttr {
    name: &'static str,
    level: Level,
    kvs: Option<CompactString>,
}

impl SpanAttr {
    pub fn new(level: Level, name: &'static str, kvs: Option<CompactString>) -> Self {
        Self { name, level, kvs }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kvs(&self) -> Option<&str> {
        self.kvs.as_deref()
    }
}
