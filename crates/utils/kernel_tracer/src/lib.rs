//! 带 span 的日志设施
//!
//! 日志等级在编译期由 `KERNEL_CLOG` 决定，低于该等级的 `log!` 与 `span!` 展开后不做任何事。
//! 日志真正写到哪里由安装的 [`Tracer`] 决定；开启 `std` feature 后可以用 [`init_std`]
//! 把日志写到 stderr，供宿主机上的测试使用。
#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

#[macro_use]
mod macros;
mod level;
mod record;
mod span;
#[cfg(any(test, feature = "std"))]
mod stdio;

pub use level::{Level, LevelFilter, CLOG};
pub use record::Record;
pub use span::{
    instrument::Instrument, loggable::Loggable, OwnedEnterGuard, Span, SpanAttr, SpanId,
};
#[cfg(any(test, feature = "std"))]
pub use stdio::{init_std, StdTracer};

use core::fmt::{self, Write};

use anstyle::{AnsiColor, Reset, Style};
use spin::Once;

/// 日志与 span 的实际处理者
pub trait Tracer: Sync {
    fn log(&self, record: &Record<'_>);
    fn new_span(&self, attr: SpanAttr) -> SpanId;
    fn enter(&self, id: &SpanId);
    fn exit(&self, id: &SpanId);
    fn drop_span(&self, id: SpanId);
}

pub static KERNEL_TRACER: Once<&'static dyn Tracer> = Once::new();

/// 安装全局的 [`Tracer`]，只有第一次调用生效
pub fn set_tracer(tracer: &'static dyn Tracer) {
    KERNEL_TRACER.call_once(|| tracer);
}

#[inline]
fn tracer() -> Option<&'static dyn Tracer> {
    KERNEL_TRACER.get().copied()
}

#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, module: &'static str, args: fmt::Arguments<'_>) {
    if let Some(tracer) = tracer() {
        tracer.log(&Record::new(level, module, args));
    }
}

/// 按统一格式输出一条日志，如 `[ INFO]-alloc_pages{order=3}: message`
///
/// `spans` 是当前上下文中由外到内的 span，等级低于 `span_level` 的不输出
pub fn write_log<'a>(
    writer: &mut impl Write,
    record: &Record<'_>,
    spans: impl IntoIterator<Item = &'a SpanAttr>,
    span_level: LevelFilter,
) -> fmt::Result {
    // 开头部分，即日志级别，如 `[ INFO]`
    let color = match record.level() {
        Level::Error => AnsiColor::Red,
        Level::Warn => AnsiColor::BrightYellow,
        Level::Info => AnsiColor::Blue,
        Level::Debug => AnsiColor::Green,
        Level::Trace => AnsiColor::BrightBlack,
    };
    write!(
        writer,
        "{}[{:>5}]{}",
        color.render_fg(),
        record.level(),
        Reset.render()
    )?;

    // Span 栈部分
    const SPAN_NAME_COLOR: Style = AnsiColor::White.on_default().bold();
    let mut has_span = false;
    for span in spans {
        if span.level() > span_level {
            continue;
        }
        has_span = true;
        write!(
            writer,
            "-{}{}{}",
            SPAN_NAME_COLOR.render(),
            span.name(),
            Reset.render()
        )?;
        if let Some(kvs) = span.kvs() {
            write!(writer, "{{{kvs}}}")?;
        }
    }
    if has_span {
        write!(writer, ": ")?;
    } else {
        write!(writer, " ")?;
    }

    // 日志信息部分
    writeln!(writer, "{}", record.args())
}
