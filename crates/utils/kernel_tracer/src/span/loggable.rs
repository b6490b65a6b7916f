use alloc::{string::String, vec::Vec};

use compact_str::CompactString;

/// 可用于 span 宏键值对中值的类型
pub trait Loggable {
    fn log(&self, writer: &mut CompactString);
}

// 要经过这个转一道。
// 无法 impl<T: Display> Loggable for T 后再去给其他上游类型 impl Loggable 因为上游随时可能为该类型实现 Display，导致冲突
trait SpecDisplay: core::fmt::Display {}

macro_rules! mydisplay_impl {
    ($($t:tt)*) => ($(
        impl SpecDisplay for $t {}
    )*);
}

mydisplay_impl!(u8 u16 u32 u64 usize i8 i16 i32 i64 isize bool str char String CompactString);

impl<T: SpecDisplay + ?Sized> Loggable for T {
    fn log(&self, writer: &mut CompactString) {
        let _ = core::fmt::write(writer, format_args!("{self}"));
    }
}

impl<T: SpecDisplay + ?Sized> SpecDisplay for &T {}

impl<T: SpecDisplay> Loggable for [T] {
    fn log(&self, writer: &mut CompactString) {
        writer.push('[');
        for (i, t) in self.iter().enumerate() {
            if i > 0 {
                writer.push_str(", ");
            }
            let _ = core::fmt::write(writer, format_args!("{t}"));
        }
        writer.push(']');
    }
}

impl<T: SpecDisplay> Loggable for Vec<T> {
    fn log(&self, writer: &mut CompactString) {
        self.as_slice().log(writer);
    }
}

impl<T: Loggable> Loggable for Option<T> {
    fn log(&self, writer: &mut CompactString) {
        match self {
            Some(t) => t.log(writer),
            None => writer.push_str("None"),
        }
    }
}
