use core::fmt::Arguments;

use crate::Level;

/// 一条日志记录，只在 `log!` 展开处短暂存在
#[derive(Clone, Debug)]
pub struct Record<'a> {
    level: Level,
    module: &'static str,
    args: Arguments<'a>,
}

impl<'a> Record<'a> {
    #[inline]
    pub fn new(level: Level, module: &'static str, args: Arguments<'a>) -> Self {
        Self {
            level,
            module,
            args,
        }
    }

    /// 消息内容
    #[inline]
    pub fn args(&self) -> &Arguments<'a> {
        &self.args
    }

    /// 消息的日志等级
    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    /// 产生该日志的模块路径，如 `memory::buddy`
    #[inline]
    pub fn module(&self) -> &'static str {
        self.module
    }
}
