//! 关中断的守卫
//!
//! 具体如何开关中断由体系结构相关的代码通过 [`set_irq_control`] 注册。
//! 没有注册时（例如在宿主机上跑测试）守卫什么都不做。

use core::marker::PhantomData;

use spin::Once;

pub trait IrqControl: Sync {
    /// 关闭本核的中断，返回关闭之前中断是否开启
    fn disable(&self) -> bool;
    /// 打开本核的中断
    fn enable(&self);
}

static IRQ_CONTROL: Once<&'static dyn IrqControl> = Once::new();

/// 注册开关中断的实现，只有第一次注册生效
pub fn set_irq_control(control: &'static dyn IrqControl) {
    IRQ_CONTROL.call_once(|| control);
}

pub struct NoIrqGuard {
    before: bool,
    // 不允许 Guard 越过 .await
    _not_send: PhantomData<*const ()>,
}

impl NoIrqGuard {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let before = IRQ_CONTROL.get().is_some_and(|control| control.disable());
        Self {
            before,
            _not_send: PhantomData,
        }
    }
}

impl Drop for NoIrqGuard {
    fn drop(&mut self) {
        if self.before {
            if let Some(control) = IRQ_CONTROL.get() {
                control.enable();
            }
        }
    }
}
