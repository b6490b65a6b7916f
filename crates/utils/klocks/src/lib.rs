#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod irq;
mod kspin;
mod queue;

pub use irq::{set_irq_control, IrqControl, NoIrqGuard};
pub use kspin::{SpinMutex, SpinMutexGuard, SpinNoIrqMutex, SpinNoIrqMutexGuard};
pub use queue::CompletionQueue;
pub use spin::{Lazy, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
