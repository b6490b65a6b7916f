//! 完成队列：生产者可能位于中断上下文，只有一个消费者会睡眠等待
//!
//! 生产者一侧只做入队和唤醒，不会阻塞；队列由关中断的自旋锁保护，
//! 因此同一个核上的中断处理程序不会与持锁的进程上下文死锁。

use alloc::collections::VecDeque;
use core::mem;

use event_listener::{listener, Event};

use crate::SpinNoIrqMutex;

pub struct CompletionQueue<T> {
    queue: SpinNoIrqMutex<VecDeque<T>>,
    ready: Event,
}

impl<T> CompletionQueue<T> {
    pub const fn new() -> Self {
        Self {
            queue: SpinNoIrqMutex::new(VecDeque::new()),
            ready: Event::new(),
        }
    }

    /// 入队并唤醒一个等待者。可以在中断上下文调用
    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
        self.ready.notify(1);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// 一次性取走当前已经入队的所有元素，不等待
    pub fn take_all(&self) -> VecDeque<T> {
        mem::take(&mut *self.queue.lock())
    }

    /// 等待直到队列中有元素
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            listener!(self.ready => listener);
            // 建立监听前可能已经有元素入队了，因此要再检查一次
            if let Some(item) = self.try_pop() {
                return item;
            }
            listener.await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
