//! Events recorded by interrupt handlers and consumed by the scheduler.
//!
//! Handlers never touch the process table. They push an `Event` and return;
//! the scheduler drains the queue at a safe point after the handler.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;

use crate::{constants::events::MAX_EVENTS, processes::Pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// One timer interrupt.
    Tick,
    /// A blocked process's wait is satisfied.
    Wake(Pid),
}

pub struct InterruptEvents {
    queue: ArrayQueue<Event>,
    /// Ticks that did not fit in the queue; replayed on the next drain.
    overflow_ticks: AtomicU32,
    ticks: AtomicU64,
}

lazy_static! {
    pub static ref INTERRUPT_EVENTS: InterruptEvents = InterruptEvents::new(MAX_EVENTS);
}

impl InterruptEvents {
    pub fn new(capacity: usize) -> Self {
        InterruptEvents {
            queue: ArrayQueue::new(capacity),
            overflow_ticks: AtomicU32::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    /// Called from the timer handler.
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if self.queue.push(Event::Tick).is_err() {
            self.overflow_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queues a wake-up. Returns false if the queue is full and the wake-up
    /// was lost.
    pub fn post_wake(&self, pid: Pid) -> bool {
        let posted = self.queue.push(Event::Wake(pid)).is_ok();
        if !posted {
            log::warn!("event queue full, wake-up for pid {} dropped", pid);
        }
        posted
    }

    /// Hands every pending event to `handle`, oldest first. Overflowed
    /// ticks come last.
    pub fn drain<F: FnMut(Event)>(&self, mut handle: F) {
        while let Some(event) = self.queue.pop() {
            handle(event);
        }
        for _ in 0..self.overflow_ticks.swap(0, Ordering::Relaxed) {
            handle(Event::Tick);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len() + self.overflow_ticks.load(Ordering::Relaxed) as usize
    }

    /// Timer interrupts since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
