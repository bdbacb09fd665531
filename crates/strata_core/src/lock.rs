//! Per-page reader/writer locks.
//!
//! Locks are logical: they guard the right to read or change a page, not the
//! in-memory copy itself. Each page has a FIFO queue shared by both modes, so
//! a waiting writer is never starved by a stream of readers. A request is
//! granted once it reaches the head of its queue and is compatible with the
//! current holders; consecutive readers at the head are granted together.
//!
//! Locks are not reentrant and cannot be upgraded. A holder that needs
//! exclusive access releases and re-acquires, then revalidates by key.

use crate::types::Address;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of readers.
    Shared,
    /// A single writer.
    Exclusive,
}

#[derive(Debug, Default)]
struct PageLock {
    readers: usize,
    writer: bool,
    queue: VecDeque<(u64, LockMode)>,
}

impl PageLock {
    fn is_held(&self) -> bool {
        self.readers > 0 || self.writer
    }

    fn is_idle(&self) -> bool {
        !self.is_held() && self.queue.is_empty()
    }

    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.is_held(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    pages: HashMap<Address, PageLock>,
    next_ticket: u64,
}

/// The lock table of one tree.
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<State>,
    released: Condvar,
}

impl LockTable {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `address` is locked in `mode`.
    pub fn acquire(&self, address: Address, mode: LockMode) -> PageGuard<'_> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state
            .pages
            .entry(address)
            .or_default()
            .queue
            .push_back((ticket, mode));

        loop {
            let lock = state.pages.entry(address).or_default();
            let at_head = lock.queue.front().is_some_and(|&(t, _)| t == ticket);
            if at_head && lock.admits(mode) {
                lock.queue.pop_front();
                match mode {
                    LockMode::Shared => lock.readers += 1,
                    LockMode::Exclusive => lock.writer = true,
                }
                let wake = mode == LockMode::Shared && !lock.queue.is_empty();
                trace!(%address, ?mode, ticket, "granted page lock");
                drop(state);
                if wake {
                    // the next shared request may now be at the head
                    self.released.notify_all();
                }
                return PageGuard {
                    table: self,
                    address,
                    mode,
                };
            }
            self.released.wait(&mut state);
        }
    }

    fn release(&self, address: Address, mode: LockMode) {
        let mut state = self.state.lock();
        if let Some(lock) = state.pages.get_mut(&address) {
            match mode {
                LockMode::Shared => lock.readers = lock.readers.saturating_sub(1),
                LockMode::Exclusive => lock.writer = false,
            }
            if lock.is_idle() {
                state.pages.remove(&address);
            }
        }
        trace!(%address, ?mode, "released page lock");
        drop(state);
        self.released.notify_all();
    }

    /// Returns `true` if any cursor holds `address`.
    #[must_use]
    pub fn is_held(&self, address: Address) -> bool {
        self.state
            .lock()
            .pages
            .get(&address)
            .is_some_and(PageLock::is_held)
    }

    /// Runs `f` with the table frozen, so no lock is granted meanwhile.
    pub fn with_held<R>(&self, f: impl FnOnce(&dyn Fn(Address) -> bool) -> R) -> R {
        let state = self.state.lock();
        let held = |address: Address| state.pages.get(&address).is_some_and(PageLock::is_held);
        f(&held)
    }
}

/// A granted page lock, released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PageGuard<'a> {
    table: &'a LockTable,
    address: Address,
    mode: LockMode,
}

impl PageGuard<'_> {
    /// The locked page.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The mode it is held in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.address, self.mode);
    }
}
