//! Access to the flash device and the addressing types used on top of it.
//!
//! Addresses handed around the recorder are [`PageIndex`] values inside a [`PageArena`], never
//! raw offsets, so an out-of-arena write can't be expressed without going through
//! [`PageArena::contains`].

pub mod sim;

use std::sync::Arc;

use novafc_data_format::{is_erased, PAGE_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::FlashLayout;
use crate::error::FlashError;

pub use sim::SimFlash;

const PAGE_BYTES: u32 = PAGE_SIZE as u32;

/// A NOR flash device.
///
/// `program` may only clear bits. Returning to `0xFF` needs `erase_sector`.
pub trait Flash: Send {
    /// Total addressable bytes
    fn capacity(&self) -> u32;

    /// Size of the smallest erasable unit
    fn sector_size(&self) -> u32;

    /// Some devices can only program whole, page-aligned pages
    fn requires_full_page_program(&self) -> bool {
        false
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erases the sector starting at `address`, which must be sector aligned
    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError>;

    /// Returns true if all `len` bytes at `address` read as erased
    fn is_erased(&mut self, address: u32, len: usize) -> Result<bool, FlashError> {
        let mut chunk = [0u8; PAGE_SIZE];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(PAGE_SIZE);
            self.read(address + offset as u32, &mut chunk[..n])?;
            if !is_erased(&chunk[..n]) {
                return Ok(false);
            }
            offset += n;
        }
        Ok(true)
    }
}

/// The flash device, shared between the logging task and the config store.
///
/// Anything that needs both the store and the flash must lock the store first.
pub type SharedFlash<F> = Arc<Mutex<F>>;

pub fn shared<F: Flash>(flash: F) -> SharedFlash<F> {
    Arc::new(Mutex::new(flash))
}

/// Index of a page on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageIndex(u32);

impl PageIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn address(self) -> u32 {
        self.0 * PAGE_BYTES
    }

    /// Returns `None` if `address` is not page aligned
    pub const fn from_address(address: u32) -> Option<Self> {
        if address % PAGE_BYTES == 0 {
            Some(Self(address / PAGE_BYTES))
        } else {
            None
        }
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(index) => Some(Self(index)),
            None => None,
        }
    }
}

/// A contiguous run of pages owned by one user, the log in practice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageArena {
    start: PageIndex,
    pages: u32,
}

impl PageArena {
    pub const fn new(start: PageIndex, pages: u32) -> Self {
        Self { start, pages }
    }

    /// The log region of `layout`
    pub const fn log(layout: &FlashLayout) -> Self {
        Self::new(PageIndex::new(0), layout.log_pages)
    }

    pub const fn start(&self) -> PageIndex {
        self.start
    }

    /// One past the last page
    pub const fn end(&self) -> PageIndex {
        PageIndex::new(self.start.get() + self.pages)
    }

    pub const fn len(&self) -> u32 {
        self.pages
    }

    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub const fn contains(&self, page: PageIndex) -> bool {
        page.get() >= self.start.get() && page.get() < self.end().get()
    }

    pub const fn start_address(&self) -> u32 {
        self.start.address()
    }

    pub const fn end_address(&self) -> u32 {
        self.end().address()
    }

    /// Pages from `from` to the end of the arena
    pub fn pages_from(&self, from: PageIndex) -> impl Iterator<Item = PageIndex> {
        let first = from.get().max(self.start.get());
        (first..self.end().get()).map(PageIndex::new)
    }
}

/// The next page of an arena that may be written.
///
/// Only moves forward, one page per successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCursor {
    arena: PageArena,
    next: PageIndex,
}

impl WriteCursor {
    /// A cursor at the start of `arena`
    pub const fn new(arena: PageArena) -> Self {
        Self {
            arena,
            next: arena.start(),
        }
    }

    /// A cursor at `page`, which may be one past the end of the arena for a full log
    pub fn at(arena: PageArena, page: PageIndex) -> Option<Self> {
        if arena.contains(page) || page == arena.end() {
            Some(Self { arena, next: page })
        } else {
            None
        }
    }

    pub const fn arena(&self) -> PageArena {
        self.arena
    }

    pub const fn page(&self) -> PageIndex {
        self.next
    }

    pub const fn address(&self) -> u32 {
        self.next.address()
    }

    pub const fn is_full(&self) -> bool {
        self.next.get() >= self.arena.end().get()
    }

    pub const fn pages_written(&self) -> u32 {
        self.next.get() - self.arena.start().get()
    }

    /// Returns false, without moving, if the arena is already full
    pub fn advance(&mut self) -> bool {
        if self.is_full() {
            return false;
        }
        self.next = self.next.next();
        true
    }
}
