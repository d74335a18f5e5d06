//! Per-connection arena allocator.
//!
//! Each worker owns a [`PagePool`] of 64 KiB pages. A connection borrows at
//! most two pages from it (one for header/read buffers, one for body
//! staging) through its [`ConnArena`]. Pages are split into 16 slots of
//! 4 KiB tracked by a free bitset; a [`Span`] is a contiguous run of slots.
//!
//! Allocation fails closed with [`Error::ArenaExhausted`] once the
//! connection's byte budget is spent or its page has no contiguous run
//! left. Spans are move-only and released by value, so a span cannot be
//! freed twice.

use core::ops::Range;

use crate::error::Error;

pub const PAGE_SIZE: usize = 64 * 1024;
pub const SLOTS_PER_PAGE: usize = 16;
pub const SLOT_SIZE: usize = PAGE_SIZE / SLOTS_PER_PAGE;

/// Default per-connection allocation budget.
pub const DEFAULT_BUDGET: usize = 32 * 1024;

const ALL_FREE: u16 = u16::MAX;

/// A fixed 64 KiB region with a 16-slot free bitset (bit set = slot free).
pub struct Page {
    data: Box<[u8]>,
    free: u16,
}

impl Page {
    fn new() -> Self {
        Self { data: vec![0u8; PAGE_SIZE].into_boxed_slice(), free: ALL_FREE }
    }

    pub fn free_slots(&self) -> u32 {
        self.free.count_ones()
    }

    /// First-fit search for `n` contiguous free slots.
    fn find_run(&self, n: usize) -> Option<usize> {
        if n == 0 || n > SLOTS_PER_PAGE {
            return None;
        }
        let mask = run_mask(0, n);
        (0..=SLOTS_PER_PAGE - n).find(|&first| self.free & (mask << first) == mask << first)
    }

    fn mark_used(&mut self, first: usize, n: usize) {
        self.free &= !run_mask(first, n);
    }

    fn mark_free(&mut self, first: usize, n: usize) {
        self.free |= run_mask(first, n);
    }

    fn is_free(&self, first: usize, n: usize) -> bool {
        first + n <= SLOTS_PER_PAGE && self.free & run_mask(first, n) == run_mask(first, n)
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page").field("free", &format_args!("{:016b}", self.free)).finish()
    }
}

const fn run_mask(first: usize, n: usize) -> u16 {
    if n >= SLOTS_PER_PAGE {
        ALL_FREE
    } else {
        (((1u32 << n) - 1) << first) as u16
    }
}

/// Worker-local pool of arena pages.
#[derive(Debug)]
pub struct PagePool {
    free: Vec<Page>,
    max_pages: usize,
    outstanding: usize,
}

impl PagePool {
    /// A pool that never hands out more than `max_pages` pages at once.
    pub fn new(max_pages: usize) -> Self {
        Self { free: Vec::new(), max_pages, outstanding: 0 }
    }

    /// Take a page, allocating lazily up to the pool limit.
    pub fn take(&mut self) -> Option<Page> {
        if let Some(mut page) = self.free.pop() {
            page.free = ALL_FREE;
            self.outstanding += 1;
            return Some(page);
        }
        if self.outstanding >= self.max_pages {
            return None;
        }
        self.outstanding += 1;
        Some(Page::new())
    }

    /// Return a page to the pool.
    pub fn give(&mut self, page: Page) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(page);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Which of the connection's two pages a span lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Read buffers and parsed header offsets.
    Header = 0,
    /// Dynamic response bodies and buffered request bodies.
    Body = 1,
}

/// A contiguous allocation inside a connection arena.
///
/// Deliberately not `Clone`: [`ConnArena::release`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Span {
    kind: PageKind,
    first: u8,
    slots: u8,
    len: u32,
}

impl Span {
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Bytes in use.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes reserved (whole slots).
    pub fn capacity(&self) -> usize {
        self.slots as usize * SLOT_SIZE
    }

    fn offset(&self) -> usize {
        self.first as usize * SLOT_SIZE
    }
}

/// A connection's view of the arena: at most two pages and a byte budget.
#[derive(Debug)]
pub struct ConnArena {
    pages: [Option<Page>; 2],
    budget: usize,
    used: usize,
}

impl ConnArena {
    pub fn new(budget: usize) -> Self {
        Self { pages: [None, None], budget: budget.min(2 * PAGE_SIZE), used: 0 }
    }

    /// Reserve `len` bytes (rounded up to whole slots) in the `kind` page.
    pub fn alloc(&mut self, pool: &mut PagePool, kind: PageKind, len: usize) -> Result<Span, Error> {
        let slots = len.max(1).div_ceil(SLOT_SIZE);
        let bytes = slots * SLOT_SIZE;
        if self.used + bytes > self.budget {
            return Err(Error::ArenaExhausted);
        }
        let page = self.page_for(pool, kind)?;
        let first = page.find_run(slots).ok_or(Error::ArenaExhausted)?;
        page.mark_used(first, slots);
        self.used += bytes;
        Ok(Span { kind, first: first as u8, slots: slots as u8, len: len as u32 })
    }

    /// Grow `span` to `new_len` bytes, keeping its contents.
    ///
    /// Extends in place when the following slots are free, otherwise moves
    /// the contents to a new run within the same page.
    pub fn grow(&mut self, span: &mut Span, new_len: usize) -> Result<(), Error> {
        if new_len <= span.capacity() {
            span.len = new_len as u32;
            return Ok(());
        }
        let want = new_len.div_ceil(SLOT_SIZE);
        let extra = want - span.slots as usize;
        if self.used + extra * SLOT_SIZE > self.budget {
            return Err(Error::ArenaExhausted);
        }
        let page = self.pages[span.kind as usize].as_mut().ok_or(Error::InvalidState)?;
        let tail = span.first as usize + span.slots as usize;
        if page.is_free(tail, extra) {
            page.mark_used(tail, extra);
        } else {
            // Free the old run first so the search may overlap it.
            page.mark_free(span.first as usize, span.slots as usize);
            let Some(first) = page.find_run(want) else {
                page.mark_used(span.first as usize, span.slots as usize);
                return Err(Error::ArenaExhausted);
            };
            page.mark_used(first, want);
            let src = span.offset();
            page.data.copy_within(src..src + span.len as usize, first * SLOT_SIZE);
            span.first = first as u8;
        }
        self.used += extra * SLOT_SIZE;
        span.slots = want as u8;
        span.len = new_len as u32;
        Ok(())
    }

    /// Append `src[range]` to the end of `dst`, growing it. The spans must
    /// live in different pages; this is how parsed body bytes move from the
    /// read buffer into body staging without an intermediate copy.
    pub fn append(&mut self, dst: &mut Span, src: &Span, range: Range<usize>) -> Result<(), Error> {
        if dst.kind == src.kind || range.start > range.end || range.end > src.len() {
            return Err(Error::InvalidState);
        }
        let at = dst.len();
        self.grow(dst, at + range.len())?;
        let [header, body] = &mut self.pages;
        let (from, to) = match src.kind {
            PageKind::Header => (header, body),
            PageKind::Body => (body, header),
        };
        let (Some(from), Some(to)) = (from.as_ref(), to.as_mut()) else {
            return Err(Error::InvalidState);
        };
        let s = src.offset() + range.start;
        let d = dst.offset() + at;
        to.data[d..d + range.len()].copy_from_slice(&from.data[s..s + range.len()]);
        Ok(())
    }

    /// Shrink the logical length without returning slots.
    pub fn truncate(&mut self, span: &mut Span, len: usize) {
        span.len = span.len.min(len as u32);
    }

    pub fn bytes(&self, span: &Span) -> &[u8] {
        let start = span.offset();
        self.pages[span.kind as usize]
            .as_ref()
            .and_then(|p| p.data.get(start..start + span.len as usize))
            .unwrap_or(&[])
    }

    pub fn bytes_mut(&mut self, span: &Span) -> &mut [u8] {
        let start = span.offset();
        match self.pages[span.kind as usize].as_mut() {
            Some(p) => p.data.get_mut(start..start + span.len as usize).unwrap_or(&mut []),
            None => &mut [],
        }
    }

    /// Release a span's slots. The page itself stays with the connection.
    pub fn release(&mut self, span: Span) {
        if let Some(page) = self.pages[span.kind as usize].as_mut() {
            page.mark_free(span.first as usize, span.slots as usize);
            self.used = self.used.saturating_sub(span.capacity());
        }
    }

    /// Return both pages to the pool. Called when the connection is destroyed.
    pub fn release_all(&mut self, pool: &mut PagePool) {
        for slot in &mut self.pages {
            if let Some(page) = slot.take() {
                pool.give(page);
            }
        }
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Pages currently held (never more than two).
    pub fn pages_held(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    fn page_for(&mut self, pool: &mut PagePool, kind: PageKind) -> Result<&mut Page, Error> {
        let slot = &mut self.pages[kind as usize];
        if slot.is_none() {
            *slot = Some(pool.take().ok_or(Error::ArenaExhausted)?);
        }
        slot.as_mut().ok_or(Error::ArenaExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_to_slots_and_enforces_budget() {
        let mut pool = PagePool::new(4);
        let mut arena = ConnArena::new(DEFAULT_BUDGET);
        let a = arena.alloc(&mut pool, PageKind::Header, 100).unwrap();
        assert_eq!(a.capacity(), SLOT_SIZE);
        assert_eq!(arena.used(), SLOT_SIZE);
        let b = arena.alloc(&mut pool, PageKind::Body, 7 * SLOT_SIZE).unwrap();
        assert_eq!(arena.used(), DEFAULT_BUDGET);
        assert_eq!(arena.alloc(&mut pool, PageKind::Body, 1), Err(Error::ArenaExhausted));
        arena.release(b);
        assert_eq!(arena.used(), SLOT_SIZE);
        arena.release(a);
        assert_eq!(arena.pages_held(), 2);
        arena.release_all(&mut pool);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn grow_in_place_and_by_move() {
        let mut pool = PagePool::new(2);
        let mut arena = ConnArena::new(2 * PAGE_SIZE);
        let mut a = arena.alloc(&mut pool, PageKind::Header, 4).unwrap();
        arena.bytes_mut(&a).copy_from_slice(b"abcd");
        arena.grow(&mut a, SLOT_SIZE + 1).unwrap();
        assert_eq!(&arena.bytes(&a)[..4], b"abcd");

        // Block the slot right after `a`, forcing a move on the next grow.
        let blocker = arena.alloc(&mut pool, PageKind::Header, 1).unwrap();
        arena.grow(&mut a, 3 * SLOT_SIZE).unwrap();
        assert_eq!(&arena.bytes(&a)[..4], b"abcd");
        assert_eq!(arena.used(), 4 * SLOT_SIZE);
        arena.release(blocker);
        arena.release(a);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn append_moves_bytes_across_pages() {
        let mut pool = PagePool::new(2);
        let mut arena = ConnArena::new(DEFAULT_BUDGET);
        let read = arena.alloc(&mut pool, PageKind::Header, 18).unwrap();
        arena.bytes_mut(&read).copy_from_slice(b"HEAD\r\n\r\nbody-bytes");
        let mut body = arena.alloc(&mut pool, PageKind::Body, 0).unwrap();
        arena.append(&mut body, &read, 8..12).unwrap();
        arena.append(&mut body, &read, 12..18).unwrap();
        assert_eq!(arena.bytes(&body), b"body-bytes");
        assert_eq!(arena.append(&mut body, &read, 12..19), Err(Error::InvalidState));
        let mut same = arena.alloc(&mut pool, PageKind::Header, 0).unwrap();
        assert_eq!(arena.append(&mut same, &read, 0..1), Err(Error::InvalidState));
    }

    #[test]
    fn grow_beyond_budget_fails_closed() {
        let mut pool = PagePool::new(2);
        let mut arena = ConnArena::new(2 * SLOT_SIZE);
        let mut a = arena.alloc(&mut pool, PageKind::Body, 10).unwrap();
        arena.grow(&mut a, 2 * SLOT_SIZE).unwrap();
        assert_eq!(arena.grow(&mut a, 2 * SLOT_SIZE + 1), Err(Error::ArenaExhausted));
        assert_eq!(a.len(), 2 * SLOT_SIZE);
    }

    #[test]
    fn pool_limit_and_reuse() {
        let mut pool = PagePool::new(1);
        let mut arena = ConnArena::new(DEFAULT_BUDGET);
        let s = arena.alloc(&mut pool, PageKind::Header, 10).unwrap();
        assert_eq!(arena.alloc(&mut pool, PageKind::Body, 10), Err(Error::ArenaExhausted));
        arena.release(s);
        arena.release_all(&mut pool);
        let mut other = ConnArena::new(DEFAULT_BUDGET);
        let s = other.alloc(&mut pool, PageKind::Body, 10).unwrap();
        assert_eq!(s.kind(), PageKind::Body);
    }

    #[test]
    fn physical_bound_is_two_pages() {
        let mut pool = PagePool::new(8);
        let mut arena = ConnArena::new(usize::MAX);
        assert_eq!(arena.budget(), 2 * PAGE_SIZE);
        let h = arena.alloc(&mut pool, PageKind::Header, PAGE_SIZE).unwrap();
        let b = arena.alloc(&mut pool, PageKind::Body, PAGE_SIZE).unwrap();
        assert_eq!(arena.alloc(&mut pool, PageKind::Body, 1), Err(Error::ArenaExhausted));
        assert_eq!(pool.outstanding(), 2);
        arena.release(h);
        arena.release(b);
    }
}
