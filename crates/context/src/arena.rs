//! Region-based memory arena with stack-discipline allocation
//!
//! All per-request allocations are carved from a growable stack of pages.
//! Allocation only moves forward; nothing is individually freed. Nested
//! regions bracket a scope: closing a region rewinds the write cursor to
//! where the region began, releasing everything allocated inside it, and
//! `reset` rewinds to the base. Pages are never returned to the allocator —
//! they are retained and reused across requests to amortize growth.
//!
//! Allocations are addressed by [`ArenaRef`] index handles rather than raw
//! pointers, so rewinding is a cursor write and the borrow checker mediates
//! access to the underlying bytes.

use quay_core::limits::MemoryLimits;
use quay_core::{Abort, RequestResult};
use smallvec::SmallVec;

/// Handle to a range of bytes allocated from an [`Arena`]
///
/// Valid until the enclosing region is closed or the arena is reset;
/// accessing a handle after that returns whatever bytes now occupy the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef {
    page: u32,
    offset: u32,
    len: u32,
}

impl ArenaRef {
    /// Number of bytes this handle covers
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this handle covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A (page index, cursor) pair captured at `begin_region`
#[derive(Debug, Clone, Copy)]
struct Mark {
    page: usize,
    used: usize,
}

struct Page {
    buf: Box<[u8]>,
    used: usize,
}

impl Page {
    fn new(size: usize) -> Self {
        Page {
            buf: vec![0u8; size].into_boxed_slice(),
            used: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.used
    }
}

/// Occupancy snapshot, for trace logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of pages currently held
    pub pages: usize,
    /// Bytes obligated by live allocations
    pub live_bytes: usize,
    /// Total page capacity held, live or not
    pub reserved_bytes: usize,
}

/// Growable stack of fixed-size pages with nested region checkpoints
pub struct Arena {
    pages: Vec<Page>,
    /// Index of the page the cursor sits in; pages past it are retained
    /// capacity with `used == 0`
    current: usize,
    regions: SmallVec<[Mark; 8]>,
    next_page_size: usize,
    live_bytes: usize,
    limits: MemoryLimits,
}

impl Arena {
    /// Create an empty arena with default limits
    pub fn new() -> Self {
        Self::with_limits(MemoryLimits::default())
    }

    /// Create an empty arena with the given limits
    pub fn with_limits(limits: MemoryLimits) -> Self {
        Arena {
            pages: Vec::new(),
            current: 0,
            regions: SmallVec::new(),
            next_page_size: limits.page_size,
            live_bytes: 0,
            limits,
        }
    }

    /// Allocate `n` bytes, stable until the enclosing region closes or the
    /// arena resets.
    ///
    /// Fails only by exceeding the per-request byte ceiling; that is a fatal
    /// out-of-memory condition for the request, reported rather than retried.
    pub fn alloc(&mut self, n: usize) -> RequestResult<ArenaRef> {
        if n == 0 {
            return Ok(ArenaRef {
                page: self.current as u32,
                offset: self.cursor_offset() as u32,
                len: 0,
            });
        }
        if self.live_bytes.saturating_add(n) > self.limits.max_request_bytes {
            return Err(Abort::Fatal(format!(
                "arena ceiling exceeded: {} live + {} requested > {} allowed",
                self.live_bytes, n, self.limits.max_request_bytes
            )));
        }

        // Advance through retained pages until one fits, then append.
        while self.current < self.pages.len() && self.pages[self.current].remaining() < n {
            if self.current + 1 < self.pages.len() {
                self.current += 1;
            } else {
                break;
            }
        }
        if self.pages.is_empty() || self.pages[self.current].remaining() < n {
            self.grow(n);
        }

        let page = &mut self.pages[self.current];
        let offset = page.used;
        page.used += n;
        self.live_bytes += n;
        Ok(ArenaRef {
            page: self.current as u32,
            offset: offset as u32,
            len: n as u32,
        })
    }

    /// Allocate and fill from a byte slice
    pub fn copy_slice(&mut self, bytes: &[u8]) -> RequestResult<ArenaRef> {
        let r = self.alloc(bytes.len())?;
        self.bytes_mut(r).copy_from_slice(bytes);
        Ok(r)
    }

    /// Allocate and fill from a string
    pub fn copy_str(&mut self, s: &str) -> RequestResult<ArenaRef> {
        self.copy_slice(s.as_bytes())
    }

    /// The bytes behind a handle
    pub fn bytes(&self, r: ArenaRef) -> &[u8] {
        if r.len == 0 {
            return &[];
        }
        let start = r.offset as usize;
        &self.pages[r.page as usize].buf[start..start + r.len as usize]
    }

    /// The bytes behind a handle, mutably
    pub fn bytes_mut(&mut self, r: ArenaRef) -> &mut [u8] {
        if r.len == 0 {
            return &mut [];
        }
        let start = r.offset as usize;
        &mut self.pages[r.page as usize].buf[start..start + r.len as usize]
    }

    /// The bytes behind a handle as UTF-8, when they are
    pub fn str_at(&self, r: ArenaRef) -> Option<&str> {
        std::str::from_utf8(self.bytes(r)).ok()
    }

    /// Open a nested region; every `begin_region` must be matched by exactly
    /// one [`end_region`](Self::end_region) before the enclosing scope ends.
    pub fn begin_region(&mut self) {
        self.regions.push(Mark {
            page: self.current,
            used: self.cursor_offset(),
        });
    }

    /// Close the most recently opened region, releasing all allocations made
    /// since its mark. Pages stay with the arena.
    ///
    /// # Panics
    /// Panics when no region is open; an unmatched `end_region` is a
    /// programming error, not a runtime condition.
    pub fn end_region(&mut self) {
        let mark = match self.regions.pop() {
            Some(m) => m,
            None => panic!("end_region without matching begin_region"),
        };
        let mut freed = 0;
        let after_mark = (mark.page + 1).min(self.pages.len());
        for page in &mut self.pages[after_mark..] {
            freed += page.used;
            page.used = 0;
        }
        if let Some(page) = self.pages.get_mut(mark.page) {
            freed += page.used - mark.used;
            page.used = mark.used;
        }
        self.current = mark.page;
        self.live_bytes -= freed;
    }

    /// Rewind to the base, retaining page capacity. Open regions are
    /// abandoned; the context distinguishes a legitimate unwind from an
    /// unmatched `begin_region` and flags the latter.
    pub fn reset(&mut self) {
        self.regions.clear();
        for page in &mut self.pages {
            page.used = 0;
        }
        self.current = 0;
        self.live_bytes = 0;
    }

    /// Bytes obligated by live allocations
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of regions currently open
    pub fn open_regions(&self) -> usize {
        self.regions.len()
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            pages: self.pages.len(),
            live_bytes: self.live_bytes,
            reserved_bytes: self.pages.iter().map(|p| p.buf.len()).sum(),
        }
    }

    fn cursor_offset(&self) -> usize {
        self.pages.get(self.current).map_or(0, |p| p.used)
    }

    /// Append a page sized for `n`, doubling the target size on each growth
    /// up to the page-size cap.
    fn grow(&mut self, n: usize) {
        let size = n.max(self.next_page_size.min(self.limits.max_page_size));
        self.next_page_size = (self.next_page_size * 2).min(self.limits.max_page_size);
        self.pages.push(Page::new(size));
        self.current = self.pages.len() - 1;
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_read_back() {
        let mut arena = Arena::new();
        let r = arena.copy_str("hello").unwrap();
        assert_eq!(arena.bytes(r), b"hello");
        assert_eq!(arena.str_at(r), Some("hello"));
        assert_eq!(arena.live_bytes(), 5);
    }

    #[test]
    fn test_alloc_zeroed_on_fresh_page() {
        let mut arena = Arena::new();
        let r = arena.alloc(64).unwrap();
        assert!(arena.bytes(r).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_rewinds_cursor() {
        let mut arena = Arena::new();
        arena.copy_str("persistent").unwrap();
        let before = arena.live_bytes();

        arena.begin_region();
        arena.alloc(1000).unwrap();
        arena.alloc(2000).unwrap();
        assert_eq!(arena.live_bytes(), before + 3000);
        arena.end_region();

        assert_eq!(arena.live_bytes(), before);
    }

    #[test]
    fn test_nested_regions_unwind_in_order() {
        let mut arena = Arena::new();
        arena.begin_region();
        arena.alloc(100).unwrap();
        arena.begin_region();
        arena.alloc(200).unwrap();
        assert_eq!(arena.live_bytes(), 300);

        arena.end_region();
        assert_eq!(arena.live_bytes(), 100);
        arena.end_region();
        assert_eq!(arena.live_bytes(), 0);
    }

    #[test]
    fn test_region_spanning_page_growth() {
        // Allocations inside the region force new pages; closing the region
        // must rewind across all of them.
        let mut arena = Arena::with_limits(MemoryLimits {
            page_size: 128,
            ..MemoryLimits::default()
        });
        arena.begin_region();
        for _ in 0..10 {
            arena.alloc(100).unwrap();
        }
        let pages_grown = arena.stats().pages;
        assert!(pages_grown > 1);
        arena.end_region();

        assert_eq!(arena.live_bytes(), 0);
        // Capacity retained
        assert_eq!(arena.stats().pages, pages_grown);
    }

    #[test]
    fn test_allocation_valid_until_region_close() {
        let mut arena = Arena::new();
        arena.begin_region();
        let a = arena.copy_str("aaa").unwrap();
        let b = arena.copy_str("bbb").unwrap();
        // Both stay reachable and intact while the region is open
        assert_eq!(arena.bytes(a), b"aaa");
        assert_eq!(arena.bytes(b), b"bbb");
        arena.end_region();
    }

    #[test]
    fn test_reset_retains_pages() {
        let mut arena = Arena::new();
        arena.alloc(10_000).unwrap();
        let reserved = arena.stats().reserved_bytes;
        arena.reset();
        assert_eq!(arena.live_bytes(), 0);
        assert_eq!(arena.stats().reserved_bytes, reserved);

        // Reused pages serve the next request without new growth
        arena.alloc(10_000).unwrap();
        assert_eq!(arena.stats().reserved_bytes, reserved);
    }

    #[test]
    fn test_growth_doubles_page_size() {
        let mut arena = Arena::with_limits(MemoryLimits {
            page_size: 64,
            ..MemoryLimits::default()
        });
        // Each exact-fit allocation exhausts its page and forces growth
        arena.alloc(64).unwrap();
        arena.alloc(128).unwrap();
        arena.alloc(256).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.reserved_bytes, 64 + 128 + 256);
    }

    #[test]
    fn test_oversized_allocation_gets_own_page() {
        let mut arena = Arena::with_limits(MemoryLimits {
            page_size: 64,
            ..MemoryLimits::default()
        });
        let r = arena.alloc(10_000).unwrap();
        assert_eq!(r.len(), 10_000);
    }

    #[test]
    fn test_ceiling_is_fatal() {
        let mut arena = Arena::with_limits(MemoryLimits {
            page_size: 64,
            max_page_size: 1024,
            max_request_bytes: 1024,
        });
        arena.alloc(512).unwrap();
        let err = arena.alloc(1024).unwrap_err();
        assert!(matches!(err, Abort::Fatal(_)));
        // The failed allocation obligated nothing
        assert_eq!(arena.live_bytes(), 512);
    }

    #[test]
    #[should_panic(expected = "end_region without matching begin_region")]
    fn test_unmatched_end_region_panics() {
        let mut arena = Arena::new();
        arena.end_region();
    }

    #[test]
    fn test_zero_length_alloc() {
        let mut arena = Arena::new();
        let r = arena.alloc(0).unwrap();
        assert!(r.is_empty());
        assert_eq!(arena.bytes(r), b"");
        assert_eq!(arena.live_bytes(), 0);
    }

    mod region_properties {
        use super::*;
        use proptest::prelude::*;

        /// One step of a region script
        #[derive(Debug, Clone)]
        enum Step {
            Alloc(usize),
            Begin,
            End,
        }

        fn step_strategy() -> impl Strategy<Value = Step> {
            prop_oneof![
                (1usize..4096).prop_map(Step::Alloc),
                Just(Step::Begin),
                Just(Step::End),
            ]
        }

        proptest! {
            /// Properly nested begin/end sequences restore the high-water
            /// mark of the outermost region.
            #[test]
            fn prop_balanced_regions_restore_watermark(
                script in proptest::collection::vec(step_strategy(), 0..64)
            ) {
                let mut arena = Arena::new();
                arena.copy_str("preexisting").unwrap();

                let before = arena.live_bytes();
                arena.begin_region();
                let mut depth = 0usize;
                for step in script {
                    match step {
                        Step::Alloc(n) => { arena.alloc(n).unwrap(); }
                        Step::Begin => {
                            arena.begin_region();
                            depth += 1;
                        }
                        Step::End => {
                            if depth > 0 {
                                arena.end_region();
                                depth -= 1;
                            }
                        }
                    }
                }
                for _ in 0..depth {
                    arena.end_region();
                }
                arena.end_region();

                prop_assert_eq!(arena.live_bytes(), before);
                prop_assert_eq!(arena.open_regions(), 0);
            }

            /// Bytes allocated since the last mark stay reachable until the
            /// region closes.
            #[test]
            fn prop_allocations_reachable_within_region(
                sizes in proptest::collection::vec(1usize..512, 1..16)
            ) {
                let mut arena = Arena::new();
                arena.begin_region();
                let mut refs = Vec::new();
                for (i, n) in sizes.iter().enumerate() {
                    let r = arena.alloc(*n).unwrap();
                    arena.bytes_mut(r).fill(i as u8);
                    refs.push((r, i as u8));
                }
                for (r, fill) in &refs {
                    prop_assert!(arena.bytes(*r).iter().all(|b| b == fill));
                }
                arena.end_region();
            }
        }
    }
}
