//! The allocator core: placement, splitting, coalescing and heap growth.
//!
//! Control flow for the two hot paths:
//!
//! ```text
//! allocate:  ceiling -> remove from index -> place (split?) -> payload
//! free:      stamp free -> coalesce (neighbors leave index) -> insert
//! ```
//!
//! Coalescing always runs before insertion: a merged neighbor's size is its
//! tree key, so it has to leave the index before its tags change. Every
//! block handed to [`Heap::place`] is free and unindexed for the same
//! reason.

use std::cmp;
use std::ptr::{self, NonNull};

use crate::block::{
    block_size, header, is_allocated, next_block, pack, prev_block, put, write_tags, CHUNKSIZE,
    DSIZE, MIN_BLOCK_SIZE, WSIZE,
};
use crate::region::Region;
use crate::tree::FreeTree;
use crate::utils::align;

pub(crate) struct Heap {
    pub(crate) region: Region,
    /// Payload of the prologue block; the heap walk starts here. None until
    /// the first successful [`Heap::init`].
    pub(crate) head: Option<NonNull<u8>>,
    pub(crate) tree: FreeTree,
}

// The heap exclusively owns its region; the raw pointers inside never alias
// anything outside of it.
unsafe impl Send for Heap {}

impl Heap {
    pub(crate) const fn new() -> Self {
        Self {
            region: Region::new(),
            head: None,
            tree: FreeTree::new(),
        }
    }

    #[cfg(test)]
    pub(crate) const fn with_limit(limit: usize) -> Self {
        Self {
            region: Region::with_limit(limit),
            head: None,
            tree: FreeTree::new(),
        }
    }

    /// Lays down the padding word, the prologue and the epilogue, then
    /// seeds the index with one `CHUNKSIZE` free block. Idempotent; if the
    /// seeding extension fails the heap stays uninitialized and a later
    /// call starts over from the sentinels.
    pub(crate) fn init(&mut self) -> Result<(), &'static str> {
        if self.head.is_some() {
            return Ok(());
        }

        self.region.init()?;
        let base = self.region.base().ok_or("region has no base")?;

        if self.region.brk() == 0 {
            let start = self
                .region
                .sbrk(4 * WSIZE)
                .ok_or("region too small for the sentinels")?;

            unsafe {
                let p = start.as_ptr();
                put(p, 0); // alignment padding
                put(p.add(WSIZE), pack(DSIZE, true)); // prologue header
                put(p.add(DSIZE), pack(DSIZE, true)); // prologue footer
                put(p.add(WSIZE + DSIZE), pack(0, true)); // epilogue header
            }
        }

        self.tree.attach(base);

        let bp = unsafe { self.extend_heap(CHUNKSIZE / WSIZE) }
            .ok_or("region too small for the initial free block")?;
        unsafe { self.tree.insert(bp) };

        self.head = Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(DSIZE)) });

        Ok(())
    }

    fn ensure_init(&mut self) -> bool {
        self.head.is_some() || self.init().is_ok()
    }

    /// Hands out at least `size` payload bytes, double-word aligned.
    /// Returns null for zero-size requests and on region exhaustion; the
    /// heap is left valid either way.
    pub(crate) unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 || size > usize::MAX / 2 || !self.ensure_init() {
            return ptr::null_mut();
        }

        // One word of header and one of footer on top of the payload.
        let asize = cmp::max(MIN_BLOCK_SIZE, align(size + DSIZE, DSIZE));

        unsafe {
            if let Some(bp) = self.tree.ceiling(asize) {
                self.tree.remove(bp);
                return self.place(bp, asize).as_ptr();
            }

            // No fit: grow by at least a chunk and carve from the new block.
            let extend = cmp::max(asize, CHUNKSIZE);
            match self.extend_heap(extend / WSIZE) {
                Some(bp) => self.place(bp, asize).as_ptr(),
                None => ptr::null_mut(),
            }
        }
    }

    /// Releases the block owning `ptr`. Null and already-free payloads are
    /// ignored.
    ///
    /// **SAFETY**: a non-null `ptr` must have come out of this heap.
    pub(crate) unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(bp) = NonNull::new(ptr) else {
            return;
        };

        unsafe {
            if !is_allocated(bp) {
                return;
            }

            let size = block_size(bp);
            write_tags(bp, size, false);

            let merged = self.coalesce(bp);
            self.tree.insert(merged);
        }
    }

    /// Grows or shrinks the allocation at `ptr` to `size` bytes, in place
    /// whenever the physical layout allows it. Null `ptr` behaves as
    /// allocate; zero `size` frees and returns null. On exhaustion the
    /// original block survives untouched and null comes back.
    ///
    /// **SAFETY**: a non-null `ptr` must be a live payload of this heap.
    pub(crate) unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let Some(bp) = NonNull::new(ptr) else {
            return unsafe { self.allocate(size) };
        };

        if size == 0 {
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }
        if size > usize::MAX / 2 {
            return ptr::null_mut();
        }

        unsafe {
            let csize = block_size(bp);
            let asize = cmp::max(MIN_BLOCK_SIZE, align(size + DSIZE, DSIZE));

            if asize <= csize {
                self.shrink(bp, csize, asize);
                return bp.as_ptr();
            }

            let next = next_block(bp);

            if block_size(next) == 0 {
                // Growing against the epilogue: extend and split in place.
                let extend = cmp::max(asize - csize, CHUNKSIZE);
                if let Some(ext) = self.extend_heap(extend / WSIZE) {
                    debug_assert_eq!(ext, next);
                    let total = csize + block_size(ext);
                    self.split_grown(bp, total, asize);
                    return bp.as_ptr();
                }
            } else if !is_allocated(next) {
                let total = csize + block_size(next);

                if total >= asize {
                    // The free neighbor alone covers the growth.
                    self.tree.remove(next);
                    self.split_grown(bp, total, asize);
                    return bp.as_ptr();
                }

                if block_size(next_block(next)) == 0 {
                    // Free neighbor is short but the epilogue is right
                    // behind it: extend and let the extension coalesce into
                    // the neighbor, then absorb both.
                    let extend = cmp::max(asize - total, CHUNKSIZE);
                    if let Some(merged) = self.extend_heap(extend / WSIZE) {
                        debug_assert_eq!(merged, next);
                        let total = csize + block_size(merged);
                        self.split_grown(bp, total, asize);
                        return bp.as_ptr();
                    }
                }
            }

            // No room in place: allocate, copy, release.
            let old_payload = csize - DSIZE;
            let new = self.allocate(size);
            if new.is_null() {
                return ptr::null_mut();
            }

            ptr::copy_nonoverlapping(bp.as_ptr(), new, cmp::min(old_payload, size));
            self.free(bp.as_ptr());

            new
        }
    }

    /// Grows the region by `words` words, rounded up to an even count to
    /// keep double-word alignment. The old epilogue word becomes the new
    /// free block's header and a fresh epilogue is stamped past its footer.
    /// Returns the block merged with a free predecessor, not yet indexed;
    /// the caller decides.
    unsafe fn extend_heap(&mut self, words: usize) -> Option<NonNull<u8>> {
        let size = if words % 2 == 0 {
            words * WSIZE
        } else {
            (words + 1) * WSIZE
        };

        let bp = self.region.sbrk(size)?;

        unsafe {
            write_tags(bp, size, false);
            put(header(next_block(bp)), pack(0, true)); // new epilogue

            Some(self.coalesce(bp))
        }
    }

    /// Boundary tag coalescing. `bp` must already be tagged free. A merged
    /// neighbor leaves the index first since its key is about to change;
    /// the block that comes back is free and unindexed.
    unsafe fn coalesce(&mut self, bp: NonNull<u8>) -> NonNull<u8> {
        unsafe {
            let prev = prev_block(bp);
            let next = next_block(bp);
            let mut size = block_size(bp);

            match (is_allocated(prev), is_allocated(next)) {
                (true, true) => bp,
                (true, false) => {
                    self.tree.remove(next);
                    size += block_size(next);
                    write_tags(bp, size, false);
                    bp
                }
                (false, true) => {
                    self.tree.remove(prev);
                    size += block_size(prev);
                    write_tags(prev, size, false);
                    prev
                }
                (false, false) => {
                    self.tree.remove(prev);
                    self.tree.remove(next);
                    size += block_size(prev) + block_size(next);
                    write_tags(prev, size, false);
                    prev
                }
            }
        }
    }

    /// Commits an allocation of `asize` bytes into the free, unindexed
    /// block at `bp` and returns the allocated payload. A remainder too
    /// small to stand alone is absorbed. Otherwise the split side is chosen
    /// so the free remainder ends up against the larger physical neighbor,
    /// where a future merge gains the most.
    unsafe fn place(&mut self, bp: NonNull<u8>, asize: usize) -> NonNull<u8> {
        unsafe {
            let csize = block_size(bp);
            let remainder = csize - asize;

            if remainder < MIN_BLOCK_SIZE {
                write_tags(bp, csize, true);
                return bp;
            }

            // The sentinels read as size 8 and 0 here, which is exactly the
            // weight they should carry.
            let prev_size = block_size(prev_block(bp));
            let next_size = block_size(next_block(bp));
            let avg = (prev_size + next_size) / 2;
            let prev_is_larger = prev_size >= next_size;

            // A dominant request sits against the larger neighbor, leaving
            // the remainder next to the smaller one, and vice versa.
            let alloc_at_front = if asize > avg {
                prev_is_larger
            } else {
                !prev_is_larger
            };

            if alloc_at_front {
                write_tags(bp, asize, true);
                let split = next_block(bp);
                write_tags(split, remainder, false);
                self.tree.insert(split);
                bp
            } else {
                write_tags(bp, remainder, false);
                let ablock = next_block(bp);
                write_tags(ablock, asize, true);
                self.tree.insert(bp);
                ablock
            }
        }
    }

    /// In-place shrink to `asize`. The tail is split off and released when
    /// it can stand alone as a block; smaller slack stays inside the block.
    unsafe fn shrink(&mut self, bp: NonNull<u8>, csize: usize, asize: usize) {
        unsafe {
            let remainder = csize - asize;
            if remainder < MIN_BLOCK_SIZE {
                return;
            }

            write_tags(bp, asize, true);
            let tail = next_block(bp);
            write_tags(tail, remainder, false);

            // The old physical successor may be free.
            let merged = self.coalesce(tail);
            self.tree.insert(merged);
        }
    }

    /// After an in-place growth `bp` owns `total` bytes. Stamps `asize` of
    /// them allocated and hands any viable tail back to the index. The tail
    /// always borders an allocated block, so no coalescing is due.
    unsafe fn split_grown(&mut self, bp: NonNull<u8>, total: usize, asize: usize) {
        unsafe {
            let remainder = total - asize;

            if remainder < MIN_BLOCK_SIZE {
                write_tags(bp, total, true);
            } else {
                write_tags(bp, asize, true);
                let tail = next_block(bp);
                write_tags(tail, remainder, false);
                self.tree.insert(tail);
            }
        }
    }
}
