//! Public allocator facade.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

use spin::Mutex;

use crate::block::DSIZE;
use crate::checker::StderrSink;
use crate::heap::Heap;

/// A dynamic storage allocator over a single, monotonically growing heap
/// region.
///
/// The allocator itself is single-threaded; this facade serializes access
/// with a spin lock so one instance can serve a whole program, including as
/// the global allocator:
///
/// ```rust,ignore
/// use treealloc::TreeAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: TreeAlloc = TreeAlloc::new();
/// ```
///
/// All payloads are double-word (8 byte) aligned; stricter alignment
/// requests are refused with a null pointer.
pub struct TreeAlloc {
    heap: Mutex<Heap>,
}

impl TreeAlloc {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Prepares the region eagerly. Allocation does this on first use, but
    /// callers that want the failure surfaced can ask up front.
    pub fn init(&self) -> Result<(), &'static str> {
        self.heap.lock().init()
    }

    /// Hands out at least `size` bytes, double-word aligned. Returns null
    /// when `size` is zero or the region is exhausted.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        unsafe { self.heap.lock().allocate(size) }
    }

    /// Releases the allocation at `ptr`. Null is ignored.
    ///
    /// **SAFETY**: a non-null `ptr` must have come out of this allocator
    /// and not been freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        unsafe { self.heap.lock().free(ptr) }
    }

    /// Grows or shrinks the allocation at `ptr` to `size` bytes, in place
    /// whenever the physical layout allows it. A null `ptr` behaves as
    /// [`TreeAlloc::allocate`]; a zero `size` frees and returns null. The
    /// leading `min(old size, size)` payload bytes are preserved.
    ///
    /// **SAFETY**: a non-null `ptr` must be a live allocation of this
    /// allocator.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.heap.lock().resize(ptr, size) }
    }

    /// Runs the consistency checker, reporting each violation to stderr,
    /// and returns how many were found. With `verbose` every block is
    /// printed along the walk.
    pub fn checkheap(&self, verbose: bool) -> usize {
        self.heap.lock().check(verbose, &mut StderrSink)
    }
}

impl Default for TreeAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TreeAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > DSIZE {
            return ptr::null_mut();
        }

        unsafe { self.heap.lock().allocate(layout.size()) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.heap.lock().free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > DSIZE {
            return ptr::null_mut();
        }

        unsafe { self.heap.lock().resize(ptr, new_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_allocation_and_write() {
        let allocator = TreeAlloc::new();

        unsafe {
            let block1 = allocator.allocate(4) as *mut u32;
            assert!(!block1.is_null());

            *block1 = 12415;
            assert_eq!(*block1, 12415);

            let block2 = allocator.allocate(4) as *mut u32;

            *block2 = 36353;
            assert_eq!(*block2, 36353);

            // Check block1 has not been overwritten.
            assert_eq!(*block1, 12415);
        }

        assert_eq!(allocator.checkheap(false), 0);
    }

    #[test]
    fn alloc_dealloc_reuse() {
        let allocator = TreeAlloc::new();

        unsafe {
            let block1 = allocator.allocate(8);
            assert!(!block1.is_null());

            allocator.free(block1);

            // The freed block coalesced back and the front of the chunk is
            // handed out again.
            let block2 = allocator.allocate(8);
            assert_eq!(block1, block2);

            let block3 = allocator.allocate(8);
            assert_ne!(block3, block2);
        }

        assert_eq!(allocator.checkheap(false), 0);
    }

    #[test]
    fn dealloc_null() {
        // This should not do anything, and it should not panic.
        let allocator = TreeAlloc::new();
        unsafe { allocator.free(ptr::null_mut()) };
    }

    #[test]
    fn block_merging() {
        let allocator = TreeAlloc::new();

        unsafe {
            let p1 = allocator.allocate(8);
            let p2 = allocator.allocate(8);

            allocator.free(p2);
            // After this, p1 and p2 are merged (merging with next).
            allocator.free(p1);

            // A request covering both reuses the merged front block.
            let p3 = allocator.allocate(24);
            assert_eq!(p1, p3);
        }

        assert_eq!(allocator.checkheap(false), 0);
    }

    #[test]
    fn global_alloc_respects_the_alignment_limit() {
        let allocator = TreeAlloc::new();

        unsafe {
            let ok = GlobalAlloc::alloc(&allocator, Layout::from_size_align(32, 8).unwrap());
            assert!(!ok.is_null());
            assert_eq!(ok as usize % 8, 0);

            let too_strict = GlobalAlloc::alloc(&allocator, Layout::from_size_align(32, 64).unwrap());
            assert!(too_strict.is_null());

            GlobalAlloc::dealloc(&allocator, ok, Layout::from_size_align(32, 8).unwrap());
        }
    }

    #[test]
    fn global_realloc_preserves_contents() {
        let allocator = TreeAlloc::new();
        let layout = Layout::from_size_align(16, 8).unwrap();

        unsafe {
            let p = GlobalAlloc::alloc(&allocator, layout);
            p.write_bytes(0x3D, 16);

            let q = GlobalAlloc::realloc(&allocator, p, layout, 64);
            assert!(!q.is_null());
            for i in 0..16 {
                assert_eq!(q.add(i).read(), 0x3D);
            }

            GlobalAlloc::dealloc(&allocator, q, Layout::from_size_align(64, 8).unwrap());
        }

        assert_eq!(allocator.checkheap(false), 0);
    }
}
