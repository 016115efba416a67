//! Structural consistency checks over the whole heap.
//!
//! The checker is a read-only walk from the prologue to the epilogue. It
//! verifies the boundary tags, the coalescing invariant and the free index
//! against each other, writing one line per violation into a diagnostic
//! sink. It never mutates and never attempts repair; the count it returns
//! tells the caller whether the heap is still trustworthy.
//!
//! The sink is `fmt::Write` so that checking allocates nothing. The
//! default sink used by [`crate::TreeAlloc::checkheap`] writes straight to
//! stderr, which keeps the checker usable even while the allocator is
//! serving as the global allocator.

use std::fmt;
use std::ptr::NonNull;

use crate::block::{block_size, get, header, footer, is_allocated, next_block, DSIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::heap::Heap;

impl Heap {
    /// Walks every block between the sentinels. Returns the number of
    /// violations found; with `verbose` each block is printed on the way.
    pub(crate) fn check(&self, verbose: bool, sink: &mut dyn fmt::Write) -> usize {
        let Some(head) = self.head else {
            // Nothing was built yet, so nothing can be wrong.
            return 0;
        };

        let mut violations = 0;

        unsafe {
            if verbose {
                let _ = writeln!(sink, "heap ({:p}):", head.as_ptr());
            }

            if block_size(head) != DSIZE || !is_allocated(head) {
                violations += 1;
                let _ = writeln!(sink, "bad prologue header");
            }

            let mut free_blocks = 0usize;
            let mut block_bytes = 0usize;
            let mut prev_free = false;
            let mut bp = next_block(head);

            while block_size(bp) > 0 {
                if verbose {
                    self.print_block(bp, sink);
                }

                violations += self.check_block(bp, prev_free, sink);

                let free = !is_allocated(bp);
                if free {
                    free_blocks += 1;
                }
                block_bytes += block_size(bp);
                prev_free = free;

                bp = next_block(bp);
            }

            if verbose {
                self.print_block(bp, sink);
            }

            if block_size(bp) != 0 || !is_allocated(bp) {
                violations += 1;
                let _ = writeln!(sink, "bad epilogue header");
            }

            // Padding word, prologue and epilogue header are the only bytes
            // not accounted to a block.
            let overhead = 4 * WSIZE;
            if block_bytes + overhead != self.region.brk() {
                violations += 1;
                let _ = writeln!(
                    sink,
                    "block bytes {} disagree with region break {}",
                    block_bytes,
                    self.region.brk()
                );
            }

            let indexed = self.tree.count();
            if indexed != free_blocks {
                violations += 1;
                let _ = writeln!(
                    sink,
                    "index holds {indexed} blocks, the heap has {free_blocks} free"
                );
            }

            // Every indexed block must still be free; an allocated node
            // means a stale or corrupted link.
            let mut misindexed = 0usize;
            self.tree.walk(&mut |node, _, allocated| {
                if allocated {
                    misindexed += 1;
                    let _ = writeln!(sink, "{:p}: allocated block in the index", node.as_ptr());
                }
            });
            violations += misindexed;

            if !self.tree.is_ordered() {
                violations += 1;
                let _ = writeln!(sink, "index violates the search order");
            }

            if verbose {
                if self.tree.is_empty() {
                    let _ = writeln!(sink, "index: empty");
                } else {
                    let _ = write!(sink, "index sizes:");
                    self.tree.walk(&mut |_, size, _| {
                        let _ = write!(sink, " {size}");
                    });
                    let _ = writeln!(sink);
                }
            }
        }

        violations
    }

    unsafe fn check_block(&self, bp: NonNull<u8>, prev_free: bool, sink: &mut dyn fmt::Write) -> usize {
        let mut violations = 0;

        unsafe {
            if bp.as_ptr() as usize % DSIZE != 0 {
                violations += 1;
                let _ = writeln!(sink, "{:p}: payload is not doubleword aligned", bp.as_ptr());
            }

            if get(header(bp)) != get(footer(bp)) {
                violations += 1;
                let _ = writeln!(sink, "{:p}: header does not match footer", bp.as_ptr());
            }

            let size = block_size(bp);
            if size % DSIZE != 0 || size < MIN_BLOCK_SIZE {
                violations += 1;
                let _ = writeln!(sink, "{:p}: illegal block size {size}", bp.as_ptr());
            }

            if !is_allocated(bp) {
                if prev_free {
                    violations += 1;
                    let _ = writeln!(sink, "{:p}: two free blocks in a row", bp.as_ptr());
                }
                if !self.tree.contains(bp) {
                    violations += 1;
                    let _ = writeln!(sink, "{:p}: free block missing from the index", bp.as_ptr());
                }
            }
        }

        violations
    }

    unsafe fn print_block(&self, bp: NonNull<u8>, sink: &mut dyn fmt::Write) {
        unsafe {
            let hsize = block_size(bp);
            let halloc = if is_allocated(bp) { 'a' } else { 'f' };

            if hsize == 0 {
                let _ = writeln!(sink, "{:p}: EOL", bp.as_ptr());
                return;
            }

            let fword = get(footer(bp));
            let fsize = (fword & !0x7) as usize;
            let falloc = if fword & 0x1 == 1 { 'a' } else { 'f' };

            if halloc == 'f' {
                let (left, right) = self.tree.links(bp);
                let _ = writeln!(
                    sink,
                    "{:p}: header [{hsize}:{halloc}] | left: {:?}, right: {:?} | footer [{fsize}:{falloc}]",
                    bp.as_ptr(),
                    left.map(NonNull::as_ptr),
                    right.map(NonNull::as_ptr),
                );
            } else {
                let _ = writeln!(
                    sink,
                    "{:p}: header [{hsize}:{halloc}] footer [{fsize}:{falloc}]",
                    bp.as_ptr()
                );
            }
        }
    }
}

/// Diagnostic sink writing straight to stderr without touching the heap.
pub(crate) struct StderrSink;

impl fmt::Write for StderrSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use std::io::Write;
        std::io::stderr().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}
