//! Runs the allocator as the global allocator and watches the region from
//! the inside: the verbose checker dump prints every block between the
//! sentinels plus the index contents, so the effects of coalescing and
//! in-place resizing are visible while ordinary collections go about
//! their business.

use std::thread;

use treealloc::TreeAlloc;

#[global_allocator]
static ALLOCATOR: TreeAlloc = TreeAlloc::new();

fn main() {
    // Ordinary collections land between the sentinels like any other
    // payload.
    let values: Vec<u64> = (0..8).collect();
    let msg = String::from("region testing");
    println!("vec at {:p}, string at {:p}", values.as_ptr(), msg.as_ptr());

    eprintln!("--- heap while the collections are live ---");
    ALLOCATOR.checkheap(true);

    unsafe {
        // Two adjacent blocks, then a fence so the merge below stops at a
        // live allocation instead of running into the free tail.
        let a = ALLOCATOR.allocate(24);
        let b = ALLOCATOR.allocate(24);
        let fence = ALLOCATOR.allocate(24);

        // Releasing b and then a merges them into one 64-byte block. The
        // index now holds a block that can serve a request neither could
        // alone, and the ceiling search finds it as an exact fit.
        ALLOCATOR.free(b);
        ALLOCATOR.free(a);

        let merged = ALLOCATOR.allocate(56);
        println!("a {a:?} and b {b:?} merged; 56 bytes landed at {merged:?}");

        eprintln!("--- heap after the merge was reused ---");
        ALLOCATOR.checkheap(true);

        // With the fence gone the merged block borders free space again,
        // so growing it stays in place.
        ALLOCATOR.free(fence);
        let grown = ALLOCATOR.resize(merged, 160);
        println!("resize 56 -> 160 kept the payload in place: {}", grown == merged);

        ALLOCATOR.free(grown);
    }

    // The facade lock serializes threads onto the one region.
    let workers: Vec<_> = (0..2)
        .map(|id| {
            thread::spawn(move || {
                let local = vec![id as u8; 512];
                local.len()
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), 512);
    }

    eprintln!("--- heap at exit ---");
    let violations = ALLOCATOR.checkheap(true);
    println!("checker found {violations} violations");
}
