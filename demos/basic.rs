use treealloc::TreeAlloc;

fn log_alloc(what: &str, addr: *mut u8, size: usize) {
    println!("{what}: requested {size} bytes, received {addr:?}");
}

fn main() {
    let allocator = TreeAlloc::new();
    allocator.init().expect("region reservation failed");

    unsafe {
        let a = allocator.allocate(8);
        log_alloc("a", a, 8);

        let b = allocator.allocate(100);
        log_alloc("b", b, 100);

        let c = allocator.allocate(1000);
        log_alloc("c", c, 1000);

        println!("\nheap after three allocations:");
        allocator.checkheap(true);

        // Growing b in place merges it with whatever free space follows.
        let b = allocator.resize(b, 300);
        log_alloc("b resized", b, 300);

        allocator.free(a);
        allocator.free(c);
        allocator.free(b);

        println!("\nheap after releasing everything:");
        allocator.checkheap(true);
    }
}
