//! The heap region: a contiguous byte range `[base, base + brk)` that only
//! grows at the high end.
//!
//! ```text
//!  base                    base + brk            base + limit
//!   |                          |                      |
//!   +--------------------------+----------------------+
//!   |      handed out          |       reserve        |
//!   +--------------------------+----------------------+
//! ```
//!
//! The whole reservation is mapped once in [`Region::init`]; growing the
//! region afterwards is nothing but moving the break, so [`Region::sbrk`]
//! never fails until the reserve runs dry. The reservation goes back to the
//! kernel when the region is dropped.

use std::ptr::NonNull;

use crate::kernel;

/// Total reservation backing the region. Growth past this point makes
/// [`Region::sbrk`] fail, which the allocator surfaces as a null payload.
pub(crate) const REGION_LIMIT: usize = 64 << 20;

pub(crate) struct Region {
    base: Option<NonNull<u8>>,
    brk: usize,
    limit: usize,
}

impl Region {
    pub(crate) const fn new() -> Self {
        Self {
            base: None,
            brk: 0,
            limit: REGION_LIMIT,
        }
    }

    /// A region with a smaller reserve, for exercising exhaustion.
    #[cfg(test)]
    pub(crate) const fn with_limit(limit: usize) -> Self {
        Self {
            base: None,
            brk: 0,
            limit,
        }
    }

    /// Reserves the backing memory and establishes `base == brk`. Calling
    /// it again on a live region is a no-op.
    pub(crate) fn init(&mut self) -> Result<(), &'static str> {
        if self.base.is_some() {
            return Ok(());
        }

        let base = unsafe { kernel::request_memory(self.limit) }
            .ok_or("kernel refused the region reservation")?;

        self.base = Some(base);
        self.brk = 0;

        Ok(())
    }

    pub(crate) fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Bytes handed out so far.
    pub(crate) fn brk(&self) -> usize {
        self.brk
    }

    /// Grows the region by `incr` bytes and returns the old break, which is
    /// the first byte of the new extent. Fails once the reserve is
    /// exhausted, leaving the region untouched.
    pub(crate) fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
        let base = self.base?;

        if incr > self.limit - self.brk {
            return None;
        }

        let old = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.brk)) };
        self.brk += incr;

        Some(old)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe { kernel::return_memory(base.as_ptr(), self.limit) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbrk_before_init_fails() {
        let mut region = Region::with_limit(4096);
        assert!(region.sbrk(8).is_none());
    }

    #[test]
    fn sbrk_is_monotonic() {
        let mut region = Region::with_limit(4096);
        region.init().unwrap();

        let first = region.sbrk(16).unwrap();
        let second = region.sbrk(32).unwrap();

        assert_eq!(first, region.base().unwrap());
        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 16);
        assert_eq!(region.brk(), 48);
    }

    #[test]
    fn exhaustion_leaves_the_break_alone() {
        let mut region = Region::with_limit(64);
        region.init().unwrap();

        assert!(region.sbrk(48).is_some());
        assert!(region.sbrk(32).is_none());
        assert_eq!(region.brk(), 48);

        // What is left can still be taken.
        assert!(region.sbrk(16).is_some());
        assert!(region.sbrk(1).is_none());
    }

    #[test]
    fn init_is_idempotent() {
        let mut region = Region::with_limit(4096);
        region.init().unwrap();
        let base = region.base();
        region.sbrk(16).unwrap();

        region.init().unwrap();
        assert_eq!(region.base(), base);
        assert_eq!(region.brk(), 16);
    }
}
