//! Allocator for 32-bit matchtags.
//!
//! Matchtags pair requests with responses.  The lower 20 bits are a "tag";
//! the upper 12 bits are a "group".  Requests that receive no response use
//! [`MATCHTAG_NONE`]; requests that receive one response use a tag;
//! requests that receive multiple responses use a group.  When the group
//! bits are nonzero only they are matched, and the tag bits are free for
//! caller-defined data.

use flux_msg::{MATCHTAG_GROUP_MASK, MATCHTAG_GROUP_SHIFT, MATCHTAG_NONE};

const COUNT_REGULAR: u32 = 1 << 20;
const COUNT_GROUP: u32 = 1 << 12;
const START_SIZE: u32 = 1 << 10;

type GrowFn = Box<dyn FnMut(u32, u32, bool) + Send>;

/// Free-value bitmap for one partition.  A set bit means the value is
/// available.
struct BitPool {
    words: Vec<u64>,
    size: u32,
}

impl BitPool {
    fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two() && size >= 64);
        BitPool {
            words: vec![!0u64; (size / 64) as usize],
            size,
        }
    }

    fn take_lowest(&mut self) -> Option<u32> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1u64 << bit);
                return Some(i as u32 * 64 + bit);
            }
        }
        None
    }

    fn put(&mut self, val: u32) {
        if val < self.size {
            self.words[(val / 64) as usize] |= 1u64 << (val % 64);
        }
    }

    fn remove(&mut self, val: u32) {
        if val < self.size {
            self.words[(val / 64) as usize] &= !(1u64 << (val % 64));
        }
    }

    fn grow_to(&mut self, newsize: u32) {
        debug_assert!(newsize > self.size);
        self.words.resize((newsize / 64) as usize, !0u64);
        self.size = newsize;
    }
}

/// Matchtag allocator with a regular and a group partition.
///
/// Each partition starts small and doubles on exhaustion up to its cap.  A
/// grow callback, if installed, fires once per doubling so the handle can
/// update any tag-indexed state; reentrant growth from inside the callback
/// is suppressed.
pub struct TagPool {
    regular: BitPool,
    group: BitPool,
    reg_avail: u32,
    group_avail: u32,
    grow_cb: Option<GrowFn>,
    grow_depth: u32,
}

impl TagPool {
    pub fn new() -> Self {
        let mut regular = BitPool::new(START_SIZE);
        let mut group = BitPool::new(START_SIZE);
        regular.remove(MATCHTAG_NONE); // reserved
        group.remove(0); // zero group bits mean "regular tag"
        TagPool {
            regular,
            group,
            reg_avail: COUNT_REGULAR - 1,
            group_avail: COUNT_GROUP - 1,
            grow_cb: None,
            grow_depth: 0,
        }
    }

    pub fn on_grow(&mut self, cb: impl FnMut(u32, u32, bool) + Send + 'static) {
        self.grow_cb = Some(Box::new(cb));
    }

    /// Allocate the lowest free tag.  Group tags come back shifted into the
    /// upper bits so callers can OR data into the lower bits.  `None` when
    /// the partition is exhausted.
    pub fn alloc(&mut self, group: bool) -> Option<u32> {
        let tag = self.alloc_with_resize(group)?;
        if group {
            self.group_avail -= 1;
            Some(tag << MATCHTAG_GROUP_SHIFT)
        } else {
            self.reg_avail -= 1;
            Some(tag)
        }
    }

    fn alloc_with_resize(&mut self, group: bool) -> Option<u32> {
        let max = if group { COUNT_GROUP } else { COUNT_REGULAR };
        let pool = if group {
            &mut self.group
        } else {
            &mut self.regular
        };
        if let Some(tag) = pool.take_lowest() {
            return Some(tag);
        }
        let oldsize = pool.size;
        let newsize = oldsize << 1;
        if newsize > max {
            return None;
        }
        if self.grow_depth == 0
            && let Some(mut cb) = self.grow_cb.take()
        {
            self.grow_depth += 1;
            cb(oldsize, newsize, group);
            self.grow_depth -= 1;
            self.grow_cb = Some(cb);
        }
        let pool = if group {
            &mut self.group
        } else {
            &mut self.regular
        };
        pool.grow_to(newsize);
        pool.take_lowest()
    }

    /// Return a tag to the pool.  [`MATCHTAG_NONE`] is ignored.
    pub fn free(&mut self, tag: u32) {
        if tag == MATCHTAG_NONE {
            return;
        }
        let group = tag >> MATCHTAG_GROUP_SHIFT;
        if group > 0 {
            if group < self.group.size {
                self.group.put(group);
                self.group_avail += 1;
            }
        } else if tag < self.regular.size {
            self.regular.put(tag);
            self.reg_avail += 1;
        }
    }

    pub fn regular_size(&self) -> u32 {
        COUNT_REGULAR - 1
    }

    pub fn regular_avail(&self) -> u32 {
        self.reg_avail
    }

    pub fn group_size(&self) -> u32 {
        COUNT_GROUP - 1
    }

    pub fn group_avail(&self) -> u32 {
        self.group_avail
    }
}

impl Default for TagPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn alloc_never_returns_reserved() {
        let mut pool = TagPool::new();
        assert_eq!(pool.alloc(false), Some(1));
        assert_eq!(pool.alloc(true), Some(1 << MATCHTAG_GROUP_SHIFT));
    }

    #[test]
    fn outstanding_tags_never_alias() {
        let mut pool = TagPool::new();
        let mut seen = HashSet::new();
        for _ in 0..5000 {
            let tag = pool.alloc(false).unwrap();
            assert_ne!(tag, MATCHTAG_NONE);
            assert!(seen.insert(tag), "tag {} returned twice", tag);
        }
        // free a few and confirm they become reusable
        for tag in [1u32, 17, 4099] {
            pool.free(tag);
        }
        for _ in 0..3 {
            let tag = pool.alloc(false).unwrap();
            assert!([1u32, 17, 4099].contains(&tag));
        }
    }

    #[test]
    fn avail_tracks_alloc_and_free() {
        let mut pool = TagPool::new();
        let size = pool.regular_size();
        assert_eq!(pool.regular_avail(), size);
        let tag = pool.alloc(false).unwrap();
        assert_eq!(pool.regular_avail(), size - 1);
        pool.free(tag);
        assert_eq!(pool.regular_avail(), size);
    }

    #[test]
    fn grow_fires_once_per_doubling() {
        let mut pool = TagPool::new();
        let grows = Arc::new(AtomicU32::new(0));
        let grows2 = grows.clone();
        pool.on_grow(move |oldsize, newsize, group| {
            assert_eq!(newsize, oldsize * 2);
            assert!(!group);
            grows2.fetch_add(1, Ordering::SeqCst);
        });
        // exhaust the initial 1024 entries (tag 0 reserved), then one more
        for _ in 0..1023 {
            pool.alloc(false).unwrap();
        }
        assert_eq!(grows.load(Ordering::SeqCst), 0);
        assert_eq!(pool.alloc(false), Some(1024));
        assert_eq!(grows.load(Ordering::SeqCst), 1);
        // drain the rest of the doubled range, then trigger the next one
        for _ in 0..1023 {
            pool.alloc(false).unwrap();
        }
        assert_eq!(grows.load(Ordering::SeqCst), 1);
        assert_eq!(pool.alloc(false), Some(2048));
        assert_eq!(grows.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn group_partition_exhausts_at_cap() {
        let mut pool = TagPool::new();
        for _ in 0..(1 << 12) - 1 {
            assert!(pool.alloc(true).is_some());
        }
        assert_eq!(pool.alloc(true), None);
        assert_eq!(pool.group_avail(), 0);
    }

    #[test]
    fn group_tags_shifted_and_freed_by_group_bits() {
        let mut pool = TagPool::new();
        let tag = pool.alloc(true).unwrap();
        assert_eq!(tag & !MATCHTAG_GROUP_MASK, 0);
        // caller ORs data into the low bits; free by the full value
        pool.free(tag | 0xABC);
        let again = pool.alloc(true).unwrap();
        assert_eq!(again, tag);
    }
}
