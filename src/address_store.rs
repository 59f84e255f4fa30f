//! Append-only address storage over an anonymous mapping.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::mman::{madvise, mmap_anonymous, mremap, munmap, MRemapFlags, MapFlags, MmapAdvise, ProtFlags};

use crate::error::Error;

const ELEMENT_SIZE: usize = std::mem::size_of::<u64>();

/// A growable buffer of 64-bit addresses backed by an anonymous private
/// mapping.
///
/// Appends from multiple workers are safe: the tail slice is reserved with a
/// single fetch-add before being filled. Everything that can move or discard
/// the mapping takes `&mut self`, so the mapping can never change under a
/// concurrent append.
pub struct AddressStore {
    ptr: NonNull<c_void>,
    capacity: usize,
    cursor: AtomicUsize,
}

// Safety: the mapping is exclusively owned, appends reserve disjoint slices
// through the atomic cursor, and reshaping operations require `&mut self`.
unsafe impl Send for AddressStore {}
unsafe impl Sync for AddressStore {}

impl AddressStore {
    /// Map a store able to hold `capacity` addresses. The mapping is virtual
    /// address space only; pages materialize as they are written.
    pub fn new(capacity: usize) -> Result<AddressStore, Error> {
        let bytes = capacity
            .checked_mul(ELEMENT_SIZE)
            .and_then(NonZeroUsize::new)
            .ok_or(Error::BadCapacity)?;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                bytes,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(Error::Map)?;

        Ok(AddressStore {
            ptr,
            capacity,
            cursor: AtomicUsize::new(0),
        })
    }

    fn base(&self) -> *mut u64 {
        self.ptr.as_ptr() as *mut u64
    }

    pub fn len(&self) -> usize {
        self.cursor.load(Ordering::SeqCst).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append the given addresses, reserving the tail slice atomically.
    ///
    /// A reservation that would cross the capacity is rolled back and the
    /// call fails; the store never grows here.
    pub fn put(&self, items: &[u64]) -> Result<(), Error> {
        let n = items.len();

        if n == 0 {
            return Ok(());
        }

        let start = self.cursor.fetch_add(n, Ordering::SeqCst);

        if start + n > self.capacity {
            self.cursor.fetch_sub(n, Ordering::SeqCst);
            return Err(Error::CapacityExceeded);
        }

        unsafe {
            std::ptr::copy_nonoverlapping(items.as_ptr(), self.base().add(start), n);
        }

        Ok(())
    }

    /// The element at `offset`, if it is within the current contents.
    pub fn index(&self, offset: usize) -> Option<u64> {
        if offset >= self.len() {
            return None;
        }

        Some(unsafe { *self.base().add(offset) })
    }

    /// Up to `n` elements starting at `offset`.
    pub fn get_n(&self, offset: usize, n: usize) -> &[u64] {
        let len = self.len();

        if offset >= len || n == 0 {
            return &[];
        }

        let end = (offset + n).min(len);
        unsafe { slice::from_raw_parts(self.base().add(offset), end - offset) }
    }

    /// The current contents.
    pub fn as_slice(&self) -> &[u64] {
        unsafe { slice::from_raw_parts(self.base(), self.len()) }
    }

    /// Append the full contents of another store, growing the mapping if
    /// needed. Growth at least doubles so repeated merges stay cheap.
    pub fn merge(&mut self, other: &AddressStore) -> Result<(), Error> {
        let n = other.len();

        if n == 0 {
            return Ok(());
        }

        let cursor = self.len();
        let needed = cursor + n;

        if needed > self.capacity {
            self.grow((self.capacity * 2).max(needed))?;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(other.base(), self.base().add(cursor), n);
        }

        self.cursor.store(needed, Ordering::SeqCst);
        Ok(())
    }

    fn grow(&mut self, capacity: usize) -> Result<(), Error> {
        if capacity <= self.capacity {
            return Ok(());
        }

        let old = self.capacity * ELEMENT_SIZE;
        let new = capacity.checked_mul(ELEMENT_SIZE).ok_or(Error::BadCapacity)?;

        let ptr = unsafe { mremap(self.ptr, old, new, MRemapFlags::MREMAP_MAYMOVE, None) }
            .map_err(Error::Remap)?;

        self.ptr = ptr;
        self.capacity = capacity;
        Ok(())
    }

    /// Reset the cursor and hand the physical pages back to the kernel. The
    /// virtual range stays mapped, so subsequent appends need no remap.
    pub fn clear(&mut self) {
        self.cursor.store(0, Ordering::SeqCst);

        unsafe {
            let _ = madvise(self.ptr, self.capacity * ELEMENT_SIZE, MmapAdvise::MADV_DONTNEED);
        }
    }
}

impl Drop for AddressStore {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.capacity * ELEMENT_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn put_and_read_back() {
        let store = AddressStore::new(16).expect("map");

        store.put(&[1, 2, 3]).expect("put");
        store.put(&[4]).expect("put");

        assert_eq!(store.len(), 4);
        assert_eq!(store.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(store.index(2), Some(3));
        assert_eq!(store.index(4), None);
        assert_eq!(store.get_n(1, 2), &[2, 3]);
        assert_eq!(store.get_n(3, 10), &[4]);
        assert_eq!(store.get_n(4, 1), &[] as &[u64]);
    }

    #[test]
    fn put_past_capacity_fails_and_rolls_back() {
        let store = AddressStore::new(4).expect("map");

        store.put(&[1, 2, 3]).expect("put");
        assert!(store.put(&[4, 5]).is_err());
        assert_eq!(store.len(), 3);

        // The rolled back slot is reusable.
        store.put(&[4]).expect("put");
        assert_eq!(store.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn concurrent_puts_lose_nothing() {
        const WORKERS: u64 = 8;
        const PER_WORKER: u64 = 10_000;

        let store = Arc::new(AddressStore::new((WORKERS * PER_WORKER) as usize).expect("map"));

        std::thread::scope(|s| {
            for w in 0..WORKERS {
                let store = Arc::clone(&store);

                s.spawn(move || {
                    let base = w * PER_WORKER;
                    let items: Vec<u64> = (base..base + PER_WORKER).collect();

                    for chunk in items.chunks(512) {
                        store.put(chunk).expect("put");
                    }
                });
            }
        });

        assert_eq!(store.len(), (WORKERS * PER_WORKER) as usize);

        let mut all: Vec<u64> = store.as_slice().to_vec();
        all.sort_unstable();

        for (i, v) in all.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }

    #[test]
    fn clear_resets_and_allows_reuse() {
        let mut store = AddressStore::new(8).expect("map");

        store.put(&[1, 2, 3]).expect("put");
        store.clear();

        assert_eq!(store.len(), 0);

        store.put(&[9, 9]).expect("put");
        assert_eq!(store.len(), 2);
        assert_eq!(store.as_slice(), &[9, 9]);
    }

    #[test]
    fn merge_grows_the_mapping() {
        let mut store = AddressStore::new(4).expect("map");
        store.put(&[1, 2, 3]).expect("put");

        let other = AddressStore::new(16).expect("map");
        let items: Vec<u64> = (10..20).collect();
        other.put(&items).expect("put");

        store.merge(&other).expect("merge");

        assert_eq!(store.len(), 13);
        assert!(store.capacity() >= 13);
        assert_eq!(&store.as_slice()[..3], &[1, 2, 3]);
        assert_eq!(&store.as_slice()[3..], &items[..]);
    }

    #[test]
    fn merge_preserves_order_across_stores() {
        let mut total = AddressStore::new(64).expect("map");

        for base in [0u64, 100, 200] {
            let part = AddressStore::new(8).expect("map");
            part.put(&[base + 1, base + 2]).expect("put");
            total.merge(&part).expect("merge");
        }

        assert_eq!(total.as_slice(), &[1, 2, 101, 102, 201, 202]);
    }
}
