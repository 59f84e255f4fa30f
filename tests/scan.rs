//! End-to-end scan sessions against this process's own memory.
//!
//! The test process doubles as the scan target: scatter reads and writes work
//! on one's own pid, and handing the session a crafted region list keeps the
//! hit sets deterministic.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use procscan::{FloatOption, Opts, Process, ProcessId, Region, Scan, Value, PAGE_SIZE};

fn own_pid() -> ProcessId {
    std::process::id() as ProcessId
}

fn thread_pool() -> Arc<rayon::ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .expect("thread pool"),
    )
}

fn session(store_capacity: usize) -> Scan {
    let pool = thread_pool();

    let mut scan = Scan::with_opts(
        &pool,
        Opts {
            store_capacity,
            ..Opts::default()
        },
    )
    .expect("session");

    scan.open(Process::new(own_pid())).expect("open");
    scan
}

/// A page-aligned chunk of this process's memory posing as target memory.
struct Target {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Target {
    fn new(len: usize) -> Target {
        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).expect("non-zero length"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .expect("mmap");

        Target { ptr, len }
    }

    fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn bytes(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.bytes()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn region(&self) -> Region {
        Region {
            start: self.base(),
            end: self.base() + self.len as u64,
            size: self.len as u64,
            ..Region::default()
        }
    }

    /// Unmap one page inside the chunk, leaving a hole.
    fn punch_hole(&mut self, page: usize) {
        let addr = unsafe { self.ptr.as_ptr().add(page * PAGE_SIZE as usize) };
        let addr = NonNull::new(addr).expect("non-null");

        unsafe {
            munmap(addr, PAGE_SIZE as usize).expect("munmap hole");
        }
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

#[test]
fn first_scan_finds_exact_hits() {
    let mut scan = session(1 << 16);
    let mut target = Target::new(PAGE_SIZE as usize);

    // 00 00 00 00 | 2A 00 00 00 | 2A 00 00 00 | 00 00 00 00
    target.write_i32(4, 42);
    target.write_i32(8, 42);

    let b = target.base();

    scan.first_scan_regions(&Value::from_i32(42), &[target.region()]);

    assert_eq!(scan.count(), 2);
    assert_eq!(scan.results(), &[b + 4, b + 8]);
    assert_eq!(scan.rounds(), 1);
    assert!(!scan.can_undo());

    assert_eq!(scan.search_results(b + 8), Some(1));
    assert_eq!(scan.search_results(b + 12), None);
}

#[test]
fn next_scan_narrows_and_undo_restores() {
    let mut scan = session(1 << 16);
    let mut target = Target::new(PAGE_SIZE as usize);

    target.write_i32(4, 42);
    target.write_i32(8, 42);

    let b = target.base();
    let value = Value::from_i32(42);

    scan.first_scan_regions(&value, &[target.region()]);
    assert_eq!(scan.count(), 2);

    // One survivor stops matching.
    target.write_i32(4, 1);

    scan.next_scan(&value);
    assert_eq!(scan.count(), 1);
    assert_eq!(scan.results(), &[b + 8]);
    assert!(scan.can_undo());
    assert_eq!(scan.rounds(), 2);

    assert!(scan.undo_scan());
    assert_eq!(scan.count(), 2);
    assert_eq!(scan.results(), &[b + 4, b + 8]);
    assert!(!scan.can_undo());
    assert_eq!(scan.rounds(), 1);

    // The undo is consumed.
    assert!(!scan.undo_scan());
}

#[test]
fn change_and_render_round_trip() {
    let mut scan = session(1 << 16);
    let mut target = Target::new(PAGE_SIZE as usize);

    target.write_i32(4, 42);
    target.write_i32(8, 42);

    let b = target.base();
    let value = Value::from_i32(42);

    scan.first_scan_regions(&value, &[target.region()]);

    target.write_i32(4, 1);
    scan.next_scan(&value);
    assert_eq!(scan.results(), &[b + 8]);

    // Overwrite every remaining result, then read the values back.
    let zero = Value::from_i32(0);
    scan.change_results(&[], &zero);

    let rows = scan.render_results(&zero);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, format!("{:08X}", b + 8));
    assert_eq!(rows[0].1, "0");

    assert_eq!(&target.bytes()[8..12], &[0, 0, 0, 0]);
}

#[test]
fn million_hits_stay_sorted_and_unique() {
    const REGIONS: usize = 16;
    const WORDS_PER_REGION: usize = 62_500;
    const REGION_LEN: usize = 1 << 18;

    let mut targets: Vec<Target> = (0..REGIONS).map(|_| Target::new(REGION_LEN)).collect();

    for target in &mut targets {
        for i in 0..WORDS_PER_REGION {
            target.write_i32(i * 4, 1);
        }
    }

    targets.sort_by_key(|t| t.base());

    let regions: Vec<Region> = targets.iter().map(|t| t.region()).collect();

    let mut scan = session(2 << 20);
    let value = Value::from_i32(1);

    scan.first_scan_regions(&value, &regions);

    assert_eq!(scan.count(), REGIONS * WORDS_PER_REGION);

    let results = scan.results();

    for pair in results.windows(2) {
        assert!(pair[0] < pair[1], "unsorted or duplicate result");
    }

    // Flip everything to zero except one address, then refine. The survivor
    // count forces the dense strategy.
    let keep = targets[7].base() + 1234 * 4;

    for target in &mut targets {
        target.bytes().fill(0);
    }

    let keep_target = targets.iter_mut().find(|t| t.base() <= keep && keep < t.base() + REGION_LEN as u64);
    keep_target
        .expect("target containing kept address")
        .write_i32(1234 * 4, 1);

    let elapsed = scan.next_scan(&value);

    assert_eq!(scan.count(), 1);
    assert_eq!(scan.results(), &[keep]);
    assert!(elapsed > std::time::Duration::ZERO);
}

#[test]
fn dense_scan_survives_unmapped_page() {
    const PAGES: usize = 3;

    let mut scan = session(1 << 16);
    let mut target = Target::new(PAGES * PAGE_SIZE as usize);

    let words = PAGES * PAGE_SIZE as usize / 4;

    for i in 0..words {
        target.write_i32(i * 4, 7);
    }

    let value = Value::from_i32(7);
    scan.first_scan_regions(&value, &[target.region()]);
    assert_eq!(scan.count(), words);

    target.punch_hole(1);

    // The dense strategy streams straight over the hole and recovers at the
    // next page; the hole's survivors drop, the rest stay.
    scan.next_scan_dense(&value);

    let b = target.base();
    let page = PAGE_SIZE;

    assert_eq!(scan.count(), words * 2 / 3);
    assert!(scan.results().iter().all(|a| *a < b + page || *a >= b + 2 * page));

    // The sparse strategy sees the same survivor set.
    assert!(scan.undo_scan());
    assert_eq!(scan.count(), words);

    scan.next_scan_sparse(&value);
    assert_eq!(scan.count(), words * 2 / 3);
}

#[test]
fn float_rounded_scan_end_to_end() {
    let mut scan = session(1 << 16);
    let mut target = Target::new(PAGE_SIZE as usize);

    let values = [99.0f32, 99.5, 100.0, 100.2, 100.5, 100.8, 101.0, 102.0];

    for (i, v) in values.iter().enumerate() {
        target.bytes()[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }

    let b = target.base();

    scan.first_scan_regions(
        &Value::from_f32(100.0, FloatOption::Rounded),
        &[target.region()],
    );

    assert_eq!(scan.results(), &[b + 4, b + 8, b + 12]);
}

#[test]
fn change_values_writes_selected_indexes() {
    let mut scan = session(1 << 16);
    let mut target = Target::new(PAGE_SIZE as usize);

    target.write_i32(0, 5);
    target.write_i32(16, 5);
    target.write_i32(32, 5);

    let value = Value::from_i32(5);
    scan.first_scan_regions(&value, &[target.region()]);
    assert_eq!(scan.count(), 3);

    // Only the middle result changes.
    scan.change_results(&[1], &Value::from_i32(-9));

    let bytes = target.bytes();
    assert_eq!(&bytes[0..4], &5i32.to_le_bytes());
    assert_eq!(&bytes[16..20], &(-9i32).to_le_bytes());
    assert_eq!(&bytes[32..36], &5i32.to_le_bytes());
}
