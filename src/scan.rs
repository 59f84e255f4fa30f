//! Scan sessions: first scan, refinement scans, undo and write-back.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use log::debug;
use rayon::prelude::*;

use crate::address_store::AddressStore;
use crate::maps::Maps;
use crate::opts::Opts;
use crate::pool;
use crate::process::{read_batch, write_batch, Process, RegionReader, IOV_MAX};
use crate::region::{optimize_regions, Region, REGION_LARGE_SIZE};
use crate::scanner::{ScanOptions, Scanner};
use crate::token::Token;
use crate::value::{Comparable, Value};
use crate::virtual_region::{build_virtual_regions, VirtualRegion};
use crate::ProcessId;

/// Capacity of the per-region buffer used during a first scan, enough for a
/// hit at every eighth byte of the largest region.
const REGION_RESULTS_CAPACITY: usize = (REGION_LARGE_SIZE / 8) as usize;

/// Hits are batched before landing in a store to amortize the atomic cursor.
const COLLECT_BATCH_SIZE: usize = 512;

const NEXT_SCAN_TASK_SIZE: usize = IOV_MAX * 32;
const NEXT_SCAN_SPARSE_THRESHOLD: usize = IOV_MAX * 32;

/// An open scan session against one target process.
///
/// The two result stores are created once and reused across scans; a
/// refinement scan fills the spare store and swaps it in, which is also what
/// makes the single level of undo an O(1) swap back.
pub struct Scan {
    thread_pool: Arc<rayon::ThreadPool>,
    opts: Opts,
    process: Option<Process>,
    maps: Option<Maps>,
    results: AddressStore,
    prev_results: AddressStore,
    round: u32,
    can_undo: bool,
    cancel: Arc<Token>,
}

impl Scan {
    /// Construct a session associated with a thread pool.
    pub fn new(thread_pool: &Arc<rayon::ThreadPool>) -> anyhow::Result<Scan> {
        Scan::with_opts(thread_pool, Opts::default())
    }

    pub fn with_opts(thread_pool: &Arc<rayon::ThreadPool>, opts: Opts) -> anyhow::Result<Scan> {
        let opts = opts.clamped();

        let results =
            AddressStore::new(opts.store_capacity).context("mapping the results store")?;
        let prev_results =
            AddressStore::new(opts.store_capacity).context("mapping the undo store")?;

        Ok(Scan {
            thread_pool: Arc::clone(thread_pool),
            opts,
            process: None,
            maps: None,
            results,
            prev_results,
            round: 0,
            can_undo: false,
            cancel: Arc::new(Token::new()),
        })
    }

    /// Attach the session to a target.
    pub fn open(&mut self, process: Process) -> anyhow::Result<()> {
        self.close();
        self.maps = Some(Maps::open(process.pid)?);
        self.process = Some(process);
        self.reset();
        Ok(())
    }

    /// Detach from the target. Outstanding workers observe the cancellation.
    pub fn close(&mut self) {
        self.cancel.set();
        self.maps = None;
        self.process = None;
    }

    /// Signal every outstanding worker to stop.
    pub fn cancel(&self) {
        self.cancel.set();
    }

    /// Drop all results and start over. Replaces the cancellation token, so
    /// workers of a previous scan cannot outlive the reset unnoticed.
    pub fn reset(&mut self) {
        self.cancel.set();
        self.cancel = Arc::new(Token::new());
        self.results.clear();
        self.prev_results.clear();
        self.round = 0;
        self.can_undo = false;
    }

    pub fn can_undo(&self) -> bool {
        self.can_undo
    }

    pub fn rounds(&self) -> u32 {
        self.round
    }

    pub fn count(&self) -> usize {
        self.results.len()
    }

    /// The surviving addresses, ascending.
    pub fn results(&self) -> &[u64] {
        self.results.as_slice()
    }

    /// Index of the given address in the result set.
    pub fn search_results(&self, address: u64) -> Option<usize> {
        self.results.as_slice().binary_search(&address).ok()
    }

    /// Swap back to the previous round's results. Consumes the undo: a second
    /// call without an intervening refinement scan returns false.
    pub fn undo_scan(&mut self) -> bool {
        if !self.can_undo {
            return false;
        }

        self.can_undo = false;
        std::mem::swap(&mut self.results, &mut self.prev_results);
        self.prev_results.clear();
        self.round -= 1;
        true
    }

    /// Sweep every scannable region of the target for the given value. The
    /// target is stopped for the duration of the sweep.
    pub fn first_scan(&mut self, value: &Value) -> Duration {
        self.reset();

        let Some(process) = self.process else {
            return Duration::ZERO;
        };

        if !process.alive() {
            self.close();
            return Duration::ZERO;
        }

        let paused = process.pause();

        let regions = match self.maps.as_mut() {
            Some(maps) => optimize_regions(&maps.parse()),
            None => Vec::new(),
        };

        let elapsed = if regions.is_empty() {
            Duration::ZERO
        } else {
            self.first_scan_regions(value, &regions)
        };

        if paused {
            process.resume();
        }

        elapsed
    }

    /// Sweep a caller-supplied region list. Does not reset the session or
    /// touch target scheduling.
    pub fn first_scan_regions(&mut self, value: &Value, regions: &[Region]) -> Duration {
        let st = Instant::now();

        let Some(process) = self.process else {
            return st.elapsed();
        };

        let pid = process.pid;
        let scanner = Scanner::with_buffer(value.clone(), self.opts.buf_size);
        let cancel = Arc::clone(&self.cancel);

        let buffers: Vec<Option<AddressStore>> = self.thread_pool.install(|| {
            regions
                .par_iter()
                .map(|region| task_first_scan(&scanner, pid, region, &cancel))
                .collect()
        });

        self.round += 1;

        // Regions are disjoint and sorted and every worker emits ascending
        // offsets, so an in-order merge keeps the result set sorted with no
        // sort pass.
        for buf in buffers.into_iter().flatten() {
            if let Err(e) = self.results.merge(&buf) {
                debug!("first scan: dropping region results: {}", e);
            }
        }

        debug!(
            "first scan: {} hits over {} regions",
            self.results.len(),
            regions.len()
        );

        st.elapsed()
    }

    /// Re-test the current survivors, keeping the addresses that still match.
    ///
    /// Large survivor sets stream consolidated spans; small ones scatter-read
    /// each address individually.
    pub fn next_scan(&mut self, value: &Value) -> Duration {
        let count = self.results.len();

        if count == 0 {
            return Duration::ZERO;
        }

        if count > NEXT_SCAN_SPARSE_THRESHOLD {
            self.next_scan_dense(value)
        } else {
            self.next_scan_sparse(value)
        }
    }

    /// Dense strategy: rebuild contiguous spans over the survivors and stream
    /// them through the matcher, gating hits on survivor membership.
    pub fn next_scan_dense(&mut self, value: &Value) -> Duration {
        let st = Instant::now();

        let Some(process) = self.process else {
            return st.elapsed();
        };

        if self.results.is_empty() {
            return st.elapsed();
        }

        let pid = process.pid;
        let scanner = Scanner::with_buffer(value.clone(), self.opts.buf_size);
        let value_size = value.size();
        let cancel = Arc::clone(&self.cancel);

        let buffers: Vec<Option<AddressStore>> = {
            let mut regions = build_virtual_regions(self.results.as_slice(), value_size as u64);

            self.thread_pool.install(|| {
                regions
                    .par_iter_mut()
                    .map(|region| task_next_scan_dense(&scanner, pid, region, value_size, &cancel))
                    .collect()
            })
        };

        self.finish_next_scan(buffers);
        st.elapsed()
    }

    /// Sparse strategy: scatter-read each survivor in syscall-sized batches
    /// and compare in user space.
    pub fn next_scan_sparse(&mut self, value: &Value) -> Duration {
        let st = Instant::now();

        let Some(process) = self.process else {
            return st.elapsed();
        };

        if self.results.is_empty() {
            return st.elapsed();
        }

        let pid = process.pid;
        let comp = value.comparable();
        let cancel = Arc::clone(&self.cancel);

        let buffers: Vec<Option<AddressStore>> = {
            let data = self.results.as_slice();

            self.thread_pool.install(|| {
                data.par_chunks(NEXT_SCAN_TASK_SIZE)
                    .map(|addresses| task_next_scan_sparse(pid, addresses, &comp, &cancel))
                    .collect()
            })
        };

        self.finish_next_scan(buffers);
        st.elapsed()
    }

    fn finish_next_scan(&mut self, buffers: Vec<Option<AddressStore>>) {
        self.round += 1;
        self.can_undo = true;

        self.prev_results.clear();

        for buf in buffers.into_iter().flatten() {
            if let Err(e) = self.prev_results.merge(&buf) {
                debug!("next scan: dropping task results: {}", e);
            }
        }

        std::mem::swap(&mut self.results, &mut self.prev_results);
    }

    /// Write `value` over the results selected by `indexes`. An empty index
    /// list means all results, provided the set is small enough to have been
    /// rendered to the caller.
    pub fn change_results(&self, indexes: &[usize], value: &Value) {
        let n = self.results.len();

        if n == 0 {
            return;
        }

        if indexes.is_empty() {
            if n <= self.opts.render_threshold {
                self.change_values(self.results.as_slice(), value);
            }

            return;
        }

        let mut addresses = Vec::with_capacity(indexes.len());

        for &idx in indexes {
            if let Some(addr) = self.results.index(idx) {
                addresses.push(addr);
            }
        }

        if !addresses.is_empty() {
            self.change_values(&addresses, value);
        }
    }

    /// Write `value` at each address, chunked by the scatter-vector limit.
    pub fn change_values(&self, addresses: &[u64], value: &Value) {
        let Some(process) = self.process else {
            return;
        };

        for chunk in addresses.chunks(IOV_MAX) {
            write_batch(process.pid, chunk, value);
        }
    }

    /// Read back the current value at every result and format the rows as
    /// (zero-padded uppercase hex address, decoded value).
    pub fn render_results(&self, value: &Value) -> Vec<(String, String)> {
        let Some(process) = self.process else {
            return Vec::new();
        };

        let count = self.results.len();

        if count == 0 || count > self.opts.render_threshold {
            return Vec::new();
        }

        let value_size = value.size();

        if value_size == 0 {
            return Vec::new();
        }

        let mut buf = pool::read_buffer(count * value_size);
        let data = self.results.as_slice();

        read_batch(
            process.pid,
            data,
            value_size,
            value.disturb_byte(),
            &mut buf[..count * value_size],
        );

        let mut scratch = value.clone();
        let mut rows = Vec::with_capacity(count);

        for (i, addr) in data.iter().enumerate() {
            let offset = i * value_size;
            scratch.set_bytes(&buf[offset..offset + value_size]);
            rows.push((format!("{:08X}", addr), scratch.format()));
        }

        rows
    }
}

impl fmt::Display for Scan {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.process.is_none() {
            return write!(fmt, "no open process");
        }

        write!(fmt, "scan #{}, {} results", self.round, self.count())
    }
}

fn task_first_scan(
    scanner: &Scanner,
    pid: ProcessId,
    region: &Region,
    cancel: &Token,
) -> Option<AddressStore> {
    let buf = match AddressStore::new(REGION_RESULTS_CAPACITY) {
        Ok(buf) => buf,
        Err(e) => {
            debug!("region {:08X}-{:08X}: {}", region.start, region.end, e);
            return None;
        }
    };

    let mut batch = [0u64; COLLECT_BATCH_SIZE];
    let mut count = 0usize;
    let mut truncated = false;

    let reader = RegionReader::new(pid, region.start, region.end);

    scanner.scan_collector(reader, cancel, None, |offset| {
        batch[count] = region.start + offset as u64;
        count += 1;

        if count == COLLECT_BATCH_SIZE {
            count = 0;

            if buf.put(&batch).is_err() {
                truncated = true;
                return false;
            }
        }

        true
    });

    if count > 0 && buf.put(&batch[..count]).is_err() {
        truncated = true;
    }

    if truncated {
        debug!(
            "region {:08X}-{:08X}: result buffer full, contribution truncated",
            region.start, region.end
        );
    }

    if buf.is_empty() {
        None
    } else {
        Some(buf)
    }
}

fn task_next_scan_dense(
    scanner: &Scanner,
    pid: ProcessId,
    region: &mut VirtualRegion<'_>,
    value_size: usize,
    cancel: &Token,
) -> Option<AddressStore> {
    let capacity = (region.size as usize / value_size).max(1);
    let buf = AddressStore::new(capacity).ok()?;

    let mut batch = [0u64; COLLECT_BATCH_SIZE];
    let mut count = 0usize;

    let reader = RegionReader::new(pid, region.start, region.end);
    let start = region.start;

    let options = ScanOptions {
        expected_size: region.size,
    };

    scanner.scan_collector(reader, cancel, Some(&options), |offset| {
        let address = start + offset as u64;

        if region.matches(address) {
            batch[count] = address;
            count += 1;

            if count == COLLECT_BATCH_SIZE {
                count = 0;

                if buf.put(&batch).is_err() {
                    return false;
                }
            }

            // Stop as soon as this span's survivors are exhausted.
            return !region.is_finished();
        }

        true
    });

    if count > 0 {
        let _ = buf.put(&batch[..count]);
    }

    if buf.is_empty() {
        None
    } else {
        Some(buf)
    }
}

fn task_next_scan_sparse(
    pid: ProcessId,
    addresses: &[u64],
    comp: &Comparable,
    cancel: &Token,
) -> Option<AddressStore> {
    if cancel.is_set() {
        return None;
    }

    let results = AddressStore::new(NEXT_SCAN_TASK_SIZE).ok()?;

    let value_size = comp.size();
    let disturb = comp.disturb_byte();
    let mut read_buffer = pool::read_buffer(IOV_MAX * value_size);

    let mut batch = [0u64; COLLECT_BATCH_SIZE];
    let mut count = 0usize;

    for sub in addresses.chunks(IOV_MAX) {
        if cancel.is_set() {
            break;
        }

        read_batch(
            pid,
            sub,
            value_size,
            disturb,
            &mut read_buffer[..sub.len() * value_size],
        );

        for (i, address) in sub.iter().enumerate() {
            let offset = i * value_size;

            if comp.equal_bytes(&read_buffer[offset..offset + value_size]) {
                batch[count] = *address;
                count += 1;

                if count == COLLECT_BATCH_SIZE {
                    count = 0;
                    // Cannot overflow: the store is sized for the whole task.
                    let _ = results.put(&batch);
                }
            }
        }
    }

    if count > 0 {
        let _ = results.put(&batch[..count]);
    }

    if results.is_empty() {
        None
    } else {
        Some(results)
    }
}
