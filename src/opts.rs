//! Session construction options.

use crate::scanner::SCAN_BUFFER_SIZE;

/// Default capacity of the result stores, sized for the largest plausible
/// first-scan hit count. Virtual address space only until hits land.
pub const RESULTS_ALLOC_CAPACITY: usize = 64 * 1024 * 1024;

const RENDER_THRESHOLD_MIN: usize = 10;
const RENDER_THRESHOLD_MAX: usize = 100;

#[derive(Debug, Clone)]
pub struct Opts {
    /// Work-chunk size handed to the streaming matcher. Clamped up by the
    /// matcher to the stride of the selected path.
    pub buf_size: usize,
    /// Initial capacity, in addresses, of the two result stores.
    pub store_capacity: usize,
    /// Results are only materialized to the caller at or below this count.
    pub render_threshold: usize,
}

impl Default for Opts {
    fn default() -> Opts {
        Opts {
            buf_size: SCAN_BUFFER_SIZE,
            store_capacity: RESULTS_ALLOC_CAPACITY,
            render_threshold: RENDER_THRESHOLD_MAX,
        }
    }
}

impl Opts {
    pub(crate) fn clamped(mut self) -> Opts {
        self.render_threshold = self
            .render_threshold
            .clamp(RENDER_THRESHOLD_MIN, RENDER_THRESHOLD_MAX);
        self
    }
}
