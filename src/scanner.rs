//! Streaming matcher emitting byte offsets of value hits from a region reader.

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use memchr::memmem;

use crate::token::Token;
use crate::value::{Comparable, Value};

/// Default work-chunk size for a scan pass.
pub const SCAN_BUFFER_SIZE: usize = 1 << 16;

// Lane-group widths used for chunk sizing on the float-range paths: four f32
// lanes or two f64 lanes per group.
const VECTOR_F32_SIZE: usize = 16;
const VECTOR_F64_SIZE: usize = 16;

/// Options for a single scan pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOptions {
    /// Logical size of the underlying span. When non-zero, a failed read is
    /// recovered by seeking to the next page boundary within the span. Set on
    /// refinement scans where the reader covers a virtual region that may
    /// contain unmapped pages.
    pub expected_size: u64,
}

impl ScanOptions {
    /// Seek to the first page boundary strictly past `offset`, if it is still
    /// inside the expected span.
    fn align_next_page<S: Seek>(&self, seeker: &mut S, offset: u64) -> Option<u64> {
        if self.expected_size == 0 {
            return None;
        }

        let mut next = (offset + 0xFFF) & !0xFFF;

        if next <= offset {
            next += 0x1000;
        }

        if next >= self.expected_size {
            return None;
        }

        seeker.seek(SeekFrom::Start(next)).ok()?;
        Some(next)
    }
}

enum Matcher {
    Pattern,
    RangeF32 { min: f32, max: f32 },
    RangeF64 { min: f64, max: f64 },
}

/// A scanner configured for one value, reusable across regions.
pub struct Scanner {
    value: Value,
    buf_size: usize,
    matcher: Matcher,
}

impl Scanner {
    /// Construct a scanner with the default chunk size.
    pub fn new(value: Value) -> Scanner {
        Scanner::with_buffer(value, SCAN_BUFFER_SIZE)
    }

    /// Construct a scanner with the given chunk size. The size is clamped up
    /// to hold at least one value and rounded to the stride of the selected
    /// matching path.
    pub fn with_buffer(value: Value, buf_size: usize) -> Scanner {
        let mut buf_size = buf_size.max(value.size() + 1);

        let matcher = match value.comparable() {
            Comparable::RangeF32 { min, max, .. } => {
                buf_size = round_up(buf_size, VECTOR_F32_SIZE);
                Matcher::RangeF32 { min, max }
            }
            Comparable::RangeF64 { min, max, .. } => {
                buf_size = round_up(buf_size, VECTOR_F64_SIZE);
                Matcher::RangeF64 { min, max }
            }
            Comparable::Bytes { .. } => {
                buf_size = round_up(buf_size, 4);
                Matcher::Pattern
            }
        };

        Scanner {
            value,
            buf_size,
            matcher,
        }
    }

    /// Stream the reader and hand every hit offset to the collector. The
    /// collector returns `false` to stop the pass early. Read errors are not
    /// surfaced: after an attempted page-alignment recovery the pass for this
    /// reader simply ends.
    pub fn scan_collector<R, F>(
        &self,
        reader: R,
        cancel: &Token,
        options: Option<&ScanOptions>,
        collector: F,
    ) where
        R: Read + Seek,
        F: FnMut(usize) -> bool,
    {
        match self.matcher {
            Matcher::Pattern => self.scan_bytes(reader, cancel, options, collector),
            Matcher::RangeF32 { min, max } => {
                scan_f32_range(reader, self.buf_size, min, max, cancel, options, collector)
            }
            Matcher::RangeF64 { min, max } => {
                scan_f64_range(reader, self.buf_size, min, max, cancel, options, collector)
            }
        }
    }

    /// Collect every hit offset into a vector.
    pub fn scan<R: Read + Seek>(&self, reader: R) -> Vec<usize> {
        let mut hits = Vec::new();

        self.scan_collector(reader, Token::default(), None, |offset| {
            hits.push(offset);
            true
        });

        hits
    }

    fn scan_bytes<R, F>(
        &self,
        mut reader: R,
        cancel: &Token,
        options: Option<&ScanOptions>,
        mut collector: F,
    ) where
        R: Read + Seek,
        F: FnMut(usize) -> bool,
    {
        let size = self.value.size();
        let aligned = self.value.aligned();
        let finder = memmem::Finder::new(self.value.bytes());

        let mut chunk = vec![0u8; self.buf_size + size];
        // Suffix of the previous chunk, prepended so a hit straddling the
        // chunk boundary is still found exactly once.
        let mut carry = vec![0u8; size.saturating_sub(1)];
        let mut carry_len = 0usize;
        let mut offset = 0usize;

        loop {
            if cancel.is_set() {
                return;
            }

            let forward = carry_len;
            chunk[..forward].copy_from_slice(&carry[..forward]);

            let (backward, err) =
                read_full(&mut reader, &mut chunk[forward..forward + self.buf_size]);

            // Not even one value worth of data left.
            if forward + backward < size {
                match recover(options, &mut reader, (offset + backward) as u64, &err) {
                    Some(next) => {
                        offset = next as usize;
                        carry_len = 0;
                        continue;
                    }
                    None => return,
                }
            }

            let current = &chunk[..forward + backward];
            let chunk_offset = offset - forward;

            let mut i = 0usize;

            while let Some(n) = finder.find(&current[i..]) {
                let pos = i + n;
                let final_index = chunk_offset + pos;

                if !aligned || final_index % size == 0 {
                    if !collector(final_index) {
                        return;
                    }

                    i = pos + size;
                } else {
                    // Bump to the next boundary the pattern could legally
                    // start on.
                    i = pos + (size - final_index % size);
                }
            }

            if current.len() >= size {
                carry_len = size - 1;
                carry[..carry_len].copy_from_slice(&current[current.len() - carry_len..]);
            } else {
                carry_len = current.len();
                carry[..carry_len].copy_from_slice(current);
            }

            if err.is_some() || backward < self.buf_size {
                match recover(options, &mut reader, (offset + backward) as u64, &err) {
                    Some(next) => {
                        offset = next as usize;
                        carry_len = 0;
                        continue;
                    }
                    None => return,
                }
            }

            offset += backward;
        }
    }
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Fill as much of `buf` as possible, stopping at end of stream. Returns the
/// number of bytes read and the first read error, if any.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> (usize, Option<io::Error>) {
    let mut n = 0usize;

    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (n, Some(e)),
        }
    }

    (n, None)
}

/// Page-alignment recovery. Only applies when the read actually failed (end
/// of stream is a clean stop) and the caller opted in via `expected_size`.
fn recover<S: Seek>(
    options: Option<&ScanOptions>,
    seeker: &mut S,
    offset: u64,
    err: &Option<io::Error>,
) -> Option<u64> {
    if err.is_none() {
        return None;
    }

    options?.align_next_page(seeker, offset)
}

macro_rules! scan_float_range {
    ($name:ident, $float:ty, $width:expr, $read:ident) => {
        fn $name<R, F>(
            mut reader: R,
            buf_size: usize,
            min: $float,
            max: $float,
            cancel: &Token,
            options: Option<&ScanOptions>,
            mut collector: F,
        ) where
            R: Read + Seek,
            F: FnMut(usize) -> bool,
        {
            let mut chunk = vec![0u8; buf_size];
            let mut offset = 0usize;

            loop {
                if cancel.is_set() {
                    return;
                }

                let (n, err) = read_full(&mut reader, &mut chunk);

                if n >= $width {
                    let usable = n - n % $width;

                    for (lane, bytes) in chunk[..usable].chunks_exact($width).enumerate() {
                        let v = LittleEndian::$read(bytes);

                        if v >= min && v < max {
                            if !collector(offset + lane * $width) {
                                return;
                            }
                        }
                    }
                }

                if err.is_some() || n < buf_size {
                    match recover(options, &mut reader, (offset + n) as u64, &err) {
                        Some(next) => {
                            offset = next as usize;
                            continue;
                        }
                        None => return,
                    }
                }

                offset += n;
            }
        }
    };
}

scan_float_range!(scan_f32_range, f32, 4, read_f32);
scan_float_range!(scan_f64_range, f64, 8, read_f64);
