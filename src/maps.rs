//! Enumeration of scannable regions from the kernel's per-process map file.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use log::debug;

use crate::error::Error;
use crate::region::{Region, RegionType};
use crate::ProcessId;

const DEF_REGIONS_CAPACITY: usize = 1 << 11;

/// Mappings that are never worth scanning: system libraries, the DRI device,
/// kernel-provided pages and the Steam bootstrap runtimes.
const EXCLUDED_PREFIXES: &[&str] = &["/usr/lib", "/usr/lib32", "/usr/lib64", "/lib", "/dev/dri"];
const EXCLUDED_NAMES: &[&str] = &["[vvar]", "[vdso]"];

fn excluded(filename: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|p| filename.starts_with(p))
        || EXCLUDED_NAMES.contains(&filename)
        || filename.contains("Steam/ubuntu12_32")
        || filename.contains("Steam/ubuntu12_64")
}

/// An open handle on the target's memory map listing.
///
/// The handle is kept open for the lifetime of the session; each parse seeks
/// back to the start and reads the current listing.
pub struct Maps {
    file: File,
    exe: Option<PathBuf>,
}

impl Maps {
    pub fn open(pid: ProcessId) -> Result<Maps, Error> {
        let file = File::open(format!("/proc/{}/maps", pid)).map_err(|_| Error::NoProcess(pid))?;
        let exe = std::fs::read_link(format!("/proc/{}/exe", pid)).ok();

        Ok(Maps { file, exe })
    }

    /// Parse the scannable regions out of the current listing.
    pub fn parse(&mut self) -> Vec<Region> {
        if self.file.seek(SeekFrom::Start(0)).is_err() {
            return Vec::new();
        }

        let exe = self.exe.clone();
        let regions = parse_regions(BufReader::new(&self.file), exe.as_deref());
        debug!("maps: {} scannable regions", regions.len());
        regions
    }
}

fn parse_regions<R: BufRead>(reader: R, exe: Option<&Path>) -> Vec<Region> {
    let mut regions = Vec::with_capacity(DEF_REGIONS_CAPACITY);
    let mut bases: HashMap<String, u64> = HashMap::new();

    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };

        let Some(mut region) = Region::parse(&line) else {
            continue;
        };

        region.ty = classify(&region, exe);

        if !selectable(&region) {
            continue;
        }

        if !region.filename.is_empty() {
            region.base_addr = *bases
                .entry(region.filename.clone())
                .or_insert(region.start);
        }

        regions.push(region);
    }

    regions
}

fn classify(region: &Region, exe: Option<&Path>) -> RegionType {
    match region.filename.as_str() {
        "[heap]" => RegionType::Heap,
        "[stack]" => RegionType::Stack,
        name if exe.map(|e| e == Path::new(name)).unwrap_or(false) => RegionType::Exe,
        name if name.starts_with('/') => RegionType::Code,
        _ => RegionType::Misc,
    }
}

fn selectable(region: &Region) -> bool {
    let perm = region.perm;

    if !perm.read() || !perm.write() || perm.exec() {
        return false;
    }

    if excluded(&region.filename) {
        return false;
    }

    // Shared mappings only matter when they are the target's own data: heap,
    // stack, anonymous memory or the executable image itself.
    if !perm.private() {
        let anonymous = region.filename.is_empty();

        if !(anonymous || matches!(region.ty, RegionType::Heap | RegionType::Stack | RegionType::Exe))
        {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LISTING: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/target
00651000-00652000 r--p 00051000 08:02 173521 /usr/bin/target
00652000-00655000 rw-p 00052000 08:02 173521 /usr/bin/target
00e33000-00e58000 rw-p 00000000 00:00 0 [heap]
7f2e50000000-7f2e50021000 rw-p 00000000 00:00 0
7f2e5c000000-7f2e5c200000 rw-p 00000000 08:02 99 /usr/lib/x86_64-linux-gnu/libc.so.6
7f2e5d000000-7f2e5d004000 rw-s 00000000 00:06 88 /dev/dri/card0
7f2e5e000000-7f2e5e010000 rw-s 00000000 00:01 55 /memfd:shared (deleted)
7ffc60000000-7ffc60021000 rw-p 00000000 00:00 0 [stack]
7ffc600fe000-7ffc60100000 r--p 00000000 00:00 0 [vvar]
7ffc60100000-7ffc60102000 r-xp 00000000 00:00 0 [vdso]
";

    #[test]
    fn selects_writable_private_regions() {
        let exe = PathBuf::from("/usr/bin/target");
        let regions = parse_regions(Cursor::new(LISTING), Some(exe.as_path()));

        let names: Vec<&str> = regions.iter().map(|r| r.filename.as_str()).collect();

        assert_eq!(
            names,
            vec!["/usr/bin/target", "[heap]", "", "[stack]"],
            "{:?}",
            regions
        );
    }

    #[test]
    fn classifies_regions() {
        let exe = PathBuf::from("/usr/bin/target");
        let regions = parse_regions(Cursor::new(LISTING), Some(exe.as_path()));

        assert_eq!(regions[0].ty, RegionType::Exe);
        assert_eq!(regions[1].ty, RegionType::Heap);
        assert_eq!(regions[2].ty, RegionType::Misc);
        assert_eq!(regions[3].ty, RegionType::Stack);
    }

    #[test]
    fn records_module_base_address() {
        let exe = PathBuf::from("/usr/bin/target");
        let listing = "\
00650000-00652000 rw-p 00000000 08:02 173521 /usr/bin/target
00660000-00670000 rw-p 00010000 08:02 173521 /usr/bin/target
";
        let regions = parse_regions(Cursor::new(listing), Some(exe.as_path()));

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].base_addr, 0x650000);
        assert_eq!(regions[1].base_addr, 0x650000);
    }

    #[test]
    fn shared_non_target_mappings_are_skipped() {
        let listing = "\
7f00000000-7f00002000 rw-s 00000000 00:01 55 /tmp/some-shared-file
7f00002000-7f00004000 rw-s 00000000 00:00 0
";
        let regions = parse_regions(Cursor::new(listing), None);

        // The file-backed shared mapping goes, the anonymous one stays.
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].filename, "");
    }
}
