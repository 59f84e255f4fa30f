//! Core engine for interactively scanning the memory of another process.
//!
//! A scan session sweeps the writable regions of a target for a typed value,
//! then narrows the surviving address set across refinement scans until few
//! enough results remain to inspect or overwrite.

mod address_store;
mod error;
mod maps;
pub mod opts;
mod pool;
mod process;
mod region;
mod scan;
mod scanner;
mod token;
mod value;
mod virtual_region;

pub type ProcessId = i32;

pub use self::address_store::AddressStore;
pub use self::error::Error;
pub use self::maps::Maps;
pub use self::opts::Opts;
pub use self::process::{read_batch, write_batch, Process, RegionReader, IOV_MAX};
pub use self::region::{
    optimize_regions, Permissions, Region, RegionType, PAGE_SIZE, REGION_LARGE_SIZE,
    REGION_SMALL_SIZE,
};
pub use self::scan::Scan;
pub use self::scanner::{ScanOptions, Scanner, SCAN_BUFFER_SIZE};
pub use self::token::Token;
pub use self::value::{Comparable, FloatOption, Type, Value};
pub use self::virtual_region::{build_virtual_regions, VirtualRegion};
