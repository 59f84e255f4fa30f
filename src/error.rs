use crate::ProcessId;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("anonymous mapping failed: {0}")]
    Map(#[source] Errno),
    #[error("remapping address store failed: {0}")]
    Remap(#[source] Errno),
    #[error("bad address store capacity")]
    BadCapacity,
    #[error("address store capacity exceeded")]
    CapacityExceeded,
    #[error("process {0} does not exist")]
    NoProcess(ProcessId),
}
