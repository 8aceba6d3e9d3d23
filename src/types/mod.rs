/// synchronization primitives wrappers
mod sync;
pub use sync::{AtomicBool, AtomicUsize, Mutex};

/// vertex identifier, dense in `[0, num_vertices)`
pub type VertexId = u64;
/// index of a worker thread (start from 0)
pub type WorkerId = usize;
/// iteration number of the bulk-synchronous loop (start from 0)
pub type Level = usize;
/// timestamp inside a time-series vertex record
pub type Timestamp = u32;

/// granularity of device access; vertex records are read on page boundaries
pub const PAGE_SIZE: usize = 4096;

/// round a byte offset down to its page start
pub const fn round_page(off: u64) -> u64 {
    off - off % PAGE_SIZE as u64
}

/// round a byte offset up to the next page boundary
pub const fn roundup_page(off: u64) -> u64 {
    round_page(off + PAGE_SIZE as u64 - 1)
}
