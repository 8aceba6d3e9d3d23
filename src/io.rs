use crate::{compute::ComputeKey, error::EngineError};

/// a read of one byte range of the graph file
#[derive(Clone, Debug)]
pub struct IoRequest {
    /// absolute byte offset
    pub offset: u64,
    /// length in bytes
    pub len: usize,
    /// user compute the completion belongs to; `None` for raw loads
    pub compute: Option<ComputeKey>,
}

/// a finished read
#[derive(Debug)]
pub struct IoCompletion {
    /// offset of the originating request
    pub offset: u64,
    /// compute the data belongs to
    pub compute: Option<ComputeKey>,
    /// the bytes read; ranges past end of file come back zero-filled
    pub data: Vec<u8>,
}

/// cumulative counters a backend reports at shutdown
#[derive(Clone, Copy, Debug, Default)]
pub struct IoStats {
    /// completed read requests
    pub reads: usize,
    /// bytes moved
    pub bytes_read: u64,
}

/// the asynchronous block-I/O contract the engine consumes. Submission
/// enqueues without waiting for the device; completions surface only
/// through `wait`, polled by the submitting worker. Striping across
/// physical files and retry of transient faults are the backend's
/// business and invisible here.
pub trait IoBackend: Send {
    /// enqueue requests, draining the vector
    fn submit(&mut self, reqs: &mut Vec<IoRequest>) -> Result<(), EngineError>;

    /// block until at least `min_complete` outstanding requests finish
    /// (clamped to the number outstanding), appending completions to
    /// `out`; may deliver more than asked. Returns the number appended.
    fn wait(
        &mut self,
        min_complete: usize,
        out: &mut Vec<IoCompletion>,
    ) -> Result<usize, EngineError>;

    /// requests submitted but not yet returned
    fn pending(&self) -> usize;

    /// size of the underlying file in bytes
    fn file_size(&self) -> u64;

    /// cumulative statistics
    fn stats(&self) -> IoStats {
        IoStats::default()
    }
}

/// opens one backend instance per worker
pub trait IoFactory: Send + Sync {
    /// create the backend a worker will drive
    fn open(&self, worker: usize) -> Result<Box<dyn IoBackend>, EngineError>;
}

/// synchronous convenience read for headers and index loading; only
/// valid on a backend with no unrelated requests outstanding
pub fn read_sync(
    io: &mut dyn IoBackend,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, EngineError> {
    let mut reqs = vec![IoRequest {
        offset,
        len,
        compute: None,
    }];
    io.submit(&mut reqs)?;
    let mut out = Vec::with_capacity(1);
    loop {
        io.wait(1, &mut out)?;
        if let Some(at) = out
            .iter()
            .position(|c| c.offset == offset && c.compute.is_none())
        {
            return Ok(out.swap_remove(at).data);
        }
        if io.pending() == 0 {
            return Err(EngineError::Protocol(
                "backend lost a submitted request".into(),
            ));
        }
    }
}
